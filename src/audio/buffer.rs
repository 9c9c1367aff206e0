//! # Audio Frames and Block Buffering
//!
//! Two pieces live here:
//! - **AudioFrame**: an immutable run of float samples tagged with its sample
//!   rate and channel count. This is what the codec produces on decode and what
//!   the playback scheduler places on its timeline.
//! - **BlockBuffer**: turns whatever the microphone delivers (any rate, any
//!   channel count, any callback size) into fixed-size mono blocks at the
//!   capture rate, in capture order.

use crate::error::{AppError, AppResult};
use rubato::{
    FftFixedIn, Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use std::sync::Arc;

/// Immutable audio samples with their format.
///
/// Samples are interleaved when `channels > 1`. The sample vector is shared
/// through an `Arc` so a frame can sit in the scheduler's bookkeeping and the
/// device mixer at the same time without copying.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    /// Build a frame, enforcing the frame invariants:
    /// - at least one sample
    /// - sample count is a whole number of channel frames
    /// - positive sample rate and channel count
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> AppResult<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(AppError::MalformedAudioData(format!(
                "invalid format: {} Hz, {} channels",
                sample_rate, channels
            )));
        }
        if samples.is_empty() {
            return Err(AppError::MalformedAudioData("frame has no samples".to_string()));
        }
        if samples.len() % channels as usize != 0 {
            return Err(AppError::MalformedAudioData(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }

        Ok(Self {
            samples: samples.into(),
            sample_rate,
            channels,
        })
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Playback duration in seconds.
    ///
    /// ## Calculation:
    /// Duration = frames / sample_rate
    pub fn duration_secs(&self) -> f64 {
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// Mono view of the frame (channels averaged).
    pub fn to_mono(&self) -> Vec<f32> {
        downmix(self.samples(), self.channels() as usize)
    }
}

/// Average interleaved channels into one.
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample one complete mono buffer to exactly `out_len` samples.
///
/// Used for whole playback buffers, where there is no neighbouring buffer to
/// carry filter state from. The sinc filter's delay is skipped and its tail
/// flushed, so the output lines up with the input. `out_len` is chosen by the
/// caller so consecutive buffers tile the device timeline without rounding
/// gaps.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32, out_len: usize) -> AppResult<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        let mut out = samples.to_vec();
        out.resize(out_len, 0.0);
        return Ok(out);
    }

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, samples.len(), 1)?;
    let delay = resampler.output_delay();

    let mut out = resampler
        .process(&[samples], None)?
        .into_iter()
        .next()
        .unwrap_or_default();

    while out.len() < delay + out_len {
        let tail = resampler
            .process_partial::<Vec<f32>>(None, None)?
            .into_iter()
            .next()
            .unwrap_or_default();
        if tail.is_empty() {
            break;
        }
        out.extend(tail);
    }

    let mut out: Vec<f32> = out.into_iter().skip(delay).take(out_len).collect();
    out.resize(out_len, 0.0);
    Ok(out)
}

/// Accumulates device samples into fixed-size capture blocks.
///
/// ## Processing per `push`:
/// 1. Downmix interleaved device channels to mono
/// 2. Resample from the device rate to the target rate with an FFT resampler
///    that low-passes below the target Nyquist; device samples wait in
///    `input` until a full resampler chunk is available
/// 3. Append to the pending block; every time it reaches `block_size`
///    samples, hand the block out
///
/// Blocks come out strictly in the order their samples went in.
pub struct BlockBuffer {
    block_size: usize,
    source_channels: usize,
    resampler: Option<FftFixedIn<f32>>,
    input: Vec<f32>,
    pending: Vec<f32>,
}

impl BlockBuffer {
    pub fn new(
        block_size: usize,
        source_rate: u32,
        source_channels: u16,
        target_rate: u32,
    ) -> AppResult<Self> {
        let resampler = if source_rate == target_rate {
            None
        } else {
            // 20 ms of device audio per resampler chunk
            let chunk_size = (source_rate as usize / 50).max(1);
            Some(FftFixedIn::<f32>::new(
                source_rate as usize,
                target_rate as usize,
                chunk_size,
                2,
                1,
            )?)
        };

        Ok(Self {
            block_size,
            source_channels: source_channels.max(1) as usize,
            resampler,
            input: Vec::new(),
            pending: Vec::with_capacity(block_size),
        })
    }

    /// Number of samples waiting for the current block to fill.
    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed raw interleaved device samples; returns every block completed by them.
    pub fn push(&mut self, device_samples: &[f32]) -> AppResult<Vec<Vec<f32>>> {
        let mono = downmix(device_samples, self.source_channels);
        let converted = match self.resampler.as_mut() {
            None => mono,
            Some(resampler) => {
                self.input.extend_from_slice(&mono);
                let mut out = Vec::new();
                while self.input.len() >= resampler.input_frames_next() {
                    let chunk: Vec<f32> = self.input.drain(..resampler.input_frames_next()).collect();
                    let resampled = resampler.process(&[chunk], None)?;
                    out.extend(resampled.into_iter().flatten());
                }
                out
            }
        };

        let mut blocks = Vec::new();
        for sample in converted {
            self.pending.push(sample);
            if self.pending.len() == self.block_size {
                blocks.push(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.block_size),
                ));
            }
        }
        Ok(blocks)
    }
}

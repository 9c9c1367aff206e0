//! cpal-backed microphone and speaker.
//!
//! Each device keeps its cpal stream on a [`StreamThread`]. The microphone
//! forwards raw callback data to whatever sample callback is installed; the
//! speaker runs a small mixer that plays scheduled voices against a sample
//! counter, which doubles as the device clock.

use crate::audio::buffer::{resample, AudioFrame};
use crate::audio::codec::PCM16_SCALE;
use crate::device::{
    DeviceManager, DeviceSelection, ErrorCallback, InputDevice, OutputDevice, SampleCallback,
    StreamFormat, StreamThread, VoiceId,
};
use crate::error::{AppError, AppResult};
use cpal::traits::DeviceTrait;
use cpal::SampleFormat;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Microphone opened through cpal.
pub struct CpalInput {
    selection: DeviceSelection,
    preferred_rate: u32,
    device_name: String,
    stream: Option<StreamThread>,
    sink: Arc<Mutex<Option<SampleCallback>>>,
}

impl CpalInput {
    pub fn new(selection: DeviceSelection, preferred_rate: u32) -> Self {
        Self {
            selection,
            preferred_rate,
            device_name: "unopened input".to_string(),
            stream: None,
            sink: Arc::new(Mutex::new(None)),
        }
    }

    fn deliver(sink: &Mutex<Option<SampleCallback>>, samples: &[f32]) {
        if let Some(callback) = lock(sink).as_mut() {
            callback(samples);
        }
    }
}

impl InputDevice for CpalInput {
    fn name(&self) -> String {
        self.device_name.clone()
    }

    fn acquire(&mut self, on_error: ErrorCallback) -> AppResult<StreamFormat> {
        if self.stream.is_some() {
            return Err(AppError::InvalidState("microphone already acquired".to_string()));
        }

        let device = DeviceManager::input_device(&self.selection)?;
        self.device_name = device.name().unwrap_or_else(|_| "unknown input".to_string());
        let chosen = DeviceManager::input_config(&device, self.preferred_rate)?;
        info!(
            device = %self.device_name,
            sample_rate = chosen.sample_rate,
            channels = chosen.channels,
            "Opening microphone"
        );

        let sink = Arc::clone(&self.sink);
        let stream = StreamThread::spawn("microphone", move || {
            let config = chosen.stream_config();
            let report = move |err: cpal::StreamError| on_error(err.to_string());
            let stream = match chosen.format {
                SampleFormat::F32 => device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| Self::deliver(&sink, data),
                    report,
                    None,
                )?,
                SampleFormat::I16 => {
                    let mut scratch = Vec::new();
                    device.build_input_stream(
                        &config,
                        move |data: &[i16], _: &cpal::InputCallbackInfo| {
                            scratch.clear();
                            scratch.extend(data.iter().map(|&s| s as f32 / PCM16_SCALE));
                            Self::deliver(&sink, &scratch);
                        },
                        report,
                        None,
                    )?
                }
                other => {
                    return Err(AppError::DeviceUnavailable(format!(
                        "Unsupported input sample format {:?}",
                        other
                    )))
                }
            };
            Ok(stream)
        })?;

        self.stream = Some(stream);
        Ok(chosen.format())
    }

    fn start(&mut self, on_samples: SampleCallback) -> AppResult<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| AppError::InvalidState("microphone not acquired".to_string()))?;
        *lock(&self.sink) = Some(on_samples);
        stream.play()
    }

    fn release(&mut self) {
        *lock(&self.sink) = None;
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown();
            debug!(device = %self.device_name, "Microphone released");
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.release();
    }
}

struct Voice {
    id: VoiceId,
    start_frame: u64,
    /// Mono samples at the device rate
    samples: Arc<[f32]>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Voices scheduled on the speaker plus the number of frames rendered so far.
#[derive(Default)]
struct MixerState {
    position: u64,
    voices: Vec<Voice>,
}

impl MixerState {
    /// Add a voice no earlier than the current position. Returns the frame it
    /// will actually start on.
    ///
    /// A voice that has to move later is re-cut to
    /// `round(start + duration_frames) - start` samples, keeping the next
    /// voice's rounded start adjacent to its end.
    fn place(&mut self, id: VoiceId, start_frame: u64, duration_frames: f64, samples: Arc<[f32]>) -> u64 {
        if start_frame >= self.position {
            self.voices.push(Voice {
                id,
                start_frame,
                samples,
            });
            return start_frame;
        }

        let start_frame = self.position;
        let end_frame = (start_frame as f64 + duration_frames).round() as u64;
        let mut recut = samples.to_vec();
        recut.resize((end_frame - start_frame).max(1) as usize, 0.0);
        self.voices.push(Voice {
            id,
            start_frame,
            samples: recut.into(),
        });
        start_frame
    }

    /// Render interleaved output and advance the clock.
    fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        for (i, frame) in out.chunks_mut(channels).enumerate() {
            let pos = self.position + i as u64;
            let mut mixed = 0.0f32;
            for voice in &self.voices {
                if pos >= voice.start_frame && pos < voice.end_frame() {
                    mixed += voice.samples[(pos - voice.start_frame) as usize];
                }
            }
            let mixed = mixed.clamp(-1.0, 1.0);
            for sample in frame.iter_mut() {
                *sample = mixed;
            }
        }

        self.position += (out.len() / channels) as u64;
        let position = self.position;
        self.voices.retain(|voice| voice.end_frame() > position);
    }
}

/// Speaker opened through cpal.
pub struct CpalOutput {
    selection: DeviceSelection,
    preferred_rate: u32,
    device_name: String,
    format: Option<StreamFormat>,
    stream: Option<StreamThread>,
    mixer: Arc<Mutex<MixerState>>,
}

impl CpalOutput {
    pub fn new(selection: DeviceSelection, preferred_rate: u32) -> Self {
        Self {
            selection,
            preferred_rate,
            device_name: "unopened output".to_string(),
            format: None,
            stream: None,
            mixer: Arc::new(Mutex::new(MixerState::default())),
        }
    }
}

impl OutputDevice for CpalOutput {
    fn name(&self) -> String {
        self.device_name.clone()
    }

    fn acquire(&mut self, on_error: ErrorCallback) -> AppResult<StreamFormat> {
        if self.stream.is_some() {
            return Err(AppError::InvalidState("speaker already acquired".to_string()));
        }

        let device = DeviceManager::output_device(&self.selection)?;
        self.device_name = device.name().unwrap_or_else(|_| "unknown output".to_string());
        let chosen = DeviceManager::output_config(&device, self.preferred_rate)?;
        info!(
            device = %self.device_name,
            sample_rate = chosen.sample_rate,
            channels = chosen.channels,
            "Opening speaker"
        );

        *lock(&self.mixer) = MixerState::default();
        let mixer = Arc::clone(&self.mixer);
        let channels = chosen.channels as usize;
        let stream = StreamThread::spawn("speaker", move || {
            let config = chosen.stream_config();
            let report = move |err: cpal::StreamError| on_error(err.to_string());
            let stream = match chosen.format {
                SampleFormat::F32 => device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        lock(&mixer).render(data, channels);
                    },
                    report,
                    None,
                )?,
                SampleFormat::I16 => {
                    let mut scratch = Vec::new();
                    device.build_output_stream(
                        &config,
                        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                            scratch.resize(data.len(), 0.0);
                            lock(&mixer).render(&mut scratch, channels);
                            for (out, sample) in data.iter_mut().zip(&scratch) {
                                *out = (sample * PCM16_SCALE) as i16;
                            }
                        },
                        report,
                        None,
                    )?
                }
                other => {
                    return Err(AppError::DeviceUnavailable(format!(
                        "Unsupported output sample format {:?}",
                        other
                    )))
                }
            };
            Ok(stream)
        })?;

        // The speaker runs from acquisition on so its clock advances.
        stream.play()?;
        self.stream = Some(stream);
        self.format = Some(chosen.format());
        Ok(chosen.format())
    }

    fn current_time(&self) -> f64 {
        match self.format {
            Some(format) => lock(&self.mixer).position as f64 / format.sample_rate as f64,
            None => 0.0,
        }
    }

    fn start_at(&mut self, voice: VoiceId, frame: &AudioFrame, when: f64) -> AppResult<f64> {
        let format = self
            .format
            .ok_or_else(|| AppError::DeviceUnavailable("speaker not acquired".to_string()))?;
        let rate = format.sample_rate as f64;

        // Length from the rounded end points, so consecutive voices tile exactly.
        let start_frame = (when.max(0.0) * rate).round() as u64;
        let end_frame = ((when.max(0.0) + frame.duration_secs()) * rate).round() as u64;
        let len = (end_frame - start_frame).max(1) as usize;

        let mono = frame.to_mono();
        let samples: Arc<[f32]> = resample(&mono, frame.sample_rate(), format.sample_rate, len)?.into();

        let placed = lock(&self.mixer).place(voice, start_frame, frame.duration_secs() * rate, samples);
        if placed > start_frame {
            debug!(voice, late_frames = placed - start_frame, "Voice started at the device clock");
        }
        Ok(placed as f64 / rate)
    }

    fn cancel(&mut self, voice: VoiceId) {
        lock(&self.mixer).voices.retain(|v| v.id != voice);
    }

    fn release(&mut self) {
        lock(&self.mixer).voices.clear();
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown();
            debug!(device = %self.device_name, "Speaker released");
        }
        self.format = None;
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.release();
    }
}

//! # Capture Pipeline
//!
//! Owns the microphone for the lifetime of a session and turns its raw
//! callbacks into encoded capture frames.
//!
//! ## Flow per device callback:
//! 1. raw interleaved samples at the device's native format
//! 2. [`BlockBuffer`]: mono, capture rate, fixed-size blocks
//! 3. [`codec::encode`]: PCM16 little-endian bytes
//! 4. `on_frame`, once per block, in capture order
//!
//! The pipeline never touches session state. Device stream errors go to the
//! error callback given at acquisition and the controller decides what to do.

use crate::audio::buffer::BlockBuffer;
use crate::audio::codec;
use crate::device::{ErrorCallback, InputDevice, StreamFormat};
use crate::error::{AppError, AppResult};
use tracing::{debug, info, warn};

pub struct CapturePipeline {
    device: Box<dyn InputDevice>,
    device_format: StreamFormat,
    capture_rate: u32,
    acquired: bool,
    streaming: bool,
}

impl CapturePipeline {
    /// Acquire the microphone without delivering any audio yet.
    ///
    /// ## Errors:
    /// Any acquisition failure is reported as `DeviceUnavailable`. There is no
    /// retry; the device is left released.
    pub fn acquire(
        mut device: Box<dyn InputDevice>,
        capture_rate: u32,
        on_error: ErrorCallback,
    ) -> AppResult<Self> {
        let device_format = match device.acquire(on_error) {
            Ok(format) => format,
            Err(err) => {
                device.release();
                return Err(match err {
                    AppError::DeviceUnavailable(_) => err,
                    other => AppError::DeviceUnavailable(other.to_string()),
                });
            }
        };

        info!(
            device = %device.name(),
            device_rate = device_format.sample_rate,
            device_channels = device_format.channels,
            capture_rate,
            "Microphone acquired"
        );

        Ok(Self {
            device,
            device_format,
            capture_rate,
            acquired: true,
            streaming: false,
        })
    }

    /// Begin delivering encoded frames of `block_size` samples each.
    pub fn start<F>(&mut self, block_size: usize, mut on_frame: F) -> AppResult<()>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        if !self.acquired {
            return Err(AppError::InvalidState("capture pipeline already stopped".to_string()));
        }
        if self.streaming {
            return Err(AppError::InvalidState("capture already streaming".to_string()));
        }
        if block_size == 0 {
            return Err(AppError::InvalidState("capture block size must be positive".to_string()));
        }

        let mut blocks = BlockBuffer::new(
            block_size,
            self.device_format.sample_rate,
            self.device_format.channels,
            self.capture_rate,
        )?;

        self.device.start(Box::new(move |samples: &[f32]| match blocks.push(samples) {
            Ok(ready) => {
                for block in ready {
                    on_frame(codec::encode(&block));
                }
            }
            Err(err) => warn!(error = %err, samples = samples.len(), "Dropping capture samples"),
        }))?;

        self.streaming = true;
        debug!(block_size, "Capture streaming");
        Ok(())
    }

    /// Deregister the frame callback and release the microphone. Idempotent.
    pub fn stop(&mut self) {
        if !self.acquired {
            return;
        }
        self.device.release();
        self.acquired = false;
        self.streaming = false;
        info!(device = %self.device.name(), "Microphone released");
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EventLog, FakeInput};
    use std::sync::{Arc, Mutex};

    fn no_errors() -> ErrorCallback {
        Arc::new(|_| {})
    }

    #[test]
    fn test_frames_arrive_encoded_and_in_order() {
        let input = FakeInput::new(16000, 1, EventLog::default());
        let mut pipeline = CapturePipeline::acquire(Box::new(input.clone()), 16000, no_errors()).unwrap();

        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        pipeline.start(4, move |frame| sink.lock().unwrap().push(frame)).unwrap();

        input.feed(&[0.0, 0.5, -0.5, 0.0, 0.25, 0.25]);
        input.feed(&[0.25, 0.25]);

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], codec::encode(&[0.0, 0.5, -0.5, 0.0]));
        assert_eq!(frames[1], codec::encode(&[0.25; 4]));
    }

    #[test]
    fn test_stereo_48k_device_yields_16k_mono_blocks() {
        let input = FakeInput::new(48000, 2, EventLog::default());
        let mut pipeline = CapturePipeline::acquire(Box::new(input.clone()), 16000, no_errors()).unwrap();

        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        pipeline.start(160, move |frame| sink.lock().unwrap().push(frame)).unwrap();

        // 200 ms of stereo audio in 10 ms callbacks
        for _ in 0..20 {
            input.feed(&[0.5; 960]);
        }

        let frames = frames.lock().unwrap();
        assert!(frames.len() >= 17, "got {} frames", frames.len());
        assert!(frames.iter().all(|f| f.len() == 160 * 2));
    }

    #[test]
    fn test_acquire_failure_is_device_unavailable() {
        let input = FakeInput::failing(AppError::Internal("busy".to_string()), EventLog::default());
        let err = CapturePipeline::acquire(Box::new(input.clone()), 16000, no_errors())
            .err()
            .unwrap();
        assert!(matches!(err, AppError::DeviceUnavailable(_)));
        assert!(!input.is_acquired());
    }

    #[test]
    fn test_stop_is_idempotent_and_silences_delivery() {
        let input = FakeInput::new(16000, 1, EventLog::default());
        let mut pipeline = CapturePipeline::acquire(Box::new(input.clone()), 16000, no_errors()).unwrap();

        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        pipeline.start(2, move |frame| sink.lock().unwrap().push(frame)).unwrap();

        pipeline.stop();
        pipeline.stop();
        drop(pipeline);

        assert!(!input.feed(&[0.1, 0.2]));
        assert!(frames.lock().unwrap().is_empty());
        assert_eq!(input.release_count(), 1);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let input = FakeInput::new(16000, 1, EventLog::default());
        let mut pipeline = CapturePipeline::acquire(Box::new(input), 16000, no_errors()).unwrap();
        pipeline.start(4, |_| {}).unwrap();
        assert!(matches!(pipeline.start(4, |_| {}), Err(AppError::InvalidState(_))));
    }
}

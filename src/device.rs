//! # Device Detection and Management
//!
//! Defines the device seams the capture pipeline and the playback scheduler
//! own, and the cpal plumbing shared by the real implementations:
//! - **InputDevice / OutputDevice**: what the session needs from a microphone
//!   and a speaker
//! - **DeviceSelection**: "default" or a device name from the configuration
//! - **DeviceManager**: host lookup, listing and stream config selection
//! - **StreamThread**: a dedicated OS thread that owns one cpal stream, since
//!   cpal streams cannot move between threads

use crate::audio::buffer::AudioFrame;
use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Receives interleaved device samples, in capture order.
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Receives device stream errors. Called from the device's own thread.
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync + 'static>;

/// Identifies one scheduled buffer inside an output device.
pub type VoiceId = u64;

/// Native format a device was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// A microphone.
///
/// ## Lifecycle:
/// `acquire` opens the device without delivering anything, `start` begins
/// delivery, `release` stops delivery and closes the device. `release` must be
/// safe to call any number of times.
pub trait InputDevice: Send {
    fn name(&self) -> String;

    fn acquire(&mut self, on_error: ErrorCallback) -> AppResult<StreamFormat>;

    fn start(&mut self, on_samples: SampleCallback) -> AppResult<()>;

    fn release(&mut self);
}

/// A speaker with a sample clock.
///
/// ## Lifecycle:
/// `acquire` opens the device and starts its clock, `release` stops every
/// voice and closes the device. `release` must be idempotent.
pub trait OutputDevice: Send {
    fn name(&self) -> String;

    fn acquire(&mut self, on_error: ErrorCallback) -> AppResult<StreamFormat>;

    /// Seconds elapsed on the device clock since `acquire`.
    fn current_time(&self) -> f64;

    /// Play `frame` starting at device time `when`, or at the device clock if
    /// the clock has already passed `when`. Returns the start time actually used.
    fn start_at(&mut self, voice: VoiceId, frame: &AudioFrame, when: f64) -> AppResult<f64>;

    /// Silence one voice before the next device callback. Unknown ids are ignored.
    fn cancel(&mut self, voice: VoiceId);

    fn release(&mut self);
}

/// Which device to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelection {
    /// Host default device
    Default,
    /// Device whose name matches exactly
    Named(String),
}

impl std::str::FromStr for DeviceSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("Device selection cannot be empty".to_string());
        }
        match trimmed.to_lowercase().as_str() {
            "default" | "auto" => Ok(DeviceSelection::Default),
            _ => Ok(DeviceSelection::Named(trimmed.to_string())),
        }
    }
}

impl Default for DeviceSelection {
    fn default() -> Self {
        DeviceSelection::Default
    }
}

/// One supported configuration range, reduced to what selection needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigCandidate {
    pub channels: u16,
    pub min_rate: u32,
    pub max_rate: u32,
    pub format: SampleFormat,
}

/// What a device stream will be opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChosenConfig {
    pub channels: u16,
    pub sample_rate: u32,
    pub format: SampleFormat,
}

impl ChosenConfig {
    pub fn stream_config(&self) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: self.channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }

    pub fn format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }
}

/// Device detection and selection utilities
pub struct DeviceManager;

impl DeviceManager {
    /// Find the input device named by `selection`.
    pub fn input_device(selection: &DeviceSelection) -> AppResult<cpal::Device> {
        let host = cpal::default_host();
        match selection {
            DeviceSelection::Default => host
                .default_input_device()
                .ok_or_else(|| AppError::DeviceUnavailable("No default input device".to_string())),
            DeviceSelection::Named(name) => host
                .input_devices()?
                .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
                .ok_or_else(|| AppError::DeviceUnavailable(format!("Input device '{}' not found", name))),
        }
    }

    /// Find the output device named by `selection`.
    pub fn output_device(selection: &DeviceSelection) -> AppResult<cpal::Device> {
        let host = cpal::default_host();
        match selection {
            DeviceSelection::Default => host
                .default_output_device()
                .ok_or_else(|| AppError::DeviceUnavailable("No default output device".to_string())),
            DeviceSelection::Named(name) => host
                .output_devices()?
                .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
                .ok_or_else(|| AppError::DeviceUnavailable(format!("Output device '{}' not found", name))),
        }
    }

    /// Pick an input stream config, preferring the wire format so no resampling is needed.
    pub fn input_config(device: &cpal::Device, target_rate: u32) -> AppResult<ChosenConfig> {
        let candidates = device
            .supported_input_configs()?
            .map(|range| ConfigCandidate {
                channels: range.channels(),
                min_rate: range.min_sample_rate().0,
                max_rate: range.max_sample_rate().0,
                format: range.sample_format(),
            })
            .collect::<Vec<_>>();
        let default = device.default_input_config()?;
        Self::choose_config(&candidates, Self::fallback(&default), target_rate)
    }

    /// Pick an output stream config, preferring the playback format.
    pub fn output_config(device: &cpal::Device, target_rate: u32) -> AppResult<ChosenConfig> {
        let candidates = device
            .supported_output_configs()?
            .map(|range| ConfigCandidate {
                channels: range.channels(),
                min_rate: range.min_sample_rate().0,
                max_rate: range.max_sample_rate().0,
                format: range.sample_format(),
            })
            .collect::<Vec<_>>();
        let default = device.default_output_config()?;
        Self::choose_config(&candidates, Self::fallback(&default), target_rate)
    }

    fn fallback(default: &cpal::SupportedStreamConfig) -> ChosenConfig {
        ChosenConfig {
            channels: default.channels(),
            sample_rate: default.sample_rate().0,
            format: default.sample_format(),
        }
    }

    /// Selection order:
    /// 1. a float or i16 range at `target_rate` with one channel
    /// 2. a float or i16 range at `target_rate` with any channel count
    /// 3. the device default, if its sample format is usable
    pub fn choose_config(
        candidates: &[ConfigCandidate],
        fallback: ChosenConfig,
        target_rate: u32,
    ) -> AppResult<ChosenConfig> {
        let usable = |format: SampleFormat| matches!(format, SampleFormat::F32 | SampleFormat::I16);
        let at_rate = |c: &&ConfigCandidate| {
            usable(c.format) && c.min_rate <= target_rate && target_rate <= c.max_rate
        };
        let rank = |c: &ConfigCandidate| (c.channels != 1, c.format != SampleFormat::F32, c.channels);

        if let Some(best) = candidates.iter().filter(at_rate).min_by_key(|c| rank(*c)) {
            return Ok(ChosenConfig {
                channels: best.channels,
                sample_rate: target_rate,
                format: best.format,
            });
        }

        if usable(fallback.format) {
            debug!(
                "No {} Hz config available, falling back to {} Hz / {} channels",
                target_rate, fallback.sample_rate, fallback.channels
            );
            return Ok(fallback);
        }

        Err(AppError::DeviceUnavailable(format!(
            "No usable sample format (device default is {:?})",
            fallback.format
        )))
    }

    /// Get system device summary
    pub fn get_device_summary() -> AppResult<DeviceSummary> {
        let host = cpal::default_host();
        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());
        let inputs = host.input_devices()?.filter_map(|d| d.name().ok()).collect();
        let outputs = host.output_devices()?.filter_map(|d| d.name().ok()).collect();

        Ok(DeviceSummary {
            host: host.id().name().to_string(),
            default_input,
            default_output,
            inputs,
            outputs,
        })
    }
}

/// Device availability summary
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub host: String,
    pub default_input: Option<String>,
    pub default_output: Option<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

enum StreamControl {
    Play(std_mpsc::SyncSender<AppResult<()>>),
    Shutdown,
}

/// Owns one cpal stream on a dedicated thread.
///
/// The stream is built on that thread and dropped there on `shutdown` (or on
/// `Drop`), which is what closes the underlying device.
pub struct StreamThread {
    label: &'static str,
    control: Option<std_mpsc::Sender<StreamControl>>,
    join: Option<thread::JoinHandle<()>>,
}

impl StreamThread {
    /// Spawn the thread and build the stream. Returns once the stream exists,
    /// or with the build error.
    pub fn spawn<F>(label: &'static str, build: F) -> AppResult<Self>
    where
        F: FnOnce() -> AppResult<cpal::Stream> + Send + 'static,
    {
        let (control_tx, control_rx) = std_mpsc::channel::<StreamControl>();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<AppResult<()>>(1);

        let join = thread::Builder::new()
            .name(format!("{}-stream", label))
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                while let Ok(command) = control_rx.recv() {
                    match command {
                        StreamControl::Play(reply) => {
                            let _ = reply.send(stream.play().map_err(AppError::from));
                        }
                        StreamControl::Shutdown => break,
                    }
                }

                drop(stream);
                debug!("{} stream closed", label);
            })
            .map_err(|e| AppError::DeviceUnavailable(format!("Failed to spawn {} thread: {}", label, e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("{} stream opened", label);
                Ok(Self {
                    label,
                    control: Some(control_tx),
                    join: Some(join),
                })
            }
            Ok(Err(err)) => {
                let _ = join.join();
                Err(err)
            }
            Err(_) => {
                let _ = join.join();
                Err(AppError::DeviceUnavailable(format!("{} thread exited before opening", label)))
            }
        }
    }

    /// Start the stream and wait until the device accepted it.
    pub fn play(&self) -> AppResult<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| AppError::DeviceUnavailable(format!("{} stream already closed", self.label)))?;
        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        control
            .send(StreamControl::Play(reply_tx))
            .map_err(|_| AppError::DeviceUnavailable(format!("{} thread is gone", self.label)))?;
        reply_rx
            .recv()
            .map_err(|_| AppError::DeviceUnavailable(format!("{} thread is gone", self.label)))?
    }

    /// Close the stream and join the thread. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(StreamControl::Shutdown);
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("{} stream thread panicked", self.label);
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

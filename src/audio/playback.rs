//! # Playback Scheduler
//!
//! Places decoded buffers on the output device's timeline so they play back
//! to back, and cancels everything at once when the assistant is interrupted.
//!
//! ## Timeline rule:
//! `start = max(next_playback_time, device_clock)`, then
//! `next_playback_time = start + duration`.
//!
//! Buffers that arrive faster than real time therefore play gaplessly, and a
//! late buffer leaves a silent gap instead of overlapping the previous one.
//!
//! The scheduler is the only writer of `next_playback_time` and of the
//! scheduled set. It lives inside the session controller task, so the
//! "buffer finished" and "interrupt" paths never race.

use crate::audio::buffer::AudioFrame;
use crate::device::{ErrorCallback, OutputDevice, VoiceId};
use crate::error::{AppError, AppResult};
use std::collections::HashMap;
use tracing::{debug, info};

/// Reference to one scheduled buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackHandle {
    pub id: VoiceId,
    /// Device time in seconds at which the buffer starts
    pub start_time: f64,
    pub duration: f64,
}

impl PlaybackHandle {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

pub struct PlaybackScheduler {
    device: Box<dyn OutputDevice>,
    next_playback_time: f64,
    scheduled: HashMap<VoiceId, PlaybackHandle>,
    next_voice: VoiceId,
    acquired: bool,
}

impl PlaybackScheduler {
    /// Acquire the speaker. Its clock starts running immediately.
    pub fn acquire(mut device: Box<dyn OutputDevice>, on_error: ErrorCallback) -> AppResult<Self> {
        let format = match device.acquire(on_error) {
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
            device_rate = format.sample_rate,
            device_channels = format.channels,
            "Speaker acquired"
        );

        Ok(Self {
            device,
            next_playback_time: 0.0,
            scheduled: HashMap::new(),
            next_voice: 1,
            acquired: true,
        })
    }

    pub fn next_playback_time(&self) -> f64 {
        self.next_playback_time
    }

    /// Number of buffers that were scheduled and had not finished as of the
    /// last `schedule` call.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.len()
    }

    /// Queue `frame` right after everything already scheduled.
    ///
    /// ## Errors:
    /// - `InvalidState` after `stop`
    /// - whatever the device reports when it refuses the buffer; the timeline
    ///   is left untouched in that case
    pub fn schedule(&mut self, frame: AudioFrame) -> AppResult<PlaybackHandle> {
        if !self.acquired {
            return Err(AppError::InvalidState("playback scheduler is stopped".to_string()));
        }

        let clock = self.device.current_time();
        self.reap(clock);

        let requested = self.next_playback_time.max(clock);
        let id = self.next_voice;
        // The device clock may move on between reading it and placing the
        // buffer; the device reports where the buffer really starts.
        let start_time = self.device.start_at(id, &frame, requested)?;
        self.next_voice += 1;

        let handle = PlaybackHandle {
            id,
            start_time,
            duration: frame.duration_secs(),
        };
        self.next_playback_time = handle.end_time();
        self.scheduled.insert(id, handle);

        debug!(
            voice = handle.id,
            start = start_time,
            duration = handle.duration,
            gap = start_time - clock,
            "Buffer scheduled"
        );
        Ok(handle)
    }

    /// Cancel every scheduled and playing buffer and restart the timeline at
    /// the device clock. Returns how many buffers were cancelled.
    pub fn interrupt(&mut self) -> usize {
        let clock = self.device.current_time();
        let cancelled = self.scheduled.len();
        for id in self.scheduled.keys() {
            self.device.cancel(*id);
        }
        self.scheduled.clear();
        self.next_playback_time = clock;

        if cancelled > 0 {
            debug!(cancelled, clock, "Playback interrupted");
        }
        cancelled
    }

    /// Interrupt and release the speaker. Idempotent.
    pub fn stop(&mut self) {
        if !self.acquired {
            return;
        }
        self.interrupt();
        self.device.release();
        self.acquired = false;
        info!(device = %self.device.name(), "Speaker released");
    }

    fn reap(&mut self, clock: f64) {
        self.scheduled.retain(|_, handle| handle.end_time() > clock);
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

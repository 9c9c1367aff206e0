//! # Session State Shared With Observers
//!
//! Counters describing one live session's traffic. The controller task and
//! the device threads bump them; `main` and the tests read snapshots.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: the controller, the capture callback and the caller all hold a reference
//! - **RwLock**: many readers of a snapshot, one writer per increment
//!
//! Lock poisoning is ignored; readers see the last written counters.

use serde::Serialize;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Traffic counters for one session.
///
/// ## Why these metrics matter:
/// - **frames_dropped**: outbound backpressure or a full capture channel
/// - **chunks_malformed**: inbound audio that failed to decode and was skipped
/// - **interruptions**: how often the user talked over the assistant
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SessionMetrics {
    /// Capture blocks encoded by the microphone pipeline
    pub frames_captured: u64,

    /// Frames accepted by the transport
    pub frames_sent: u64,

    /// Frames lost to backpressure
    pub frames_dropped: u64,

    /// Bytes of PCM16 handed to the transport
    pub bytes_sent: u64,

    /// Inbound audio chunks
    pub chunks_received: u64,

    /// Inbound audio chunks placed on the playback timeline
    pub chunks_scheduled: u64,

    /// Inbound audio chunks that could not be decoded
    pub chunks_malformed: u64,

    pub interruptions: u64,

    pub turns_completed: u64,

    /// Inbound messages of an unrecognized shape
    pub unknown_messages: u64,

    /// Output device errors reported while playing
    pub playback_errors: u64,
}

/// Shared handle to a session's metrics.
#[derive(Debug, Clone)]
pub struct MetricsHandle {
    metrics: Arc<RwLock<SessionMetrics>>,
}

impl Default for MetricsHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsHandle {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(SessionMetrics::default())),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply an update under the write lock.
    pub fn record(&self, update: impl FnOnce(&mut SessionMetrics)) {
        update(&mut self.write());
    }

    pub fn increment_frames_captured(&self) {
        self.write().frames_captured += 1;
    }

    pub fn record_frame_sent(&self, bytes: usize) {
        let mut metrics = self.write();
        metrics.frames_sent += 1;
        metrics.bytes_sent += bytes as u64;
    }

    pub fn increment_frames_dropped(&self) {
        self.write().frames_dropped += 1;
    }

    /// Copy of the current counters; the lock is released before returning.
    pub fn snapshot(&self) -> SessionMetrics {
        self.read().clone()
    }
}

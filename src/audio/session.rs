//! # Live Session Controller
//!
//! Orchestrates one voice session: microphone → transport → speaker.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: created, nothing acquired
//! 2. **Connecting**: microphone and speaker acquired, transport opening
//! 3. **Active**: transport ready, capture streaming, inbound audio playing
//! 4. **Closing**: tearing down after a stop request or a remote close
//! 5. **Closed**: everything released
//! 6. **Failed**: a device or the connection failed; everything released
//!
//! ## Concurrency:
//! The controller is a single tokio task. Commands from the handle, transport
//! events, capture frames and device faults all arrive on channels and are
//! applied one at a time, so no two transitions ever overlap. The capture
//! pipeline and the playback scheduler are owned by that task and never
//! change the session state themselves.
//!
//! ## Teardown order:
//! capture first (no new outbound frames), then playback, then the transport.

use crate::audio::capture::CapturePipeline;
use crate::audio::codec;
use crate::audio::playback::PlaybackScheduler;
use crate::config::AppConfig;
use crate::device::{ErrorCallback, InputDevice, OutputDevice};
use crate::error::{AppError, AppResult};
use crate::state::{MetricsHandle, SessionMetrics};
use crate::websocket::{ConnectionId, InboundMessage, SendOutcome, Transport, TransportEvent};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Current state of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
    /// Terminal failure with a human-readable reason
    Failed(String),
}

impl SessionState {
    /// Convert state to string for logs and status lines.
    pub fn as_str(&self) -> &str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed(_))
    }
}

enum Command {
    Start(oneshot::Sender<AppResult<()>>),
    Stop(oneshot::Sender<()>),
}

/// Reported from a device thread.
#[derive(Debug)]
enum DeviceFault {
    Input(String),
    Output(String),
}

/// Handle to a running session task.
///
/// Dropping the handle tears the session down.
pub struct SessionController {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    metrics: MetricsHandle,
}

impl SessionController {
    /// Spawn the session task in the `Idle` state. Must be called inside a
    /// tokio runtime.
    pub fn spawn(
        config: AppConfig,
        input: Box<dyn InputDevice>,
        output: Box<dyn OutputDevice>,
        transport: Box<dyn Transport>,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let started_at = Utc::now();
        let metrics = MetricsHandle::new();
        let capacity = config.session.event_queue_capacity.max(1);

        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (frames_tx, frames_rx) = mpsc::channel(capacity);
        let (faults_tx, faults_rx) = mpsc::channel(capacity);

        let actor = SessionActor {
            config,
            metrics: metrics.clone(),
            state: state_tx,
            input: Some(input),
            output: Some(output),
            capture: None,
            playback: None,
            transport,
            connection: None,
            connect_deadline: None,
            events_tx,
            frames_tx,
            faults_tx,
            playback_error_streak: 0,
        };

        let span = info_span!("session", session_id = %session_id);
        tokio::spawn(
            actor
                .run(commands_rx, events_rx, frames_rx, faults_rx)
                .instrument(span),
        );
        info!(session_id = %session_id, started_at = %started_at, "Session created");

        Self {
            session_id,
            started_at,
            commands: commands_tx,
            state: state_rx,
            metrics,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Acquire both devices and open the connection.
    ///
    /// Returns once the session is `Connecting`; `Active` follows when the
    /// remote side is ready.
    ///
    /// ## Errors:
    /// - `InvalidState` unless the session is `Idle`
    /// - `DeviceUnavailable` / `ConnectionFailed`, after which the session is
    ///   `Failed` and nothing is left acquired
    pub async fn start(&self) -> AppResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Start(reply_tx))
            .await
            .map_err(|_| AppError::InvalidState("session task has exited".to_string()))?;
        reply_rx
            .await
            .map_err(|_| AppError::InvalidState("session task has exited".to_string()))?
    }

    /// Stop the session and wait for teardown. Idempotent.
    pub async fn stop(&self) -> AppResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Stop(reply_tx)).await.is_err() {
            // The task only exits when the handle is gone; nothing left to stop.
            return Ok(());
        }
        let _ = reply_rx.await;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Wait until the session is `Closed` or `Failed`.
    pub async fn wait_for_terminal(&self) -> SessionState {
        let mut state = self.state.clone();
        loop {
            let current = state.borrow_and_update().clone();
            if current.is_terminal() || state.changed().await.is_err() {
                return current;
            }
        }
    }

    pub fn metrics(&self) -> SessionMetrics {
        self.metrics.snapshot()
    }
}

struct SessionActor {
    config: AppConfig,
    metrics: MetricsHandle,
    state: watch::Sender<SessionState>,

    input: Option<Box<dyn InputDevice>>,
    output: Option<Box<dyn OutputDevice>>,
    capture: Option<CapturePipeline>,
    playback: Option<PlaybackScheduler>,

    transport: Box<dyn Transport>,
    connection: Option<ConnectionId>,
    connect_deadline: Option<Instant>,

    events_tx: mpsc::Sender<(ConnectionId, TransportEvent)>,
    frames_tx: mpsc::Sender<Vec<u8>>,
    faults_tx: mpsc::Sender<DeviceFault>,

    playback_error_streak: u32,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<(ConnectionId, TransportEvent)>,
        mut frames: mpsc::Receiver<Vec<u8>>,
        mut faults: mpsc::Receiver<DeviceFault>,
    ) {
        loop {
            let deadline = self.connect_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start(reply)) => {
                        let _ = reply.send(self.start());
                    }
                    Some(Command::Stop(reply)) => {
                        self.stop();
                        let _ = reply.send(());
                    }
                    None => {
                        debug!("Session handle dropped");
                        self.stop();
                        break;
                    }
                },
                Some((id, event)) = events.recv() => self.on_transport_event(id, event),
                Some(frame) = frames.recv() => self.on_capture_frame(frame),
                Some(fault) = faults.recv() => self.on_device_fault(fault),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_connect_timeout();
                }
            }
        }

        let metrics = self.metrics.snapshot();
        info!(
            state = self.current().as_str(),
            frames_sent = metrics.frames_sent,
            chunks_scheduled = metrics.chunks_scheduled,
            "Session task finished"
        );
    }

    fn current(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next.clone());
        match &next {
            SessionState::Failed(reason) => {
                error!(from = previous.as_str(), reason = %reason, "Session failed")
            }
            _ => info!(from = previous.as_str(), to = next.as_str(), "Session state changed"),
        }
    }

    fn fault_reporter(&self, wrap: fn(String) -> DeviceFault) -> ErrorCallback {
        let faults = self.faults_tx.clone();
        Arc::new(move |message: String| {
            let _ = faults.try_send(wrap(message));
        })
    }

    fn start(&mut self) -> AppResult<()> {
        let current = self.current();
        if current != SessionState::Idle {
            return Err(AppError::InvalidState(format!(
                "cannot start a session that is {}",
                current.as_str()
            )));
        }
        self.transition(SessionState::Connecting);

        let (Some(input), Some(output)) = (self.input.take(), self.output.take()) else {
            let err = AppError::InvalidState("session devices already consumed".to_string());
            self.fail(err.clone());
            return Err(err);
        };

        let on_input_error = self.fault_reporter(DeviceFault::Input);
        match CapturePipeline::acquire(input, self.config.audio.capture_sample_rate, on_input_error) {
            Ok(capture) => self.capture = Some(capture),
            Err(err) => {
                self.fail(err.clone());
                return Err(err);
            }
        }

        let on_output_error = self.fault_reporter(DeviceFault::Output);
        match PlaybackScheduler::acquire(output, on_output_error) {
            Ok(playback) => self.playback = Some(playback),
            Err(err) => {
                self.fail(err.clone());
                return Err(err);
            }
        }

        match self.transport.connect(&self.config.live, self.events_tx.clone()) {
            Ok(id) => {
                self.connection = Some(id);
                self.connect_deadline = Some(Instant::now() + self.config.session.connect_timeout());
                debug!(connection = id, "Waiting for the live service");
                Ok(())
            }
            Err(err) => {
                let err = match err {
                    AppError::ConnectionFailed(_) => err,
                    other => AppError::ConnectionFailed(other.to_string()),
                };
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    fn stop(&mut self) {
        match self.current() {
            SessionState::Connecting | SessionState::Active => {
                self.transition(SessionState::Closing);
                self.teardown();
                self.transition(SessionState::Closed);
            }
            SessionState::Idle => {
                self.input = None;
                self.output = None;
                self.transition(SessionState::Closed);
            }
            SessionState::Closing | SessionState::Closed | SessionState::Failed(_) => {}
        }
    }

    fn fail(&mut self, err: AppError) {
        self.teardown();
        self.transition(SessionState::Failed(err.to_string()));
    }

    fn teardown(&mut self) {
        self.connect_deadline = None;
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut playback) = self.playback.take() {
            playback.stop();
        }
        if let Some(id) = self.connection.take() {
            self.transport.close();
            debug!(connection = id, "Connection closed");
        }
    }

    fn on_transport_event(&mut self, id: ConnectionId, event: TransportEvent) {
        if self.connection != Some(id) {
            debug!(connection = id, ?event, "Ignoring event from a closed connection");
            return;
        }

        match event {
            TransportEvent::Opened => self.on_opened(),
            TransportEvent::Message(message) => self.on_message(message),
            TransportEvent::Failed(reason) => {
                if matches!(self.current(), SessionState::Connecting | SessionState::Active) {
                    self.fail(AppError::ConnectionFailed(reason));
                }
            }
            TransportEvent::Closed(reason) => match self.current() {
                SessionState::Active => {
                    info!(reason = ?reason, "Live service ended the session");
                    self.transition(SessionState::Closing);
                    self.teardown();
                    self.transition(SessionState::Closed);
                }
                SessionState::Connecting => self.fail(AppError::ConnectionFailed(format!(
                    "closed before ready: {}",
                    reason.unwrap_or_else(|| "no reason".to_string())
                ))),
                _ => {}
            },
        }
    }

    fn on_opened(&mut self) {
        if self.current() != SessionState::Connecting {
            return;
        }
        self.connect_deadline = None;

        let frames = self.frames_tx.clone();
        let metrics = self.metrics.clone();
        let started = match self.capture.as_mut() {
            Some(capture) => capture.start(self.config.audio.block_size, move |frame| {
                metrics.increment_frames_captured();
                if frames.try_send(frame).is_err() {
                    metrics.increment_frames_dropped();
                }
            }),
            None => Err(AppError::DeviceUnavailable("microphone is not acquired".to_string())),
        };

        match started {
            Ok(()) => self.transition(SessionState::Active),
            Err(err) => {
                let err = match err {
                    AppError::DeviceUnavailable(_) => err,
                    other => AppError::DeviceUnavailable(other.to_string()),
                };
                self.fail(err);
            }
        }
    }

    fn on_message(&mut self, message: InboundMessage) {
        if self.current() != SessionState::Active {
            return;
        }

        match message {
            InboundMessage::AudioChunk(bytes) => {
                self.metrics.record(|m| m.chunks_received += 1);
                self.play_chunk(&bytes);
            }
            InboundMessage::Interrupted => {
                let cancelled = self.playback.as_mut().map(|p| p.interrupt()).unwrap_or(0);
                self.metrics.record(|m| m.interruptions += 1);
                info!(cancelled, "Assistant interrupted");
            }
            InboundMessage::TurnComplete => {
                self.metrics.record(|m| m.turns_completed += 1);
                debug!("Turn complete");
            }
            InboundMessage::Text(text) => info!(text = %text, "Assistant text"),
            InboundMessage::GoAway(time_left) => {
                warn!(time_left = ?time_left, "Live service is about to close the connection")
            }
            InboundMessage::MalformedAudio(reason) => {
                self.metrics.record(|m| {
                    m.chunks_received += 1;
                    m.chunks_malformed += 1;
                });
                warn!(reason = %reason, "Dropping undecodable audio chunk");
            }
            InboundMessage::Unknown(shape) => {
                self.metrics.record(|m| m.unknown_messages += 1);
                debug!(shape = %shape, "Ignoring unknown message");
            }
        }
    }

    fn play_chunk(&mut self, bytes: &[u8]) {
        let frame = match codec::decode(bytes, self.config.audio.playback_sample_rate, 1) {
            Ok(frame) => frame,
            Err(err) => {
                self.metrics.record(|m| m.chunks_malformed += 1);
                warn!(bytes = bytes.len(), error = %err, "Dropping malformed audio chunk");
                return;
            }
        };

        let Some(playback) = self.playback.as_mut() else {
            return;
        };
        match playback.schedule(frame) {
            Ok(handle) => {
                debug!(
                    voice = handle.id,
                    pending = playback.scheduled_count(),
                    next = playback.next_playback_time(),
                    "Chunk queued for playback"
                );
                self.playback_error_streak = 0;
                self.metrics.record(|m| m.chunks_scheduled += 1);
            }
            Err(err) => self.on_playback_error(err.to_string()),
        }
    }

    fn on_capture_frame(&mut self, frame: Vec<u8>) {
        if self.current() != SessionState::Active {
            return;
        }
        let bytes = frame.len();
        match self.transport.send(frame) {
            SendOutcome::Queued => self.metrics.record_frame_sent(bytes),
            SendOutcome::Dropped => {
                self.metrics.increment_frames_dropped();
                debug!(bytes, "Outbound queue full, frame dropped");
            }
            SendOutcome::NotConnected => debug!("Frame captured after the connection went away"),
        }
    }

    fn on_device_fault(&mut self, fault: DeviceFault) {
        if !matches!(self.current(), SessionState::Connecting | SessionState::Active) {
            return;
        }
        match fault {
            DeviceFault::Input(message) => {
                self.fail(AppError::DeviceUnavailable(format!("microphone: {}", message)))
            }
            DeviceFault::Output(message) => self.on_playback_error(message),
        }
    }

    fn on_playback_error(&mut self, message: String) {
        self.playback_error_streak += 1;
        self.metrics.record(|m| m.playback_errors += 1);
        warn!(streak = self.playback_error_streak, error = %message, "Playback error");

        if self.playback_error_streak > self.config.session.max_playback_errors {
            self.fail(AppError::DeviceUnavailable(format!(
                "speaker failed {} times in a row: {}",
                self.playback_error_streak, message
            )));
        }
    }

    fn on_connect_timeout(&mut self) {
        self.connect_deadline = None;
        if self.current() == SessionState::Connecting {
            self.fail(AppError::ConnectionFailed(format!(
                "no response from the live service within {} ms",
                self.config.session.connect_timeout_ms
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, within, EventLog, FakeInput, FakeOutput, ScriptedTransport};

    struct Harness {
        controller: SessionController,
        input: FakeInput,
        output: FakeOutput,
        transport: ScriptedTransport,
        log: EventLog,
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.session.connect_timeout_ms = 100;
        config
    }

    fn harness_with(
        config: AppConfig,
        input: FakeInput,
        output: FakeOutput,
        transport: ScriptedTransport,
        log: EventLog,
    ) -> Harness {
        let controller = SessionController::spawn(
            config,
            Box::new(input.clone()),
            Box::new(output.clone()),
            Box::new(transport.clone()),
        );
        Harness {
            controller,
            input,
            output,
            transport,
            log,
        }
    }

    fn harness(auto_open: bool) -> Harness {
        let log = EventLog::default();
        let transport = if auto_open {
            ScriptedTransport::auto_open(log.clone())
        } else {
            ScriptedTransport::new(log.clone())
        };
        harness_with(
            test_config(),
            FakeInput::new(16000, 1, log.clone()),
            FakeOutput::new(log.clone()),
            transport,
            log,
        )
    }

    async fn active_harness() -> Harness {
        let h = harness(true);
        h.controller.start().await.unwrap();
        assert!(eventually(|| h.controller.state() == SessionState::Active).await);
        h
    }

    fn one_second_chunk() -> Vec<u8> {
        codec::encode(&[0.1; 24000])
    }

    fn assert_released(h: &Harness) {
        assert!(!h.input.is_acquired());
        assert!(!h.output.is_acquired());
        assert!(!h.transport.is_connected());
    }

    #[tokio::test]
    async fn test_capture_to_transport_to_playback() {
        let h = active_harness().await;

        let blocks: Vec<Vec<f32>> = (1..=3).map(|n| vec![n as f32 / 10.0; 4096]).collect();
        let samples: Vec<f32> = blocks.iter().flatten().copied().collect();
        assert!(h.input.feed(&samples));

        assert!(eventually(|| h.transport.sent_frames().len() == 3).await);
        let expected: Vec<Vec<u8>> = blocks.iter().map(|b| codec::encode(b)).collect();
        assert_eq!(h.transport.sent_frames(), expected);

        for _ in 0..2 {
            let chunk = TransportEvent::Message(InboundMessage::AudioChunk(one_second_chunk()));
            assert!(h.transport.emit(chunk).await);
        }
        assert!(eventually(|| h.output.started_voices().len() == 2).await);

        let voices = h.output.started_voices();
        assert_eq!(voices[1].start, voices[0].start + 1.0);

        let metrics = h.controller.metrics();
        assert_eq!(metrics.frames_captured, 3);
        assert_eq!(metrics.frames_sent, 3);
        assert_eq!(metrics.bytes_sent, 3 * 8192);
        assert_eq!(metrics.chunks_scheduled, 2);
    }

    #[tokio::test]
    async fn test_interruption_silences_pending_audio() {
        let h = active_harness().await;
        for _ in 0..2 {
            h.transport
                .emit(TransportEvent::Message(InboundMessage::AudioChunk(one_second_chunk())))
                .await;
        }
        assert!(eventually(|| h.output.started_voices().len() == 2).await);

        h.output.set_clock(0.3);
        h.transport
            .emit(TransportEvent::Message(InboundMessage::Interrupted))
            .await;
        assert!(eventually(|| h.output.active_voices().is_empty()).await);
        assert_eq!(h.output.cancelled().len(), 2);

        h.transport
            .emit(TransportEvent::Message(InboundMessage::AudioChunk(one_second_chunk())))
            .await;
        assert!(eventually(|| h.output.started_voices().len() == 1).await);
        assert_eq!(h.output.started_voices()[0].start, 0.3);
        assert_eq!(h.controller.metrics().interruptions, 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_fails_and_releases_devices() {
        let h = harness(false);
        h.controller.start().await.unwrap();
        assert_eq!(h.controller.state(), SessionState::Connecting);
        assert!(h.input.is_acquired());

        let state = within(h.controller.wait_for_terminal()).await;
        assert!(matches!(state, SessionState::Failed(reason) if reason.contains("100 ms")));
        assert_released(&h);
        assert_eq!(h.input.release_count(), 1);
        assert_eq!(h.output.release_count(), 1);
        assert_eq!(h.transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_microphone_unavailable() {
        let log = EventLog::default();
        let h = harness_with(
            test_config(),
            FakeInput::failing(AppError::DeviceUnavailable("no mic".to_string()), log.clone()),
            FakeOutput::new(log.clone()),
            ScriptedTransport::auto_open(log.clone()),
            log,
        );

        let err = h.controller.start().await.unwrap_err();
        assert!(matches!(err, AppError::DeviceUnavailable(_)));
        assert!(matches!(h.controller.state(), SessionState::Failed(_)));
        assert!(!h.output.is_acquired());
        assert_eq!(h.transport.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_speaker_unavailable_releases_microphone() {
        let log = EventLog::default();
        let h = harness_with(
            test_config(),
            FakeInput::new(16000, 1, log.clone()),
            FakeOutput::failing(AppError::DeviceUnavailable("no speaker".to_string()), log.clone()),
            ScriptedTransport::auto_open(log.clone()),
            log,
        );

        assert!(h.controller.start().await.is_err());
        assert_released(&h);
        assert_eq!(h.input.release_count(), 1);
        assert_eq!(h.log.entries(), vec!["input.acquire", "input.release"]);
    }

    #[tokio::test]
    async fn test_connect_error_is_connection_failed() {
        let h = harness(false);
        h.transport.fail_connect(AppError::Internal("bad url".to_string()));

        let err = h.controller.start().await.unwrap_err();
        assert!(matches!(err, AppError::ConnectionFailed(_)));
        assert_released(&h);
    }

    #[tokio::test]
    async fn test_stop_tears_down_in_order_and_is_idempotent() {
        let h = active_harness().await;

        h.controller.stop().await.unwrap();
        assert_eq!(h.controller.state(), SessionState::Closed);
        h.controller.stop().await.unwrap();

        let entries = h.log.entries();
        assert_eq!(
            &entries[entries.len() - 3..],
            &["input.release", "output.release", "transport.close"]
        );
        assert_eq!(h.input.release_count(), 1);
        assert_eq!(h.output.release_count(), 1);
        assert_eq!(h.transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let h = active_harness().await;
        assert!(matches!(
            h.controller.start().await,
            Err(AppError::InvalidState(_))
        ));
        assert_eq!(h.controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_stop_before_start_closes() {
        let h = harness(true);
        h.controller.stop().await.unwrap();
        assert_eq!(h.controller.state(), SessionState::Closed);
        assert!(h.controller.start().await.is_err());
        assert_eq!(h.transport.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_while_active() {
        let h = active_harness().await;
        h.transport
            .emit(TransportEvent::Failed("connection reset".to_string()))
            .await;

        let state = within(h.controller.wait_for_terminal()).await;
        assert_eq!(
            state,
            SessionState::Failed("Connection failed: connection reset".to_string())
        );
        assert_released(&h);
    }

    #[tokio::test]
    async fn test_remote_close_ends_closed() {
        let h = active_harness().await;
        h.transport.emit(TransportEvent::Closed(None)).await;

        assert_eq!(within(h.controller.wait_for_terminal()).await, SessionState::Closed);
        assert_released(&h);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_messages_do_not_end_session() {
        let h = active_harness().await;
        h.transport
            .emit(TransportEvent::Message(InboundMessage::AudioChunk(vec![1, 2, 3])))
            .await;
        h.transport
            .emit(TransportEvent::Message(InboundMessage::Unknown("toolCall".to_string())))
            .await;
        h.transport
            .emit(TransportEvent::Message(InboundMessage::AudioChunk(one_second_chunk())))
            .await;

        assert!(eventually(|| h.controller.metrics().chunks_scheduled == 1).await);
        let metrics = h.controller.metrics();
        assert_eq!(metrics.chunks_received, 2);
        assert_eq!(metrics.chunks_malformed, 1);
        assert_eq!(metrics.unknown_messages, 1);
        assert_eq!(h.controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_events_from_other_connections_are_ignored() {
        let h = active_harness().await;
        h.transport
            .emit_as(99, TransportEvent::Failed("stale".to_string()))
            .await;
        h.transport
            .emit(TransportEvent::Message(InboundMessage::TurnComplete))
            .await;

        assert!(eventually(|| h.controller.metrics().turns_completed == 1).await);
        assert_eq!(h.controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_microphone_error_is_fatal() {
        let h = active_harness().await;
        h.input.raise_error("device unplugged");

        let state = within(h.controller.wait_for_terminal()).await;
        assert!(matches!(state, SessionState::Failed(reason) if reason.contains("unplugged")));
        assert_released(&h);
    }

    #[tokio::test]
    async fn test_repeated_playback_errors_are_fatal() {
        let mut config = test_config();
        config.session.max_playback_errors = 1;
        let log = EventLog::default();
        let h = harness_with(
            config,
            FakeInput::new(16000, 1, log.clone()),
            FakeOutput::new(log.clone()),
            ScriptedTransport::auto_open(log.clone()),
            log,
        );
        h.controller.start().await.unwrap();
        assert!(eventually(|| h.controller.state() == SessionState::Active).await);

        h.output.fail_start(true);
        h.transport
            .emit(TransportEvent::Message(InboundMessage::AudioChunk(one_second_chunk())))
            .await;
        assert!(eventually(|| h.controller.metrics().playback_errors == 1).await);
        assert_eq!(h.controller.state(), SessionState::Active);

        h.transport
            .emit(TransportEvent::Message(InboundMessage::AudioChunk(one_second_chunk())))
            .await;
        let state = within(h.controller.wait_for_terminal()).await;
        assert!(matches!(state, SessionState::Failed(_)));
        assert_released(&h);
    }

    #[tokio::test]
    async fn test_speaker_errors_reset_after_successful_playback() {
        let mut config = test_config();
        config.session.max_playback_errors = 1;
        let log = EventLog::default();
        let h = harness_with(
            config,
            FakeInput::new(16000, 1, log.clone()),
            FakeOutput::new(log.clone()),
            ScriptedTransport::auto_open(log.clone()),
            log,
        );
        h.controller.start().await.unwrap();
        assert!(eventually(|| h.controller.state() == SessionState::Active).await);

        h.output.raise_error("underrun");
        assert!(eventually(|| h.controller.metrics().playback_errors == 1).await);

        h.transport
            .emit(TransportEvent::Message(InboundMessage::AudioChunk(one_second_chunk())))
            .await;
        assert!(eventually(|| h.controller.metrics().chunks_scheduled == 1).await);

        // the streak restarted, so one more error is still tolerated
        h.output.raise_error("underrun");
        assert!(eventually(|| h.controller.metrics().playback_errors == 2).await);
        assert_eq!(h.controller.state(), SessionState::Active);

        h.output.raise_error("device lost");
        let state = within(h.controller.wait_for_terminal()).await;
        assert!(matches!(state, SessionState::Failed(reason) if reason.contains("device lost")));
        assert_released(&h);
    }

    #[tokio::test]
    async fn test_remote_close_while_connecting_fails() {
        let h = harness(false);
        h.controller.start().await.unwrap();
        assert_eq!(h.controller.state(), SessionState::Connecting);

        h.transport
            .emit(TransportEvent::Closed(Some("quota exceeded".to_string())))
            .await;

        let state = within(h.controller.wait_for_terminal()).await;
        assert!(matches!(state, SessionState::Failed(reason) if reason.contains("quota exceeded")));
        assert!(!h.input.is_streaming());
        assert_released(&h);
    }

    #[tokio::test]
    async fn test_full_capture_channel_drops_newest_frames() {
        let mut config = test_config();
        config.audio.block_size = 4;
        config.session.event_queue_capacity = 1;
        let log = EventLog::default();
        let h = harness_with(
            config,
            FakeInput::new(16000, 1, log.clone()),
            FakeOutput::new(log.clone()),
            ScriptedTransport::auto_open(log.clone()),
            log,
        );
        h.controller.start().await.unwrap();
        assert!(eventually(|| h.controller.state() == SessionState::Active).await);
        assert!(h.input.is_streaming());

        // three blocks in one device callback, with room for only one
        assert!(h.input.feed(&[0.1, 0.1, 0.1, 0.1, 0.2, 0.2, 0.2, 0.2, 0.3, 0.3, 0.3, 0.3]));

        assert!(eventually(|| h.controller.metrics().frames_sent == 1).await);
        let metrics = h.controller.metrics();
        assert_eq!(metrics.frames_captured, 3);
        assert_eq!(metrics.frames_dropped, 2);
        assert_eq!(h.transport.sent_frames(), vec![codec::encode(&[0.1; 4])]);
    }

    #[tokio::test]
    async fn test_outbound_drops_are_counted() {
        let h = active_harness().await;
        h.transport.set_send_outcome(SendOutcome::Dropped);
        assert!(h.input.feed(&[0.0; 4096]));

        assert!(eventually(|| h.controller.metrics().frames_dropped == 1).await);
        assert_eq!(h.controller.metrics().frames_sent, 0);
    }

    #[tokio::test]
    async fn test_dropping_handle_releases_everything() {
        let h = active_harness().await;
        let Harness {
            controller,
            input,
            output,
            transport,
            ..
        } = h;
        drop(controller);

        assert!(eventually(|| !input.is_acquired() && !output.is_acquired()).await);
        assert!(eventually(|| !transport.is_connected()).await);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::Connecting.as_str(), "connecting");
        assert_eq!(SessionState::Failed("x".into()).as_str(), "failed");
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Closing.is_terminal());
    }
}

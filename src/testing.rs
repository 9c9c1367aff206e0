//! Test doubles shared by the unit tests: devices with a manual clock, a
//! scripted transport, and an ordered log of what each of them did.

use crate::audio::buffer::AudioFrame;
use crate::config::LiveConfig;
use crate::device::{
    ErrorCallback, InputDevice, OutputDevice, SampleCallback, StreamFormat, VoiceId,
};
use crate::error::{AppError, AppResult};
use crate::websocket::{ConnectionId, EventSender, SendOutcome, Transport, TransportEvent};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ordered record of device and transport calls.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct InputState {
    format: StreamFormat,
    fail: Option<AppError>,
    acquired: bool,
    release_count: u32,
    callback: Option<SampleCallback>,
    on_error: Option<ErrorCallback>,
}

/// Microphone fed by the test.
#[derive(Clone)]
pub struct FakeInput {
    state: Arc<Mutex<InputState>>,
    log: EventLog,
}

impl FakeInput {
    pub fn new(sample_rate: u32, channels: u16, log: EventLog) -> Self {
        Self {
            state: Arc::new(Mutex::new(InputState {
                format: StreamFormat {
                    sample_rate,
                    channels,
                },
                fail: None,
                acquired: false,
                release_count: 0,
                callback: None,
                on_error: None,
            })),
            log,
        }
    }

    pub fn failing(err: AppError, log: EventLog) -> Self {
        let input = Self::new(16000, 1, log);
        input.state.lock().unwrap().fail = Some(err);
        input
    }

    /// Deliver samples as a device callback would. Returns false when nothing
    /// is listening.
    pub fn feed(&self, samples: &[f32]) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.callback.as_mut() {
            Some(callback) => {
                callback(samples);
                true
            }
            None => false,
        }
    }

    /// Report a stream error as the device thread would.
    pub fn raise_error(&self, message: &str) {
        let on_error = self.state.lock().unwrap().on_error.clone();
        if let Some(on_error) = on_error {
            on_error(message.to_string());
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.state.lock().unwrap().acquired
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().unwrap().callback.is_some()
    }

    pub fn release_count(&self) -> u32 {
        self.state.lock().unwrap().release_count
    }
}

impl InputDevice for FakeInput {
    fn name(&self) -> String {
        "fake microphone".to_string()
    }

    fn acquire(&mut self, on_error: ErrorCallback) -> AppResult<StreamFormat> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail.clone() {
            return Err(err);
        }
        state.acquired = true;
        state.on_error = Some(on_error);
        self.log.push("input.acquire");
        Ok(state.format)
    }

    fn start(&mut self, on_samples: SampleCallback) -> AppResult<()> {
        self.state.lock().unwrap().callback = Some(on_samples);
        self.log.push("input.start");
        Ok(())
    }

    fn release(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.callback = None;
        state.on_error = None;
        if state.acquired {
            state.acquired = false;
            state.release_count += 1;
            self.log.push("input.release");
        }
    }
}

/// A buffer placed on the fake speaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FakeVoice {
    pub id: VoiceId,
    pub start: f64,
    pub duration: f64,
}

struct OutputState {
    fail: Option<AppError>,
    fail_start: bool,
    acquired: bool,
    release_count: u32,
    clock: f64,
    start_delay: f64,
    voices: Vec<FakeVoice>,
    cancelled: Vec<VoiceId>,
    on_error: Option<ErrorCallback>,
}

/// Speaker whose clock only moves when the test says so.
#[derive(Clone)]
pub struct FakeOutput {
    state: Arc<Mutex<OutputState>>,
    log: EventLog,
}

impl FakeOutput {
    pub fn new(log: EventLog) -> Self {
        Self {
            state: Arc::new(Mutex::new(OutputState {
                fail: None,
                fail_start: false,
                acquired: false,
                release_count: 0,
                clock: 0.0,
                start_delay: 0.0,
                voices: Vec::new(),
                cancelled: Vec::new(),
                on_error: None,
            })),
            log,
        }
    }

    pub fn failing(err: AppError, log: EventLog) -> Self {
        let output = Self::new(log);
        output.state.lock().unwrap().fail = Some(err);
        output
    }

    pub fn set_clock(&self, seconds: f64) {
        self.state.lock().unwrap().clock = seconds;
    }

    /// Advance the clock by `seconds` inside every `start_at`, as if a device
    /// callback ran between the scheduler reading the clock and placing audio.
    pub fn set_start_delay(&self, seconds: f64) {
        self.state.lock().unwrap().start_delay = seconds;
    }

    pub fn fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    /// Voices that have not been cancelled and have not finished by the clock.
    pub fn active_voices(&self) -> Vec<FakeVoice> {
        let state = self.state.lock().unwrap();
        state
            .voices
            .iter()
            .filter(|v| v.start + v.duration > state.clock)
            .copied()
            .collect()
    }

    /// Every voice ever started, in order.
    pub fn started_voices(&self) -> Vec<FakeVoice> {
        self.state.lock().unwrap().voices.clone()
    }

    pub fn cancelled(&self) -> Vec<VoiceId> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn raise_error(&self, message: &str) {
        let on_error = self.state.lock().unwrap().on_error.clone();
        if let Some(on_error) = on_error {
            on_error(message.to_string());
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.state.lock().unwrap().acquired
    }

    pub fn release_count(&self) -> u32 {
        self.state.lock().unwrap().release_count
    }
}

impl OutputDevice for FakeOutput {
    fn name(&self) -> String {
        "fake speaker".to_string()
    }

    fn acquire(&mut self, on_error: ErrorCallback) -> AppResult<StreamFormat> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail.clone() {
            return Err(err);
        }
        state.acquired = true;
        state.on_error = Some(on_error);
        self.log.push("output.acquire");
        Ok(StreamFormat {
            sample_rate: 24000,
            channels: 1,
        })
    }

    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().clock
    }

    fn start_at(&mut self, voice: VoiceId, frame: &AudioFrame, when: f64) -> AppResult<f64> {
        let mut state = self.state.lock().unwrap();
        if state.fail_start {
            return Err(AppError::DeviceUnavailable("speaker refused buffer".to_string()));
        }
        state.clock += state.start_delay;
        let start = when.max(state.clock);
        state.voices.push(FakeVoice {
            id: voice,
            start,
            duration: frame.duration_secs(),
        });
        Ok(start)
    }

    fn cancel(&mut self, voice: VoiceId) {
        let mut state = self.state.lock().unwrap();
        state.voices.retain(|v| v.id != voice);
        state.cancelled.push(voice);
    }

    fn release(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.voices.clear();
        state.on_error = None;
        if state.acquired {
            state.acquired = false;
            state.release_count += 1;
            self.log.push("output.release");
        }
    }
}

struct TransportState {
    auto_open: bool,
    connect_error: Option<AppError>,
    events: Option<EventSender>,
    connection: Option<ConnectionId>,
    next_id: ConnectionId,
    connect_count: u32,
    close_count: u32,
    sent: Vec<Vec<u8>>,
    outcome: SendOutcome,
}

/// Transport driven by the test: it records frames and emits whatever events
/// the test asks for.
#[derive(Clone)]
pub struct ScriptedTransport {
    state: Arc<Mutex<TransportState>>,
    log: EventLog,
}

impl ScriptedTransport {
    /// Never opens on its own.
    pub fn new(log: EventLog) -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState {
                auto_open: false,
                connect_error: None,
                events: None,
                connection: None,
                next_id: 1,
                connect_count: 0,
                close_count: 0,
                sent: Vec::new(),
                outcome: SendOutcome::Queued,
            })),
            log,
        }
    }

    /// Emits `Opened` as soon as it is connected.
    pub fn auto_open(log: EventLog) -> Self {
        let transport = Self::new(log);
        transport.state.lock().unwrap().auto_open = true;
        transport
    }

    pub fn fail_connect(&self, err: AppError) {
        self.state.lock().unwrap().connect_error = Some(err);
    }

    pub fn set_send_outcome(&self, outcome: SendOutcome) {
        self.state.lock().unwrap().outcome = outcome;
    }

    /// Emit an event on the current connection. Returns false when there is
    /// no connection or the controller is gone.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let target = {
            let state = self.state.lock().unwrap();
            state.events.clone().zip(state.connection)
        };
        match target {
            Some((events, id)) => events.send((id, event)).await.is_ok(),
            None => false,
        }
    }

    /// Emit an event tagged with an arbitrary connection id.
    pub async fn emit_as(&self, id: ConnectionId, event: TransportEvent) -> bool {
        let events = self.state.lock().unwrap().events.clone();
        match events {
            Some(events) => events.send((id, event)).await.is_ok(),
            None => false,
        }
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().unwrap().connect_count
    }

    pub fn close_count(&self) -> u32 {
        self.state.lock().unwrap().close_count
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connection.is_some()
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self, _config: &LiveConfig, events: EventSender) -> AppResult<ConnectionId> {
        let mut state = self.state.lock().unwrap();
        state.connect_count += 1;
        if let Some(err) = state.connect_error.clone() {
            return Err(err);
        }
        let id = state.next_id;
        state.next_id += 1;
        if state.auto_open {
            let _ = events.try_send((id, TransportEvent::Opened));
        }
        state.events = Some(events);
        state.connection = Some(id);
        self.log.push("transport.connect");
        Ok(id)
    }

    fn send(&mut self, frame: Vec<u8>) -> SendOutcome {
        let mut state = self.state.lock().unwrap();
        if state.connection.is_none() {
            return SendOutcome::NotConnected;
        }
        if state.outcome == SendOutcome::Queued {
            state.sent.push(frame);
        }
        state.outcome
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.connection.take().is_some() {
            state.close_count += 1;
            self.log.push("transport.close");
        }
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Await `future` with a five second limit.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

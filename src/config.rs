//! # Configuration Management
//!
//! This module handles loading and managing the session configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between sections and keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `GEMINI_API_KEY` / `API_KEY` for the remote service key
//! 2. Environment variables (APP_LIVE__VOICE, APP_AUDIO__BLOCK_SIZE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Audio formats, the remote service, session tuning and device selection
/// change for different reasons, so each gets its own group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub live: LiveConfig,
    pub session: SessionConfig,
    pub devices: DevicesConfig,
}

/// Audio format settings for both directions.
///
/// ## Fields:
/// - `capture_sample_rate`: rate of outbound PCM16 frames (16 kHz for the Live service)
/// - `playback_sample_rate`: rate of inbound PCM16 chunks (24 kHz for the Live service)
/// - `block_size`: samples per outbound frame (4096 samples = 256 ms at 16 kHz)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub block_size: usize,
}

/// How the remote service should answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseModality {
    /// Synthesized speech only
    Audio,
    /// Synthesized speech plus text parts
    AudioText,
}

impl ResponseModality {
    /// Modality names as the Live protocol spells them.
    pub fn wire_names(&self) -> Vec<String> {
        match self {
            ResponseModality::Audio => vec!["AUDIO".to_string()],
            ResponseModality::AudioText => vec!["AUDIO".to_string(), "TEXT".to_string()],
        }
    }
}

/// Remote voice service settings.
///
/// ## Fields:
/// - `endpoint`: ws:// or wss:// URL of the bidirectional streaming endpoint
/// - `model`: model resource name sent in the setup message
/// - `api_key`: appended as `key=` query parameter when non-empty
/// - `voice`: prebuilt voice/persona name (e.g. "Puck")
/// - `modality`: audio-only or audio+text responses
/// - `system_prompt`: behavioral framing sent as the system instruction
///
/// None of these affect the codec or the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub voice: String,
    pub modality: ResponseModality,
    pub system_prompt: String,
}

/// What the transport does when outbound frames arrive faster than the
/// connection can write them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Bounded queue; the newest frame is dropped when the queue is full
    Drop,
    /// Unbounded queue; every frame is eventually written
    Buffer,
}

/// Session tuning.
///
/// ## Tuning guidelines:
/// - `connect_timeout_ms`: how long Connecting may last before the session fails
/// - `outbound_queue_frames`: queue depth for the `drop` backpressure policy
/// - `event_queue_capacity`: depth of the device → controller channels
/// - `max_playback_errors`: consecutive output-device errors tolerated before failing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub connect_timeout_ms: u64,
    pub outbound_queue_frames: usize,
    pub backpressure: BackpressurePolicy,
    pub event_queue_capacity: usize,
    pub max_playback_errors: u32,
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Which audio devices to open. "default" selects the host default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    pub input: String,
    pub output: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig {
                capture_sample_rate: 16000,
                playback_sample_rate: 24000,
                block_size: 4096,
            },
            live: LiveConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                api_key: String::new(),
                voice: "Puck".to_string(),
                modality: ResponseModality::Audio,
                system_prompt: "You are an enthusiastic study companion. You speak Spanish. Help the child practice pronunciation and answer curious questions briefly.".to_string(),
            },
            session: SessionConfig {
                connect_timeout_ms: 10_000,
                outbound_queue_frames: 32,
                backpressure: BackpressurePolicy::Drop,
                event_queue_capacity: 64,
                max_playback_errors: 3,
            },
            devices: DevicesConfig {
                input: "default".to_string(),
                output: "default".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_LIVE__VOICE=Kore`: Override the voice
    /// - `APP_AUDIO__BLOCK_SIZE=2048`: Override the capture block size
    /// - `APP_SESSION__BACKPRESSURE=buffer`: Never drop outbound frames
    /// - `GEMINI_API_KEY=...` or `API_KEY=...`: Remote service key
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(key) = env::var("API_KEY") {
            settings = settings.set_override("live.api_key", key)?;
        }

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("live.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.block_size == 0 {
            return Err(anyhow::anyhow!("Capture block size must be greater than 0"));
        }

        if !self.live.endpoint.starts_with("ws://") && !self.live.endpoint.starts_with("wss://") {
            return Err(anyhow::anyhow!(
                "Live endpoint must be a ws:// or wss:// URL, got '{}'",
                self.live.endpoint
            ));
        }

        if self.session.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }

        if self.session.outbound_queue_frames == 0 || self.session.event_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Queue capacities must be greater than 0"));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML, with the API key masked.
    pub fn to_toml_string(&self) -> Result<String> {
        let mut shown = self.clone();
        if !shown.live.api_key.is_empty() {
            shown.live.api_key = "***".to_string();
        }
        Ok(toml::to_string_pretty(&shown)?)
    }
}

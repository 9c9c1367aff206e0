//! # Error Handling
//!
//! This module defines the error taxonomy for a live voice session and how
//! each kind of failure is treated by the session controller.
//!
//! ## Error Categories:
//! - **DeviceUnavailable**: microphone or speaker could not be acquired (fatal)
//! - **ConnectionFailed**: the remote connection could not open or dropped (fatal)
//! - **MalformedAudioData**: an audio payload could not be decoded (chunk dropped)
//! - **UnknownMessage**: an inbound message had an unrecognized shape (ignored)
//! - **InvalidState**: an operation was requested in a state that does not allow it
//! - **ConfigError**: configuration file or environment variable problems
//! - **Internal**: anything else that went wrong inside the process
//!
//! ## Propagation Policy:
//! Codec and scheduler errors stay local to the chunk that caused them.
//! Transport and device errors always reach the session controller, which
//! tears the whole session down before reporting them to the caller.

use std::fmt;

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::DeviceUnavailable("no default input device".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Microphone or speaker could not be acquired or failed while streaming
    DeviceUnavailable(String),

    /// Transport could not open, timed out, or dropped
    ConnectionFailed(String),

    /// Audio payload byte length is not a whole number of samples
    MalformedAudioData(String),

    /// Inbound message shape was not recognized
    UnknownMessage(String),

    /// Operation is not allowed in the current session state
    InvalidState(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// Anything else
    Internal(String),
}

impl AppError {
    /// Machine-readable error code, used in log fields and status reports.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::DeviceUnavailable(_) => "device_unavailable",
            AppError::ConnectionFailed(_) => "connection_failed",
            AppError::MalformedAudioData(_) => "malformed_audio_data",
            AppError::UnknownMessage(_) => "unknown_message",
            AppError::InvalidState(_) => "invalid_state",
            AppError::ConfigError(_) => "config_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Whether this error must end the session.
    ///
    /// Device and connection failures always do. Malformed audio and unknown
    /// messages only affect the payload that produced them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::DeviceUnavailable(_) | AppError::ConnectionFailed(_)
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DeviceUnavailable(msg) => write!(f, "Audio device unavailable: {}", msg),
            AppError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            AppError::MalformedAudioData(msg) => write!(f, "Malformed audio data: {}", msg),
            AppError::UnknownMessage(msg) => write!(f, "Unknown message: {}", msg),
            AppError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Automatic conversion from anyhow::Error to AppError.
///
/// When you use `?` with an anyhow::Error, it becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Inbound JSON that cannot be parsed is an unrecognized message, not a
/// transport failure.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::UnknownMessage(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::ConnectionFailed(err.to_string())
    }
}

impl From<cpal::DevicesError> for AppError {
    fn from(err: cpal::DevicesError) -> Self {
        AppError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DeviceNameError> for AppError {
    fn from(err: cpal::DeviceNameError) -> Self {
        AppError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AppError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        AppError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for AppError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        AppError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for AppError {
    fn from(err: cpal::BuildStreamError) -> Self {
        AppError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for AppError {
    fn from(err: cpal::PlayStreamError) -> Self {
        AppError::DeviceUnavailable(err.to_string())
    }
}

impl From<rubato::ResamplerConstructionError> for AppError {
    fn from(err: rubato::ResamplerConstructionError) -> Self {
        AppError::Internal(format!("Resampler setup failed: {}", err))
    }
}

impl From<rubato::ResampleError> for AppError {
    fn from(err: rubato::ResampleError) -> Self {
        AppError::Internal(format!("Resampling failed: {}", err))
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;

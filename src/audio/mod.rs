//! # Audio Processing Module
//!
//! Everything between the audio devices and the transport.
//!
//! ## Key Components:
//! - **Codec**: float samples ⇄ PCM16 little-endian
//! - **Buffer**: audio frames, downmixing, resampling and capture blocks
//! - **Capture**: microphone → encoded frames
//! - **Playback**: decoded frames → gapless speaker timeline
//! - **Session**: the controller tying capture, transport and playback together
//! - **cpal I/O**: the real microphone and speaker
//!
//! ## Audio Format Requirements:
//! - **Capture**: 16 kHz mono PCM16
//! - **Playback**: 24 kHz mono PCM16
//! - **Encoding**: Little-endian signed integers

pub mod buffer; // Audio frames and block accumulation
pub mod capture; // Microphone pipeline
pub mod codec; // PCM16 conversion
pub mod cpal_io; // cpal-backed devices
pub mod playback; // Playback timeline
pub mod session; // Session state machine

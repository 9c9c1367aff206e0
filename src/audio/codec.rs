//! # PCM16 Codec
//!
//! Converts between device-native float samples and the signed 16-bit
//! little-endian representation used on the wire.
//!
//! ## Conversion:
//! - **encode**: `sample * 32768`, truncated toward zero
//! - **decode**: `sample / 32768`
//!
//! Both directions are pure functions; they only allocate.

use crate::audio::buffer::AudioFrame;
use crate::error::{AppError, AppResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Scale between the float range [-1.0, 1.0] and the i16 range.
pub const PCM16_SCALE: f32 = 32768.0;

/// Bytes per encoded sample.
pub const PCM16_SAMPLE_WIDTH: usize = 2;

/// Encode float samples as PCM16 little-endian bytes.
///
/// Input outside [-1.0, 1.0] saturates at `i16::MIN` / `i16::MAX` rather than
/// wrapping around, so a hot microphone clips instead of flipping sign.
/// `1.0` itself encodes as `i16::MAX`.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * PCM16_SAMPLE_WIDTH);
    for &sample in samples {
        // Float-to-int `as` truncates toward zero and saturates; NaN becomes 0.
        let value = (sample * PCM16_SCALE) as i16;
        // Writing into a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>(value);
    }
    bytes
}

/// Decode PCM16 little-endian bytes into a playable frame.
///
/// ## Errors:
/// `MalformedAudioData` when the byte length is odd, when there are no
/// samples at all, or when the samples do not divide into `channels`.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> AppResult<AudioFrame> {
    if bytes.len() % PCM16_SAMPLE_WIDTH != 0 {
        return Err(AppError::MalformedAudioData(format!(
            "byte length {} is not a multiple of {}",
            bytes.len(),
            PCM16_SAMPLE_WIDTH
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / PCM16_SAMPLE_WIDTH);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / PCM16_SCALE);
    }

    AudioFrame::new(samples, sample_rate, channels)
}

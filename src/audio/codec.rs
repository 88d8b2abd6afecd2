//! PCM16 wire encoding for outbound frames and inbound speech chunks.
//!
//! Outbound: f32 samples in `[-1, 1]` -> saturating i16 little-endian ->
//! standard base64. Inbound: the reverse, yielding a [`DecodedBuffer`]
//! ready for the playback scheduler.

use crate::audio::capture::AudioFrame;
use crate::error::{Result, SessionError};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Mime type prefix for raw 16-bit little-endian PCM.
pub const PCM_MIME_PREFIX: &str = "audio/pcm";

/// Base64-framed audio payload as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub mime_type: String,
    pub data: String,
}

/// Decoded mono speech ready for scheduling.
#[derive(Debug, Clone)]
pub struct DecodedBuffer {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl DecodedBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Playback length of this buffer.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = (self.samples.len() as u64).saturating_mul(1_000_000_000);
        Duration::from_nanos(nanos / u64::from(self.sample_rate))
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Quantize f32 samples to 16-bit little-endian PCM.
pub fn pcm16_from_f32(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample.clamp(-1.0, 1.0) * 32768.0).round();
        let value = scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Expand 16-bit little-endian PCM back to f32 samples.
///
/// # Errors
///
/// Returns [`SessionError::Codec`] if the byte count is odd.
pub fn f32_from_pcm16(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(SessionError::Codec(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

/// Encode a captured frame for the outbound channel.
pub fn encode_frame(frame: &AudioFrame) -> MediaBlob {
    MediaBlob {
        mime_type: format!("{PCM_MIME_PREFIX};rate={}", frame.sample_rate),
        data: B64.encode(pcm16_from_f32(&frame.samples)),
    }
}

/// Decode an inbound base64 PCM16 chunk.
///
/// The sample rate is read from a `rate=` mime parameter when present,
/// otherwise `default_rate` is used.
///
/// # Errors
///
/// Returns [`SessionError::Codec`] for invalid base64, odd byte counts, or
/// non-PCM mime types.
pub fn decode_chunk(data: &str, mime_type: &str, default_rate: u32) -> Result<DecodedBuffer> {
    if !mime_type.is_empty() && !mime_type.starts_with(PCM_MIME_PREFIX) {
        return Err(SessionError::Codec(format!(
            "unsupported audio mime type '{mime_type}'"
        )));
    }
    let bytes = B64
        .decode(data)
        .map_err(|e| SessionError::Codec(format!("invalid base64 audio: {e}")))?;
    let samples = f32_from_pcm16(&bytes)?;
    let rate = mime_rate(mime_type).unwrap_or(default_rate);
    Ok(DecodedBuffer::new(samples, rate))
}

/// Extract the `rate=` parameter from a mime type like `audio/pcm;rate=24000`.
fn mime_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

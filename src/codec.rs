//! 16-bit PCM codec
//!
//! Converts between floating point samples and the little-endian S16 wire
//! representation used by the Live API, wrapped in standard base64.

use base64::engine::general_purpose;
use base64::Engine;

/// Scale between the float domain `[-1, 1]` and the i16 domain.
const PCM_SCALE: f32 = 32768.0;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid sample data: {0}")]
    InvalidSampleData(String),

    #[error("malformed frame: {samples} samples cannot be split across {channels} channel(s)")]
    MalformedFrame { samples: usize, channels: u16 },

    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A decoded, de-interleaved block of audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// One vector of samples per channel, all of equal length.
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            channels: vec![samples],
            sample_rate,
        }
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Re-interleave the channels as S16LE bytes, for devices that take raw PCM.
    pub fn to_pcm16_bytes(&self) -> Vec<u8> {
        let frames = self.frames();
        let mut out = Vec::with_capacity(frames * self.channels.len() * 2);
        for i in 0..frames {
            for channel in &self.channels {
                out.extend_from_slice(&quantize(channel[i]).to_le_bytes());
            }
        }
        out
    }
}

/// Float sample to i16, truncating toward zero and saturating at the rails.
fn quantize(sample: f32) -> i16 {
    // `as` saturates out-of-range values and truncates the fraction.
    (sample * PCM_SCALE) as i16
}

/// Encode float samples as base64-wrapped S16LE.
pub fn pcm_encode(samples: &[f32]) -> Result<String, CodecError> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for (i, &sample) in samples.iter().enumerate() {
        if !sample.is_finite() {
            return Err(CodecError::InvalidSampleData(format!(
                "sample {} is not finite ({})",
                i, sample
            )));
        }
        bytes.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    Ok(general_purpose::STANDARD.encode(&bytes))
}

/// Decode base64-wrapped S16LE into a de-interleaved float buffer.
pub fn pcm_decode(data: &str, sample_rate: u32, channel_count: u16) -> Result<AudioBuffer, CodecError> {
    let bytes = general_purpose::STANDARD.decode(data)?;
    pcm_decode_bytes(&bytes, sample_rate, channel_count)
}

/// Decode raw S16LE bytes (already unwrapped from transport encoding).
pub fn pcm_decode_bytes(bytes: &[u8], sample_rate: u32, channel_count: u16) -> Result<AudioBuffer, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::InvalidSampleData(format!(
            "{} bytes is not a whole number of 16-bit samples",
            bytes.len()
        )));
    }
    let total = bytes.len() / 2;
    if channel_count == 0 || total % channel_count as usize != 0 {
        return Err(CodecError::MalformedFrame {
            samples: total,
            channels: channel_count,
        });
    }

    let channel_count = channel_count as usize;
    let frames = total / channel_count;
    let mut channels = vec![Vec::with_capacity(frames); channel_count];
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        channels[i % channel_count].push(sample as f32 / PCM_SCALE);
    }

    Ok(AudioBuffer {
        channels,
        sample_rate,
    })
}

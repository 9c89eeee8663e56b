//! PCM16 little-endian codec
//!
//! The wire format in both directions is signed 16-bit little-endian PCM.
//! Outbound frames are encoded from f32 samples, inbound chunks are decoded
//! into a playable [`PcmBuffer`].

use super::AudioError;

/// Scale between normalized f32 samples and i16 PCM
const PCM_SCALE: f32 = i16::MAX as f32;

/// Decoded audio ready for playback
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    /// Interleaved samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u16,
}

impl PcmBuffer {
    /// Create a mono buffer
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Number of sample frames (samples per channel)
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Playback duration in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Collapse to a single channel by averaging
    pub fn into_mono(self) -> Vec<f32> {
        match self.channels {
            0 | 1 => self.samples,
            n => super::resample::downmix(&self.samples, n),
        }
    }
}

/// Encode normalized samples as PCM16 little-endian bytes
///
/// Each sample is scaled by 32767 and clamped to the i16 range.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| sample_to_i16(s).to_le_bytes())
        .collect()
}

/// Decode PCM16 little-endian bytes into a playable buffer
///
/// Fails with `MalformedAudioData` when the payload is not a whole number of
/// 16-bit sample frames for the declared channel count.
pub fn decode(payload: &[u8], sample_rate: u32, channels: u16) -> Result<PcmBuffer, AudioError> {
    if channels == 0 {
        return Err(AudioError::MalformedAudioData(
            "channel count must be at least 1".to_string(),
        ));
    }

    let frame_bytes = 2 * channels as usize;
    if payload.len() % frame_bytes != 0 {
        return Err(AudioError::MalformedAudioData(format!(
            "payload of {} bytes is not a multiple of {} bytes",
            payload.len(),
            frame_bytes
        )));
    }

    let samples = payload
        .chunks_exact(2)
        .map(|b| i16_to_sample(i16::from_le_bytes([b[0], b[1]])))
        .collect();

    Ok(PcmBuffer {
        samples,
        sample_rate,
        channels,
    })
}

/// Convert a normalized sample to i16
pub fn sample_to_i16(sample: f32) -> i16 {
    (sample * PCM_SCALE)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Convert an i16 sample back to the normalized range
pub fn i16_to_sample(sample: i16) -> f32 {
    (sample as f32 / PCM_SCALE).max(-1.0)
}

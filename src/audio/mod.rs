//! Audio pipeline for live voice sessions
//!
//! Microphone capture, PCM16 framing, gapless playback scheduling and
//! level metering. Device access goes through the [`AudioHost`] seam so the
//! pipeline can run against cpal in production and against fakes in tests.

pub mod capture;
pub mod cpal_host;
pub mod device;
pub mod meter;
pub mod pcm;
pub mod playback;
pub mod resample;

pub use capture::{AudioFrame, CapturePipeline, FrameSlicer, FRAME_SAMPLES, INPUT_SAMPLE_RATE};
pub use cpal_host::CpalHost;
pub use device::{AudioHost, Microphone, MicrophoneHooks, SourceId, Speaker, SpeakerHooks};
pub use meter::{create_level_channel, LevelMeter, LevelTap};
pub use pcm::PcmBuffer;
pub use playback::{PlaybackScheduler, ScheduledChunk, OUTPUT_SAMPLE_RATE};

/// Errors that can occur in the audio pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    /// Microphone or speaker could not be acquired
    DeviceUnavailable(String),
    /// Device offers no stream format we can drive
    UnsupportedFormat(String),
    /// PCM payload could not be decoded
    MalformedAudioData(String),
    /// Source was already stopped or finished playing
    AlreadyStopped(SourceId),
    /// Operation on a device that has been closed
    DeviceClosed,
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::DeviceUnavailable(e) => write!(f, "Audio device unavailable: {}", e),
            AudioError::UnsupportedFormat(e) => write!(f, "Unsupported audio format: {}", e),
            AudioError::MalformedAudioData(e) => write!(f, "Malformed audio data: {}", e),
            AudioError::AlreadyStopped(id) => write!(f, "Audio source {} already stopped", id),
            AudioError::DeviceClosed => write!(f, "Audio device is closed"),
        }
    }
}

impl std::error::Error for AudioError {}

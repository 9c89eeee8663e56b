//! Audio device seam
//!
//! The capture pipeline and playback scheduler only talk to devices through
//! these traits. [`super::CpalHost`] is the production implementation.

use tokio::sync::mpsc;

use super::meter::LevelTap;
use super::{AudioError, PcmBuffer};

/// Identifier of a scheduled output source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receives mono f32 samples at the requested capture rate
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Receives runtime stream errors after the device was opened
pub type DeviceErrorCallback = Box<dyn FnMut(String) + Send + 'static>;

/// Callbacks wired into a microphone stream
pub struct MicrophoneHooks {
    pub on_samples: SampleCallback,
    pub on_error: DeviceErrorCallback,
}

/// Channels wired into a speaker stream
pub struct SpeakerHooks {
    /// Notified once for every source that finishes playing on its own
    pub ended: mpsc::UnboundedSender<SourceId>,
    /// Rendered output mix, for level metering
    pub level_tap: LevelTap,
    pub on_error: DeviceErrorCallback,
}

/// Provider of input and output devices
pub trait AudioHost: Send + Sync + 'static {
    /// Acquire the microphone and start delivering mono samples at `sample_rate`.
    fn open_microphone(
        &self,
        sample_rate: u32,
        hooks: MicrophoneHooks,
    ) -> Result<Box<dyn Microphone>, AudioError>;

    /// Acquire the speaker. The returned device clock starts at zero.
    fn open_speaker(
        &self,
        sample_rate: u32,
        hooks: SpeakerHooks,
    ) -> Result<Box<dyn Speaker>, AudioError>;
}

/// An open microphone stream. Dropping it also releases the device.
pub trait Microphone {
    /// Release the device. Must be safe to call more than once.
    fn close(&mut self);
}

/// An open output device with a schedulable timeline
pub trait Speaker {
    /// Current device clock in seconds
    fn current_time(&self) -> f64;

    /// Schedule `buffer` to begin at absolute device time `at` (seconds).
    fn start_source(&mut self, buffer: PcmBuffer, at: f64) -> Result<SourceId, AudioError>;

    /// Stop a source immediately.
    ///
    /// Returns `AlreadyStopped` if it already finished or was stopped.
    fn stop_source(&mut self, id: SourceId) -> Result<(), AudioError>;

    /// Stop all output and release the device. Must be safe to call more than once.
    fn close(&mut self);
}

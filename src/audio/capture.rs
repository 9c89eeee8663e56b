//! Microphone capture pipeline
//!
//! Slices the microphone stream into fixed 4096-sample frames at 16kHz mono,
//! encodes each frame to PCM16 and hands it to the frame callback. Every
//! delivered batch is also pushed to the input level tap.
//!
//! # Architecture
//!
//! ```text
//! Device thread (sync)
//! ┌──────────────────────────────────────────────┐
//! │ Microphone callback (mono f32 @ 16kHz)       │
//! │   ├─ LevelTap::push        (volume meter)    │
//! │   └─ FrameSlicer::push ──▶ encode ──▶ on_frame│
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The frame callback is invoked on the device thread and must not block;
//! production code hands frames to the transport's outbound queue.

use super::device::{AudioHost, DeviceErrorCallback, Microphone, MicrophoneHooks, SampleCallback};
use super::meter::LevelTap;
use super::{pcm, AudioError};

/// Capture sample rate expected by the remote service
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Samples per outbound frame (256ms at 16kHz)
pub const FRAME_SAMPLES: usize = 4096;

/// One encoded outbound frame
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Capture order, starting at 0 for each pipeline start
    pub sequence: u64,
    /// PCM16 little-endian mono samples
    pub payload: Vec<u8>,
}

impl AudioFrame {
    /// Number of samples in the frame
    pub fn samples(&self) -> usize {
        self.payload.len() / 2
    }

    /// Frame duration in milliseconds at the capture rate
    pub fn duration_ms(&self) -> u64 {
        (self.samples() as u64 * 1000) / INPUT_SAMPLE_RATE as u64
    }
}

/// Receives encoded frames on the device thread
pub type FrameCallback = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// Accumulates samples and cuts them into fixed-size encoded frames
///
/// Holds at most one partial frame between calls.
#[derive(Debug)]
pub struct FrameSlicer {
    buffer: Vec<f32>,
    frame_samples: usize,
    next_sequence: u64,
}

impl FrameSlicer {
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            buffer: Vec::with_capacity(frame_samples * 2),
            frame_samples,
            next_sequence: 0,
        }
    }

    /// Add samples and emit every completed frame in order
    ///
    /// Returns the number of frames emitted.
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(AudioFrame)) -> usize {
        self.buffer.extend_from_slice(samples);

        let mut emitted = 0;
        while self.buffer.len() >= self.frame_samples {
            let payload = pcm::encode(&self.buffer[..self.frame_samples]);
            self.buffer.drain(..self.frame_samples);

            emit(AudioFrame {
                sequence: self.next_sequence,
                payload,
            });
            self.next_sequence += 1;
            emitted += 1;
        }

        emitted
    }

    /// Samples waiting for the next frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Sequence number the next frame will carry
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

/// Owns the microphone for the lifetime of a session
pub struct CapturePipeline {
    microphone: Option<Box<dyn Microphone>>,
}

impl CapturePipeline {
    /// Create an idle pipeline
    pub fn new() -> Self {
        Self { microphone: None }
    }

    /// Acquire the microphone and start producing frames
    ///
    /// # Arguments
    /// * `host` - Device provider
    /// * `on_frame` - Receives each encoded 4096-sample frame, in capture order
    /// * `level_tap` - Receives raw samples for the input volume meter
    /// * `on_error` - Receives stream errors after the device was opened
    ///
    /// Fails with `DeviceUnavailable` when no microphone can be opened.
    pub fn start(
        &mut self,
        host: &dyn AudioHost,
        mut on_frame: FrameCallback,
        level_tap: LevelTap,
        on_error: DeviceErrorCallback,
    ) -> Result<(), AudioError> {
        if self.microphone.is_some() {
            log::warn!("CapturePipeline: already running, restarting");
            self.stop();
        }

        let mut slicer = FrameSlicer::new(FRAME_SAMPLES);
        let on_samples: SampleCallback = Box::new(move |samples: &[f32]| {
            level_tap.push(samples);
            slicer.push(samples, &mut on_frame);
        });

        let microphone = host.open_microphone(
            INPUT_SAMPLE_RATE,
            MicrophoneHooks {
                on_samples,
                on_error,
            },
        )?;

        log::info!(
            "CapturePipeline: started ({}Hz mono, {} samples per frame)",
            INPUT_SAMPLE_RATE,
            FRAME_SAMPLES
        );
        self.microphone = Some(microphone);
        Ok(())
    }

    /// Release the microphone. No-op when not running.
    pub fn stop(&mut self) {
        if let Some(mut microphone) = self.microphone.take() {
            microphone.close();
            log::info!("CapturePipeline: microphone released");
        }
    }

    pub fn is_running(&self) -> bool {
        self.microphone.is_some()
    }
}

impl Default for CapturePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Sample rate conversion and channel downmix
//!
//! Devices rarely open at exactly 16kHz (capture) or 24kHz (playback). Each
//! stream owns one [`StreamResampler`] for its whole lifetime, so filter state
//! and fractional phase carry across callbacks and the sample clock does not
//! drift.

use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::{Fft, FixedSync, Resampler};

/// Resampler works on mono signals; callers downmix first
const MONO: usize = 1;

/// Number of sub-chunks for the FFT resampler (1 = lowest latency)
const SUB_CHUNKS: usize = 1;

/// Average interleaved channels into a mono signal
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }

    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// 10ms worth of frames at `rate`
fn block_frames(rate: u32) -> usize {
    (rate as usize / 100).max(1)
}

/// Stateful mono rate converter for one stream
///
/// Accepts input in blocks of any size and returns whatever output is ready.
/// Passes samples through untouched when the rates already match.
pub struct StreamResampler {
    /// `None` when source and target rates are equal
    resampler: Option<Fft<f32>>,
    source_rate: u32,
    target_rate: u32,
    input_buffer: Vec<f32>,
    work_in: Vec<Vec<f32>>,
    work_out: Vec<Vec<f32>>,
}

impl StreamResampler {
    /// Capture direction: fixed 10ms output blocks at `target_rate`
    pub fn for_capture(device_rate: u32, target_rate: u32) -> Result<Self, String> {
        Self::new(
            device_rate,
            target_rate,
            block_frames(target_rate),
            FixedSync::Output,
        )
    }

    /// Playback direction: fixed 10ms input blocks at `source_rate`
    pub fn for_playback(source_rate: u32, device_rate: u32) -> Result<Self, String> {
        Self::new(
            source_rate,
            device_rate,
            block_frames(source_rate),
            FixedSync::Input,
        )
    }

    fn new(
        source_rate: u32,
        target_rate: u32,
        chunk_size: usize,
        fixed: FixedSync,
    ) -> Result<Self, String> {
        if source_rate == 0 || target_rate == 0 {
            return Err(format!(
                "Invalid sample rate (source: {}, target: {})",
                source_rate, target_rate
            ));
        }

        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                source_rate,
                target_rate,
                input_buffer: Vec::new(),
                work_in: Vec::new(),
                work_out: Vec::new(),
            });
        }

        let resampler = Fft::<f32>::new(
            source_rate as usize,
            target_rate as usize,
            chunk_size,
            SUB_CHUNKS,
            MONO,
            fixed,
        )
        .map_err(|e| {
            format!(
                "Failed to create resampler {} -> {} Hz: {}",
                source_rate, target_rate, e
            )
        })?;

        let work_in = vec![vec![0.0; resampler.input_frames_max()]];
        let work_out = vec![vec![0.0; resampler.output_frames_max()]];

        Ok(Self {
            resampler: Some(resampler),
            source_rate,
            target_rate,
            input_buffer: Vec::new(),
            work_in,
            work_out,
        })
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Feed mono samples at the source rate, get mono samples at the target rate
    ///
    /// May return an empty vec while the first block is still filling.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>, String> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.input_buffer.extend_from_slice(samples);
        let mut output = Vec::new();

        while self.input_buffer.len() >= resampler.input_frames_next() {
            let frames_needed = resampler.input_frames_next();
            self.work_in[0][..frames_needed].copy_from_slice(&self.input_buffer[..frames_needed]);
            self.input_buffer.drain(..frames_needed);

            let input_adapter = SequentialSliceOfVecs::new(&self.work_in[..], MONO, frames_needed)
                .map_err(|e| format!("Input adapter error: {}", e))?;

            let output_frames = resampler.output_frames_next();
            let mut output_adapter =
                SequentialSliceOfVecs::new_mut(&mut self.work_out[..], MONO, output_frames)
                    .map_err(|e| format!("Output adapter error: {}", e))?;

            let (_, frames_written) = resampler
                .process_into_buffer(&input_adapter, &mut output_adapter, None)
                .map_err(|e| format!("Resampler error: {}", e))?;

            output.extend_from_slice(&self.work_out[0][..frames_written]);
        }

        Ok(output)
    }
}

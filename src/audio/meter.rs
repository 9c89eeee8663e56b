//! Volume metering for visualization
//!
//! Device callbacks push samples through a [`LevelTap`]; the session's meter
//! tick drains them into a [`LevelMeter`], which computes the spectral energy
//! of the most recent analysis window and reduces it to one value in 0.0-1.0.
//!
//! The computation follows a browser-style frequency analyser: Hann window,
//! magnitude spectrum, per-bin exponential smoothing, then decibels mapped
//! linearly from [`MIN_DECIBELS`, `MAX_DECIBELS`] to [0, 1] and averaged.
//! Levels are for display only and never feed back into scheduling.

use std::collections::VecDeque;
use std::f32::consts::PI;

use once_cell::sync::Lazy;
use tokio::sync::mpsc;

/// Analysis window length in samples
const WINDOW_SIZE: usize = 256;

/// Number of frequency bins (half the window)
const NUM_BINS: usize = WINDOW_SIZE / 2;

/// EMA smoothing factor (0.2 = 20% new value, 80% previous)
const EMA_ALPHA: f32 = 0.2;

/// Lower bound of the displayed decibel range
const MIN_DECIBELS: f32 = -100.0;

/// Upper bound of the displayed decibel range
const MAX_DECIBELS: f32 = -30.0;

/// Capacity of the tap channel in sample batches
const TAP_CAPACITY: usize = 100;

/// Hann window plus cos/sin tables for the DFT
struct SpectrumTables {
    window: [f32; WINDOW_SIZE],
    cos: [f32; WINDOW_SIZE],
    sin: [f32; WINDOW_SIZE],
}

static TABLES: Lazy<SpectrumTables> = Lazy::new(|| {
    let mut window = [0.0f32; WINDOW_SIZE];
    let mut cos = [0.0f32; WINDOW_SIZE];
    let mut sin = [0.0f32; WINDOW_SIZE];

    for i in 0..WINDOW_SIZE {
        let phase = 2.0 * PI * i as f32 / WINDOW_SIZE as f32;
        window[i] = 0.5 - 0.5 * phase.cos();
        cos[i] = phase.cos();
        sin[i] = phase.sin();
    }

    SpectrumTables { window, cos, sin }
});

/// Producer side of a level channel, cloned into device callbacks
#[derive(Clone)]
pub struct LevelTap {
    tx: mpsc::Sender<Vec<f32>>,
}

impl LevelTap {
    /// Hand samples to the meter without blocking
    ///
    /// Samples are dropped when the meter is behind; levels are display-only.
    pub fn push(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let _ = self.tx.try_send(samples.to_vec());
    }
}

/// Create a tap/meter pair
pub fn create_level_channel() -> (LevelTap, LevelMeter) {
    let (tx, rx) = mpsc::channel(TAP_CAPACITY);
    (LevelTap { tx }, LevelMeter::new(rx))
}

/// Sliding window of the most recent samples
struct AnalysisWindow {
    samples: VecDeque<f32>,
}

impl AnalysisWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW_SIZE),
        }
    }

    /// Add samples, keeping only the newest `WINDOW_SIZE`
    fn push_samples(&mut self, samples: &[f32]) {
        let len = samples.len();

        if len >= WINDOW_SIZE {
            self.samples.clear();
            self.samples.extend(&samples[len - WINDOW_SIZE..]);
            return;
        }

        let to_remove = (self.samples.len() + len).saturating_sub(WINDOW_SIZE);
        if to_remove > 0 {
            self.samples.drain(0..to_remove);
        }

        self.samples.extend(samples);
    }

    /// Magnitude spectrum of the window, zero-padded at the front when short
    fn magnitudes(&self) -> [f32; NUM_BINS] {
        let mut bins = [0.0f32; NUM_BINS];
        if self.samples.is_empty() {
            return bins;
        }

        let tables = &*TABLES;
        let pad = WINDOW_SIZE - self.samples.len();
        let mut frame = [0.0f32; WINDOW_SIZE];
        for (i, &s) in self.samples.iter().enumerate() {
            frame[pad + i] = s * tables.window[pad + i];
        }

        for (k, bin) in bins.iter_mut().enumerate() {
            let mut re = 0.0f32;
            let mut im = 0.0f32;
            for (n, &x) in frame.iter().enumerate() {
                let idx = (k * n) % WINDOW_SIZE;
                re += x * tables.cos[idx];
                im -= x * tables.sin[idx];
            }
            *bin = (re * re + im * im).sqrt() / WINDOW_SIZE as f32;
        }

        bins
    }

    fn clear(&mut self) {
        self.samples.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// EMA (Exponential Moving Average) smoothing state
///
/// smoothed[i] = alpha * current[i] + (1 - alpha) * previous[i]
struct EmaState {
    prev_bins: [f32; NUM_BINS],
    initialized: bool,
}

impl EmaState {
    fn new() -> Self {
        Self {
            prev_bins: [0.0f32; NUM_BINS],
            initialized: false,
        }
    }

    /// Apply EMA smoothing to the bins in-place
    fn apply(&mut self, bins: &mut [f32; NUM_BINS]) {
        if !self.initialized {
            // First frame: use raw values as initial state
            self.prev_bins = *bins;
            self.initialized = true;
            return;
        }

        for (bin, prev) in bins.iter_mut().zip(self.prev_bins.iter()) {
            *bin = EMA_ALPHA * *bin + (1.0 - EMA_ALPHA) * prev;
        }

        self.prev_bins = *bins;
    }

    fn reset(&mut self) {
        self.prev_bins = [0.0f32; NUM_BINS];
        self.initialized = false;
    }
}

/// Map smoothed magnitudes to a single 0.0-1.0 level
fn bins_to_level(bins: &[f32; NUM_BINS]) -> f32 {
    let range = MAX_DECIBELS - MIN_DECIBELS;
    let total: f32 = bins
        .iter()
        .map(|&mag| {
            if mag <= 0.0 {
                return 0.0;
            }
            let db = 20.0 * mag.log10();
            ((db - MIN_DECIBELS) / range).clamp(0.0, 1.0)
        })
        .sum();

    (total / NUM_BINS as f32).clamp(0.0, 1.0)
}

/// Consumer side of a level channel
pub struct LevelMeter {
    rx: mpsc::Receiver<Vec<f32>>,
    window: AnalysisWindow,
    ema: EmaState,
}

impl LevelMeter {
    fn new(rx: mpsc::Receiver<Vec<f32>>) -> Self {
        Self {
            rx,
            window: AnalysisWindow::new(),
            ema: EmaState::new(),
        }
    }

    /// Drain pending samples and compute the current level
    pub fn sample(&mut self) -> f32 {
        while let Ok(samples) = self.rx.try_recv() {
            self.window.push_samples(&samples);
        }

        let mut bins = self.window.magnitudes();
        self.ema.apply(&mut bins);
        bins_to_level(&bins)
    }

    /// Forget buffered samples and smoothing history
    pub fn reset(&mut self) {
        while self.rx.try_recv().is_ok() {}
        self.window.clear();
        self.ema.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / rate).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_window_bounded() {
        let mut window = AnalysisWindow::new();
        window.push_samples(&vec![0.1f32; 1000]);
        assert_eq!(window.len(), WINDOW_SIZE);

        window.push_samples(&[0.2, 0.3]);
        assert_eq!(window.len(), WINDOW_SIZE);
    }

    #[test]
    fn test_window_incremental() {
        let mut window = AnalysisWindow::new();
        window.push_samples(&[0.1, 0.2]);
        assert_eq!(window.len(), 2);
        window.push_samples(&[0.3, 0.4, 0.5]);
        assert_eq!(window.len(), 5);
    }

    #[test]
    fn test_silence_is_zero() {
        let (tap, mut meter) = create_level_channel();
        tap.push(&vec![0.0f32; 512]);
        assert_eq!(meter.sample(), 0.0);
    }

    #[test]
    fn test_empty_meter_is_zero() {
        let (_tap, mut meter) = create_level_channel();
        assert_eq!(meter.sample(), 0.0);
    }

    #[test]
    fn test_tone_raises_level() {
        let (tap, mut meter) = create_level_channel();
        tap.push(&sine(1000.0, 16_000.0, 0.8, 512));
        let loud = meter.sample();

        let (tap, mut quiet_meter) = create_level_channel();
        tap.push(&sine(1000.0, 16_000.0, 0.001, 512));
        let quiet = quiet_meter.sample();

        assert!(loud > 0.0 && loud <= 1.0, "level {} out of range", loud);
        assert!(loud > quiet, "loud {} should exceed quiet {}", loud, quiet);
    }

    #[test]
    fn test_full_scale_stays_in_range() {
        let (tap, mut meter) = create_level_channel();
        tap.push(&vec![1.0f32; 256]);
        tap.push(&sine(440.0, 24_000.0, 1.0, 256));
        for _ in 0..5 {
            let level = meter.sample();
            assert!((0.0..=1.0).contains(&level));
        }
    }

    #[test]
    fn test_ema_smoothing() {
        let mut ema = EmaState::new();

        let mut bins1 = [0.5f32; NUM_BINS];
        ema.apply(&mut bins1);
        assert_eq!(bins1[0], 0.5, "First frame should be unchanged");

        let mut bins2 = [1.0f32; NUM_BINS];
        ema.apply(&mut bins2);

        // Expected: 0.2 * 1.0 + 0.8 * 0.5 = 0.6
        let expected = EMA_ALPHA * 1.0 + (1.0 - EMA_ALPHA) * 0.5;
        assert!((bins2[0] - expected).abs() < 0.001);
    }

    #[test]
    fn test_ema_reset() {
        let mut ema = EmaState::new();
        let mut bins = [0.8f32; NUM_BINS];
        ema.apply(&mut bins);

        ema.reset();

        let mut bins2 = [0.2f32; NUM_BINS];
        ema.apply(&mut bins2);
        assert_eq!(bins2[0], 0.2, "After reset, first frame should be unchanged");
    }

    #[test]
    fn test_level_decays_after_sound_stops() {
        let (tap, mut meter) = create_level_channel();
        tap.push(&sine(500.0, 16_000.0, 0.9, 256));
        let peak = meter.sample();

        tap.push(&vec![0.0f32; 256]);
        let after = (0..30).map(|_| meter.sample()).last().unwrap_or(peak);

        assert!(after < peak, "level should fall ({} -> {})", peak, after);
    }

    #[test]
    fn test_reset_clears_level() {
        let (tap, mut meter) = create_level_channel();
        tap.push(&sine(500.0, 16_000.0, 0.9, 256));
        assert!(meter.sample() > 0.0);

        meter.reset();
        assert_eq!(meter.sample(), 0.0);
    }

    #[test]
    fn test_tap_drops_when_full() {
        let (tap, mut meter) = create_level_channel();
        for _ in 0..(TAP_CAPACITY + 10) {
            tap.push(&[0.5]);
        }
        // Must not block or panic; meter still produces a valid level
        let level = meter.sample();
        assert!((0.0..=1.0).contains(&level));
    }
}

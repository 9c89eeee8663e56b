//! Gapless playback scheduling
//!
//! Incoming chunks are placed back-to-back on the speaker's device clock.
//! A single cursor tracks where the next chunk starts:
//!
//! ```text
//! now ──┐
//!       ▼
//!  ─────┼──────────┬──────────┬──────────▶ device time
//!       │ chunk 1  │ chunk 2  │ chunk 3
//!       └ start    └ cursor   └ cursor
//! ```
//!
//! When the cursor has fallen behind the device clock (stall, first chunk,
//! after an interruption) it catches up to `now`, so audio never starts in
//! the past. Chunks never overlap.

use std::collections::BTreeSet;

use tokio::sync::mpsc;

use super::device::{AudioHost, DeviceErrorCallback, SourceId, Speaker, SpeakerHooks};
use super::meter::LevelTap;
use super::{AudioError, PcmBuffer};

/// Sample rate of synthesized speech from the remote service
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Placement of one scheduled chunk on the device clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub id: SourceId,
    /// Start time in seconds
    pub start: f64,
    /// Duration in seconds
    pub duration: f64,
}

impl ScheduledChunk {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Owns the speaker, the playback cursor and the set of active sources
pub struct PlaybackScheduler {
    speaker: Box<dyn Speaker>,
    /// Device time at which the next chunk begins
    cursor: f64,
    /// Sources that are playing or waiting to start
    active: BTreeSet<SourceId>,
    /// Natural-completion notifications from the speaker
    ended_rx: mpsc::UnboundedReceiver<SourceId>,
    chunks_scheduled: u64,
    closed: bool,
}

impl PlaybackScheduler {
    /// Acquire the speaker at the output sample rate
    ///
    /// Fails with `DeviceUnavailable` when no output device can be opened.
    pub fn start(
        host: &dyn AudioHost,
        level_tap: LevelTap,
        on_error: DeviceErrorCallback,
    ) -> Result<Self, AudioError> {
        let (ended, ended_rx) = mpsc::unbounded_channel();
        let speaker = host.open_speaker(
            OUTPUT_SAMPLE_RATE,
            SpeakerHooks {
                ended,
                level_tap,
                on_error,
            },
        )?;

        log::info!("PlaybackScheduler: started ({}Hz)", OUTPUT_SAMPLE_RATE);
        Ok(Self::with_speaker(speaker, ended_rx))
    }

    /// Wrap an already opened speaker
    pub fn with_speaker(
        speaker: Box<dyn Speaker>,
        ended_rx: mpsc::UnboundedReceiver<SourceId>,
    ) -> Self {
        Self {
            speaker,
            cursor: 0.0,
            active: BTreeSet::new(),
            ended_rx,
            chunks_scheduled: 0,
            closed: false,
        }
    }

    /// Schedule a decoded chunk directly after everything already queued
    pub fn schedule(&mut self, buffer: PcmBuffer) -> Result<ScheduledChunk, AudioError> {
        if self.closed {
            return Err(AudioError::DeviceClosed);
        }
        self.reap_finished();

        let duration = buffer.duration_secs();
        let now = self.speaker.current_time();
        if self.cursor < now {
            self.cursor = now;
        }

        let start = self.cursor;
        let id = self.speaker.start_source(buffer, start)?;
        self.cursor += duration;
        self.active.insert(id);
        self.chunks_scheduled += 1;

        log::debug!(
            "PlaybackScheduler: chunk {} at {:.3}s for {:.3}s (now {:.3}s, {} active)",
            id,
            start,
            duration,
            now,
            self.active.len()
        );

        Ok(ScheduledChunk {
            id,
            start,
            duration,
        })
    }

    /// Stop everything playing or queued and reset the cursor
    ///
    /// The next chunk is scheduled relative to the device clock again.
    /// Returns the number of sources that were stopped.
    pub fn interrupt(&mut self) -> usize {
        self.reap_finished();

        let mut stopped = 0;
        for id in std::mem::take(&mut self.active) {
            match self.speaker.stop_source(id) {
                Ok(()) => stopped += 1,
                // The device may have finished it between reap and stop
                Err(AudioError::AlreadyStopped(_)) => {}
                Err(e) => log::debug!("PlaybackScheduler: stop {} failed: {}", id, e),
            }
        }
        self.cursor = 0.0;

        log::info!("PlaybackScheduler: interrupted, {} source(s) stopped", stopped);
        stopped
    }

    /// Drop sources the speaker reported as finished
    pub fn reap_finished(&mut self) {
        while let Ok(id) = self.ended_rx.try_recv() {
            self.active.remove(&id);
        }
    }

    /// Stop all output and release the speaker. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.interrupt();
        self.speaker.close();
        self.closed = true;
        log::info!(
            "PlaybackScheduler: closed after {} chunk(s)",
            self.chunks_scheduled
        );
    }

    /// Device time at which the next chunk would begin (0 after an interruption)
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Current device clock in seconds
    pub fn current_time(&self) -> f64 {
        self.speaker.current_time()
    }

    /// Number of sources playing or waiting to start
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn chunks_scheduled(&self) -> u64 {
        self.chunks_scheduled
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

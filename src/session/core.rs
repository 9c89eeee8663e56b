//! Session effect runner
//!
//! [`SessionCore`] feeds every event through [`reduce`] and executes the
//! resulting effects against the live resources: capture pipeline, playback
//! scheduler, transport link and level meters. It is single-threaded and not
//! `Send`; [`super::SessionController`] hosts it on a dedicated thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::state::{reduce, Effect, Event, SessionState};
use super::{SessionError, SessionSnapshot, Voice};
use crate::audio::{
    create_level_channel, pcm, AudioFrame, AudioHost, CapturePipeline, LevelMeter,
    PlaybackScheduler, OUTPUT_SAMPLE_RATE,
};
use crate::audio::device::DeviceErrorCallback;
use crate::settings::LiveSettings;
use crate::transport::{Transport, TransportEvent, TransportEvents, TransportLink, TransportMessage};

/// Lets captured frames through to the transport only while connected
struct FrameGate {
    link: Mutex<Option<Arc<dyn TransportLink>>>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl FrameGate {
    fn new() -> Self {
        Self {
            link: Mutex::new(None),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn open(&self, link: Arc<dyn TransportLink>) {
        if let Ok(mut guard) = self.link.lock() {
            *guard = Some(link);
        }
    }

    fn close(&self) {
        if let Ok(mut guard) = self.link.lock() {
            *guard = None;
        }
    }

    /// Hand a frame to the transport, or refuse it when not connected
    ///
    /// Called on the device thread; the link only enqueues.
    fn submit(&self, frame: AudioFrame) -> Result<(), SessionError> {
        let guard = self.link.lock().map_err(|_| SessionError::NotConnected)?;
        match guard.as_ref() {
            Some(link) => {
                link.send(frame);
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SessionError::NotConnected)
            }
        }
    }
}

/// Everything owned by one live session
struct LiveSession {
    id: Uuid,
    capture: CapturePipeline,
    playback: PlaybackScheduler,
    link: Arc<dyn TransportLink>,
    gate: Arc<FrameGate>,
    input_meter: LevelMeter,
    output_meter: LevelMeter,
    malformed_chunks: u64,
    released: bool,
}

impl LiveSession {
    /// Release devices and close the stream; safe to call more than once
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        self.gate.close();
        self.capture.stop();
        self.link.close();
        self.playback.close();
        self.input_meter.reset();
        self.output_meter.reset();

        log::info!(
            "Session {} released: {} frames sent, {} dropped before open, {} chunks scheduled, {} malformed chunks dropped",
            self.id,
            self.gate.sent.load(Ordering::Relaxed),
            self.gate.dropped.load(Ordering::Relaxed),
            self.playback.chunks_scheduled(),
            self.malformed_chunks
        );
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Single-writer owner of the session state and its resources
pub struct SessionCore {
    host: Arc<dyn AudioHost>,
    transport: Arc<dyn Transport>,
    settings: LiveSettings,
    state: SessionState,
    live: Option<LiveSession>,
    input_volume: f32,
    output_volume: f32,
    device_tx: mpsc::UnboundedSender<Event>,
    device_rx: mpsc::UnboundedReceiver<Event>,
    transport_tx: mpsc::UnboundedSender<TransportMessage>,
    transport_rx: mpsc::UnboundedReceiver<TransportMessage>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl SessionCore {
    pub fn new(
        host: Arc<dyn AudioHost>,
        transport: Arc<dyn Transport>,
        settings: LiveSettings,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        Self::with_publisher(host, transport, settings, snapshot_tx)
    }

    /// Publish snapshots through an existing watch channel
    pub fn with_publisher(
        host: Arc<dyn AudioHost>,
        transport: Arc<dyn Transport>,
        settings: LiveSettings,
        snapshot_tx: watch::Sender<SessionSnapshot>,
    ) -> Self {
        let (device_tx, device_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        Self {
            host,
            transport,
            settings,
            state: SessionState::default(),
            live: None,
            input_volume: 0.0,
            output_volume: 0.0,
            device_tx,
            device_rx,
            transport_tx,
            transport_rx,
            snapshot_tx,
        }
    }

    pub fn connect(&mut self, voice: Voice) {
        self.handle(Event::Connect { voice });
    }

    pub fn disconnect(&mut self) {
        self.handle(Event::Disconnect);
    }

    /// True while a session is live and volumes need refreshing
    pub fn wants_meter_ticks(&self) -> bool {
        self.state.is_live()
    }

    /// Refresh volumes; call on the visual refresh cadence
    pub fn tick(&mut self) {
        self.handle(Event::MeterTick);
    }

    /// Run one event, and any follow-up events its effects produce, to completion
    pub fn handle(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            let (next, effects) = reduce(&self.state, event);

            if next.status() != self.state.status() {
                log::info!("State transition: {} -> {}", self.state.status(), next.status());
            }
            self.state = next;

            for effect in effects {
                if let Some(follow_up) = self.run_effect(effect) {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    /// Wait for the next transport or device event
    pub async fn next_event(&mut self) -> Option<Event> {
        tokio::select! {
            Some(msg) = self.transport_rx.recv() => Some(translate(msg)),
            Some(event) = self.device_rx.recv() => Some(event),
            else => None,
        }
    }

    /// Handle every transport and device event already queued
    ///
    /// Transport events are drained first, in delivery order.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let event = if let Ok(msg) = self.transport_rx.try_recv() {
                translate(msg)
            } else if let Ok(event) = self.device_rx.try_recv() {
                event
            } else {
                break;
            };
            self.handle(event);
            handled += 1;
        }
        handled
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn settings(&self) -> &LiveSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Device time at which the next inbound chunk would start
    pub fn playback_cursor(&self) -> Option<f64> {
        self.live.as_ref().map(|live| live.playback.cursor())
    }

    /// Output sources playing or waiting to start
    pub fn active_sources(&self) -> usize {
        self.live
            .as_ref()
            .map(|live| live.playback.active_count())
            .unwrap_or(0)
    }

    /// True while a microphone is held
    pub fn is_capturing(&self) -> bool {
        self.live
            .as_ref()
            .map(|live| live.capture.is_running())
            .unwrap_or(false)
    }

    fn run_effect(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::StartSession { id, voice } => match self.start_session(id, voice) {
                Ok(live) => {
                    self.live = Some(live);
                    None
                }
                Err(e) => {
                    log::error!("Failed to start session {}: {}", id, e);
                    Some(Event::StartFailed {
                        id,
                        err: e.to_string(),
                    })
                }
            },
            Effect::BeginForwarding { id } => {
                if let Some(live) = self.live_for(id) {
                    live.gate.open(live.link.clone());
                    log::info!("Session {} connected, forwarding microphone audio", id);
                }
                None
            }
            Effect::PlayChunk { id, payload } => self.play_chunk(id, &payload),
            Effect::InterruptPlayback { id } => {
                if let Some(live) = self.live_for(id) {
                    live.playback.interrupt();
                }
                None
            }
            Effect::SampleLevels => {
                if let Some(live) = self.live.as_mut() {
                    live.playback.reap_finished();
                    self.input_volume = live.input_meter.sample();
                    self.output_volume = live.output_meter.sample();
                    self.publish();
                }
                None
            }
            Effect::Teardown { id } => {
                if let Some(mut live) = self.live.take() {
                    if live.id != id {
                        log::warn!("Teardown for {} released session {}", id, live.id);
                    }
                    live.release();
                }
                self.input_volume = 0.0;
                self.output_volume = 0.0;
                None
            }
            Effect::EmitStatus => {
                self.publish();
                None
            }
        }
    }

    /// Acquire microphone and speaker, then open the transport
    ///
    /// Anything acquired before a failure is released when it goes out of scope.
    fn start_session(&mut self, id: Uuid, voice: Voice) -> Result<LiveSession, SessionError> {
        let gate = Arc::new(FrameGate::new());
        let (input_tap, input_meter) = create_level_channel();
        let (output_tap, output_meter) = create_level_channel();

        let mut capture = CapturePipeline::new();
        let frame_gate = gate.clone();
        capture.start(
            self.host.as_ref(),
            Box::new(move |frame: AudioFrame| {
                if let Err(e) = frame_gate.submit(frame) {
                    log::trace!("Frame not sent: {}", e);
                }
            }),
            input_tap,
            self.device_error_hook(id),
        )?;

        let playback =
            PlaybackScheduler::start(self.host.as_ref(), output_tap, self.device_error_hook(id))?;

        let events = TransportEvents::new(id, self.transport_tx.clone());
        let link = self
            .transport
            .open(self.settings.session_config(voice), events);

        log::info!("Session {} starting with voice {}", id, voice);

        Ok(LiveSession {
            id,
            capture,
            playback,
            link,
            gate,
            input_meter,
            output_meter,
            malformed_chunks: 0,
            released: false,
        })
    }

    /// Decode and schedule; a malformed chunk is dropped, the session continues
    fn play_chunk(&mut self, id: Uuid, payload: &[u8]) -> Option<Event> {
        let live = self.live_for(id)?;

        let buffer = match pcm::decode(payload, OUTPUT_SAMPLE_RATE, 1) {
            Ok(buffer) => buffer,
            Err(e) => {
                live.malformed_chunks += 1;
                log::warn!("Dropping inbound chunk: {}", SessionError::from(e));
                return None;
            }
        };

        match live.playback.schedule(buffer) {
            Ok(_) => None,
            Err(e) => Some(Event::DeviceFailed {
                id,
                err: SessionError::from(e).to_string(),
            }),
        }
    }

    fn live_for(&mut self, id: Uuid) -> Option<&mut LiveSession> {
        self.live.as_mut().filter(|live| live.id == id)
    }

    /// Routes runtime device errors into the session loop
    fn device_error_hook(&self, id: Uuid) -> DeviceErrorCallback {
        let tx = self.device_tx.clone();
        Box::new(move |reason: String| {
            let _ = tx.send(Event::DeviceFailed {
                id,
                err: SessionError::DeviceUnavailable(reason).to_string(),
            });
        })
    }

    fn publish(&self) {
        let snapshot =
            SessionSnapshot::from_state(&self.state, self.input_volume, self.output_volume);
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        if let Some(mut live) = self.live.take() {
            live.release();
        }
    }
}

fn translate(msg: TransportMessage) -> Event {
    let id = msg.session_id;
    match msg.event {
        TransportEvent::Opened => Event::TransportOpened { id },
        TransportEvent::AudioChunk(payload) => Event::AudioChunk { id, payload },
        TransportEvent::Interrupted => Event::Interrupted { id },
        TransportEvent::TurnComplete => Event::TurnComplete { id },
        TransportEvent::Closed(reason) => Event::TransportClosed { id, reason },
        TransportEvent::Error(reason) => Event::TransportFailed {
            id,
            err: SessionError::TransportError(reason).to_string(),
        },
    }
}

//! Integration tests for live voice sessions
//!
//! The session runs against in-memory devices and a scripted transport, so
//! no microphone, speaker or network is needed.
//!
//! ```bash
//! cargo test --test live_session_integration
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use vokey_live::audio::device::{DeviceErrorCallback, SampleCallback};
use vokey_live::audio::{
    AudioFrame, AudioHost, Microphone, MicrophoneHooks, PcmBuffer, SourceId, Speaker,
    SpeakerHooks, FRAME_SAMPLES,
};
use vokey_live::transport::{
    SessionConfig, Transport, TransportEvent, TransportEvents, TransportLink,
};
use vokey_live::{
    AudioError, LiveSettings, SessionController, SessionCore, SessionSnapshot, Status, Voice,
};

// ============================================================================
// Fake devices
// ============================================================================

#[derive(Default)]
struct Devices {
    deny_microphone: bool,
    on_samples: Option<SampleCallback>,
    microphone_error: Option<DeviceErrorCallback>,
    microphone_open: bool,
    microphone_closes: usize,
    speaker_open: bool,
    speaker_closes: usize,
    speaker_error: Option<DeviceErrorCallback>,
    ended: Option<mpsc::UnboundedSender<SourceId>>,
    now: f64,
    next_source: u64,
    /// (id, start, duration) of sources still playing
    playing: Vec<(SourceId, f64, f64)>,
    stopped: Vec<SourceId>,
}

#[derive(Clone, Default)]
struct FakeHost {
    devices: Arc<Mutex<Devices>>,
}

impl FakeHost {
    fn denying_microphone() -> Self {
        let host = Self::default();
        host.devices.lock().unwrap().deny_microphone = true;
        host
    }

    fn set_now(&self, now: f64) {
        self.devices.lock().unwrap().now = now;
    }

    /// Feed samples through the open microphone
    fn speak(&self, samples: &[f32]) {
        let mut devices = self.devices.lock().unwrap();
        let on_samples = devices
            .on_samples
            .as_mut()
            .expect("microphone is not open");
        on_samples(samples);
    }

    /// Report a runtime failure from the open speaker, like a cpal stream error
    fn fail_speaker(&self, reason: &str) {
        // Call outside the lock; the hook only posts to the session
        let hook = self.devices.lock().unwrap().speaker_error.take();
        let mut hook = hook.expect("speaker is not open");
        hook(reason.to_string());
    }

    fn playing(&self) -> Vec<(SourceId, f64, f64)> {
        self.devices.lock().unwrap().playing.clone()
    }
}

impl AudioHost for FakeHost {
    fn open_microphone(
        &self,
        _sample_rate: u32,
        hooks: MicrophoneHooks,
    ) -> Result<Box<dyn Microphone>, AudioError> {
        let mut devices = self.devices.lock().unwrap();
        if devices.deny_microphone {
            return Err(AudioError::DeviceUnavailable(
                "permission denied".to_string(),
            ));
        }
        devices.on_samples = Some(hooks.on_samples);
        devices.microphone_error = Some(hooks.on_error);
        devices.microphone_open = true;
        Ok(Box::new(FakeMicrophone {
            devices: self.devices.clone(),
        }))
    }

    fn open_speaker(
        &self,
        _sample_rate: u32,
        hooks: SpeakerHooks,
    ) -> Result<Box<dyn Speaker>, AudioError> {
        let mut devices = self.devices.lock().unwrap();
        devices.ended = Some(hooks.ended);
        devices.speaker_error = Some(hooks.on_error);
        devices.speaker_open = true;
        Ok(Box::new(FakeSpeaker {
            devices: self.devices.clone(),
        }))
    }
}

struct FakeMicrophone {
    devices: Arc<Mutex<Devices>>,
}

impl Microphone for FakeMicrophone {
    fn close(&mut self) {
        let mut devices = self.devices.lock().unwrap();
        if devices.microphone_open {
            devices.microphone_open = false;
            devices.on_samples = None;
            devices.microphone_error = None;
            devices.microphone_closes += 1;
        }
    }
}

struct FakeSpeaker {
    devices: Arc<Mutex<Devices>>,
}

impl Speaker for FakeSpeaker {
    fn current_time(&self) -> f64 {
        self.devices.lock().unwrap().now
    }

    fn start_source(&mut self, buffer: PcmBuffer, at: f64) -> Result<SourceId, AudioError> {
        let mut devices = self.devices.lock().unwrap();
        let id = SourceId(devices.next_source);
        devices.next_source += 1;
        devices.playing.push((id, at, buffer.duration_secs()));
        Ok(id)
    }

    fn stop_source(&mut self, id: SourceId) -> Result<(), AudioError> {
        let mut devices = self.devices.lock().unwrap();
        let before = devices.playing.len();
        devices.playing.retain(|(playing, _, _)| *playing != id);
        if devices.playing.len() == before {
            return Err(AudioError::AlreadyStopped(id));
        }
        devices.stopped.push(id);
        Ok(())
    }

    fn close(&mut self) {
        let mut devices = self.devices.lock().unwrap();
        if devices.speaker_open {
            devices.speaker_open = false;
            devices.playing.clear();
            devices.speaker_error = None;
            devices.speaker_closes += 1;
        }
    }
}

// ============================================================================
// Scripted transport
// ============================================================================

struct FakeLink {
    events: TransportEvents,
    frames: Mutex<Vec<AudioFrame>>,
    closed: AtomicBool,
}

impl TransportLink for FakeLink {
    fn send(&self, frame: AudioFrame) {
        self.frames.lock().unwrap().push(frame);
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Arrives after the session already ended
            self.events
                .emit(TransportEvent::Closed(Some("client closed".to_string())));
        }
    }
}

impl FakeLink {
    fn frames(&self) -> Vec<AudioFrame> {
        self.frames.lock().unwrap().clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeTransport {
    /// Emit `Opened` as soon as a stream is requested
    auto_open: bool,
    opened: Mutex<Vec<(SessionConfig, Arc<FakeLink>)>>,
}

impl FakeTransport {
    fn auto_opening() -> Self {
        Self {
            auto_open: true,
            ..Default::default()
        }
    }

    fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    fn last(&self) -> (SessionConfig, Arc<FakeLink>) {
        self.opened
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no stream was opened")
    }

    /// Deliver an event on the most recent stream
    fn emit(&self, event: TransportEvent) -> bool {
        self.last().1.events.emit(event)
    }
}

impl Transport for FakeTransport {
    fn open(&self, config: SessionConfig, events: TransportEvents) -> Arc<dyn TransportLink> {
        let link = Arc::new(FakeLink {
            events,
            frames: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        if self.auto_open {
            link.events.emit(TransportEvent::Opened);
        }
        self.opened.lock().unwrap().push((config, link.clone()));
        link
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn session_with(host: FakeHost) -> (SessionCore, FakeHost, Arc<FakeTransport>) {
    let transport = Arc::new(FakeTransport::default());
    let core = SessionCore::new(
        Arc::new(host.clone()),
        transport.clone(),
        LiveSettings::default(),
    );
    (core, host, transport)
}

fn session() -> (SessionCore, FakeHost, Arc<FakeTransport>) {
    session_with(FakeHost::default())
}

fn connected_session() -> (SessionCore, FakeHost, Arc<FakeTransport>) {
    let (mut core, host, transport) = session();
    core.connect(Voice::Kore);
    transport.emit(TransportEvent::Opened);
    core.process_pending();
    assert_eq!(core.snapshot().status, Status::Connected);
    (core, host, transport)
}

/// `seconds` of 24 kHz PCM16 silence
fn chunk(seconds: f64) -> Vec<u8> {
    vec![0u8; (seconds * 24_000.0) as usize * 2]
}

fn sine(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| 0.8 * (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 16_000.0).sin())
        .collect()
}

fn wait_for(controller: &SessionController, what: impl Fn(&SessionSnapshot) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if what(&controller.snapshot()) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[test]
fn connect_then_open_reaches_connected() {
    let (mut core, host, transport) = session();

    core.connect(Voice::Kore);
    let snapshot = core.snapshot();
    assert_eq!(snapshot.status, Status::Connecting);
    assert_eq!(snapshot.voice, Some(Voice::Kore));
    assert!(host.devices.lock().unwrap().microphone_open);
    assert_eq!(transport.open_count(), 1);
    assert_eq!(transport.last().0.voice, Voice::Kore);

    transport.emit(TransportEvent::Opened);
    assert_eq!(core.process_pending(), 1);

    let snapshot = core.snapshot();
    assert_eq!(snapshot.status, Status::Connected);
    assert_eq!(snapshot.error, None);
    assert!(snapshot.connected_at.is_some());
}

#[test]
fn connect_while_live_is_ignored() {
    let (mut core, _host, transport) = connected_session();
    let id = core.snapshot().session_id;

    core.connect(Voice::Puck);

    assert_eq!(transport.open_count(), 1);
    assert_eq!(core.snapshot().session_id, id);
    assert_eq!(core.snapshot().voice, Some(Voice::Kore));
}

#[test]
fn denied_microphone_ends_with_device_error() {
    let (mut core, host, transport) = session_with(FakeHost::denying_microphone());

    core.connect(Voice::Kore);

    let snapshot = core.snapshot();
    assert_eq!(snapshot.status, Status::Disconnected);
    let error = snapshot.error.expect("expected an error");
    assert!(error.contains("Audio device unavailable"), "{}", error);
    assert!(error.contains("permission denied"), "{}", error);
    assert_eq!(transport.open_count(), 0);
    assert!(!host.devices.lock().unwrap().speaker_open);
}

#[test]
fn transport_error_ends_session_and_releases_devices() {
    let (mut core, host, transport) = connected_session();

    transport.emit(TransportEvent::Error("network lost".to_string()));
    core.process_pending();

    let snapshot = core.snapshot();
    assert_eq!(snapshot.status, Status::Disconnected);
    let error = snapshot.error.expect("expected an error");
    assert!(error.contains("network lost"), "{}", error);
    assert_eq!(snapshot.input_volume, 0.0);
    assert_eq!(snapshot.output_volume, 0.0);

    let devices = host.devices.lock().unwrap();
    assert!(!devices.microphone_open);
    assert_eq!(devices.microphone_closes, 1);
    assert_eq!(devices.speaker_closes, 1);
    assert!(transport.last().1.is_closed());
    assert!(!core.is_capturing());
}

#[test]
fn device_error_after_open_ends_session() {
    let (mut core, host, transport) = connected_session();

    host.fail_speaker("output device unplugged");
    core.process_pending();

    let snapshot = core.snapshot();
    assert_eq!(snapshot.status, Status::Disconnected);
    let error = snapshot.error.expect("expected an error");
    assert!(error.contains("Audio device unavailable"), "{}", error);
    assert!(error.contains("output device unplugged"), "{}", error);

    let devices = host.devices.lock().unwrap();
    assert!(!devices.microphone_open);
    assert!(!devices.speaker_open);
    assert_eq!(devices.microphone_closes, 1);
    assert_eq!(devices.speaker_closes, 1);
    assert!(transport.last().1.is_closed());
    assert!(!core.is_capturing());
}

#[test]
fn remote_close_records_reason_only_when_given() {
    let (mut core, _host, transport) = connected_session();
    transport.emit(TransportEvent::Closed(Some("going away".to_string())));
    core.process_pending();
    assert_eq!(
        core.snapshot().error.as_deref(),
        Some("Connection closed: going away")
    );

    let (mut core, _host, transport) = connected_session();
    transport.emit(TransportEvent::Closed(None));
    core.process_pending();
    let snapshot = core.snapshot();
    assert_eq!(snapshot.status, Status::Disconnected);
    assert_eq!(snapshot.error, None);
}

#[test]
fn disconnect_is_idempotent() {
    let (mut core, host, transport) = connected_session();

    core.disconnect();
    core.disconnect();
    core.process_pending();

    let snapshot = core.snapshot();
    assert_eq!(snapshot.status, Status::Disconnected);
    assert_eq!(snapshot.error, None);

    let devices = host.devices.lock().unwrap();
    assert_eq!(devices.microphone_closes, 1);
    assert_eq!(devices.speaker_closes, 1);
    assert!(transport.last().1.is_closed());
}

#[test]
fn disconnect_without_session_does_nothing() {
    let (mut core, host, transport) = session();

    core.disconnect();

    assert_eq!(core.snapshot(), SessionSnapshot::default());
    assert_eq!(transport.open_count(), 0);
    assert_eq!(host.devices.lock().unwrap().microphone_closes, 0);
}

#[test]
fn disconnect_after_failure_keeps_error() {
    let (mut core, _host, transport) = connected_session();
    transport.emit(TransportEvent::Error("network lost".to_string()));
    core.process_pending();

    core.disconnect();

    assert!(core.snapshot().error.is_some());
}

#[test]
fn events_from_previous_session_are_ignored() {
    let (mut core, _host, transport) = connected_session();

    // The old link reports a close with a reason once it is shut down
    core.disconnect();
    core.connect(Voice::Aoede);
    assert_eq!(transport.open_count(), 2);
    core.process_pending();

    let snapshot = core.snapshot();
    assert_eq!(snapshot.status, Status::Connecting);
    assert_eq!(snapshot.voice, Some(Voice::Aoede));
    assert_eq!(snapshot.error, None);

    transport.emit(TransportEvent::Opened);
    core.process_pending();
    assert_eq!(core.snapshot().status, Status::Connected);
}

// ============================================================================
// Capture forwarding
// ============================================================================

#[test]
fn frames_are_forwarded_only_after_open_and_in_order() {
    let (mut core, host, transport) = session();
    core.connect(Voice::Kore);

    host.speak(&vec![0.1; FRAME_SAMPLES]);
    assert!(transport.last().1.frames().is_empty());

    transport.emit(TransportEvent::Opened);
    core.process_pending();

    host.speak(&vec![0.1; FRAME_SAMPLES * 2 + 100]);
    let frames = transport.last().1.frames();

    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f.payload.len() == FRAME_SAMPLES * 2));
    assert!(frames[0].sequence < frames[1].sequence);
}

#[test]
fn no_frames_after_disconnect() {
    let (mut core, host, transport) = connected_session();
    let link = transport.last().1;

    host.speak(&vec![0.0; FRAME_SAMPLES]);
    core.disconnect();

    assert_eq!(link.frames().len(), 1);
    assert!(host.devices.lock().unwrap().on_samples.is_none());
}

// ============================================================================
// Playback
// ============================================================================

#[test]
fn first_chunk_starts_at_device_time() {
    let (mut core, host, transport) = connected_session();
    host.set_now(2.0);

    transport.emit(TransportEvent::AudioChunk(chunk(0.5)));
    core.process_pending();

    let playing = host.playing();
    assert_eq!(playing.len(), 1);
    assert_eq!(playing[0].1, 2.0);
    assert_eq!(playing[0].2, 0.5);
    assert_eq!(core.playback_cursor(), Some(2.5));
    assert_eq!(core.active_sources(), 1);
}

#[test]
fn chunks_play_back_to_back() {
    let (mut core, host, transport) = connected_session();
    host.set_now(1.0);

    transport.emit(TransportEvent::AudioChunk(chunk(0.25)));
    transport.emit(TransportEvent::AudioChunk(chunk(0.5)));
    core.process_pending();

    // Still inside the queued audio; the next chunk follows it
    host.set_now(1.1);
    transport.emit(TransportEvent::AudioChunk(chunk(0.25)));
    core.process_pending();

    let starts: Vec<f64> = host.playing().iter().map(|(_, start, _)| *start).collect();
    assert_eq!(starts, vec![1.0, 1.25, 1.75]);
    assert_eq!(core.playback_cursor(), Some(2.0));
}

#[test]
fn interrupt_stops_playback_and_resets_cursor() {
    let (mut core, host, transport) = connected_session();
    host.set_now(3.0);
    transport.emit(TransportEvent::AudioChunk(chunk(0.5)));
    transport.emit(TransportEvent::AudioChunk(chunk(0.5)));
    core.process_pending();
    assert_eq!(core.active_sources(), 2);

    transport.emit(TransportEvent::Interrupted);
    core.process_pending();

    assert_eq!(core.active_sources(), 0);
    assert_eq!(core.playback_cursor(), Some(0.0));
    assert!(host.playing().is_empty());
    assert_eq!(host.devices.lock().unwrap().stopped.len(), 2);
    assert_eq!(core.snapshot().status, Status::Connected);

    // Playback resumes relative to the device clock
    host.set_now(3.2);
    transport.emit(TransportEvent::AudioChunk(chunk(0.25)));
    core.process_pending();
    assert_eq!(host.playing()[0].1, 3.2);
}

#[test]
fn malformed_chunk_is_dropped() {
    let (mut core, host, transport) = connected_session();

    transport.emit(TransportEvent::AudioChunk(vec![1, 2, 3]));
    core.process_pending();

    assert_eq!(core.snapshot().status, Status::Connected);
    assert!(host.playing().is_empty());

    transport.emit(TransportEvent::AudioChunk(chunk(0.25)));
    core.process_pending();
    assert_eq!(host.playing().len(), 1);
}

#[test]
fn chunks_before_open_are_ignored() {
    let (mut core, host, transport) = session();
    core.connect(Voice::Kore);

    transport.emit(TransportEvent::AudioChunk(chunk(0.25)));
    core.process_pending();

    assert_eq!(core.snapshot().status, Status::Connecting);
    assert!(host.playing().is_empty());
}

// ============================================================================
// Volume
// ============================================================================

#[test]
fn tick_reports_input_volume_while_connected() {
    let (mut core, host, _transport) = connected_session();

    host.speak(&sine(2048));
    core.tick();

    let snapshot = core.snapshot();
    assert!(snapshot.input_volume > 0.0);
    assert!(snapshot.input_volume <= 1.0);
    assert_eq!(snapshot.output_volume, 0.0);

    core.disconnect();
    assert_eq!(core.snapshot().input_volume, 0.0);
}

#[test]
fn meter_ticks_only_while_live() {
    let (mut core, _host, transport) = session();
    assert!(!core.wants_meter_ticks());

    core.connect(Voice::Kore);
    assert!(core.wants_meter_ticks());

    transport.emit(TransportEvent::Opened);
    core.process_pending();
    assert!(core.wants_meter_ticks());

    core.disconnect();
    assert!(!core.wants_meter_ticks());
}

#[test]
fn tick_without_session_keeps_volumes_at_zero() {
    let (mut core, _host, _transport) = session();
    core.tick();
    assert_eq!(core.snapshot().input_volume, 0.0);
    assert_eq!(core.snapshot().output_volume, 0.0);
}

// ============================================================================
// Controller
// ============================================================================

#[test]
fn controller_runs_a_session() {
    let host = FakeHost::default();
    let transport = Arc::new(FakeTransport::auto_opening());
    let mut controller = SessionController::start(
        Arc::new(host.clone()),
        transport.clone(),
        LiveSettings::default(),
    )
    .unwrap();

    assert_eq!(controller.snapshot().status, Status::Disconnected);

    controller.connect(Voice::Fenrir);
    assert!(wait_for(&controller, |s| s.status == Status::Connected));
    assert_eq!(controller.snapshot().voice, Some(Voice::Fenrir));

    transport.emit(TransportEvent::Error("network lost".to_string()));
    assert!(wait_for(&controller, |s| s.status == Status::Disconnected));
    assert!(controller.snapshot().error.unwrap().contains("network lost"));

    controller.connect(Voice::Kore);
    assert!(wait_for(&controller, |s| s.status == Status::Connected));
    assert_eq!(controller.snapshot().error, None);

    controller.disconnect();
    assert!(wait_for(&controller, |s| s.status == Status::Disconnected));

    controller.shutdown();
    assert_eq!(host.devices.lock().unwrap().microphone_closes, 2);
}

#[test]
fn dropping_controller_releases_devices() {
    let host = FakeHost::default();
    let transport = Arc::new(FakeTransport::auto_opening());
    let controller = SessionController::start(
        Arc::new(host.clone()),
        transport.clone(),
        LiveSettings::default(),
    )
    .unwrap();

    controller.connect(Voice::Kore);
    assert!(wait_for(&controller, |s| s.status == Status::Connected));

    drop(controller);

    let devices = host.devices.lock().unwrap();
    assert!(!devices.microphone_open);
    assert!(!devices.speaker_open);
}

//! Bidirectional stream to the remote conversational service
//!
//! A [`Transport`] opens one stream per session. Outbound audio goes through
//! the returned [`TransportLink`]; everything the service says comes back as
//! [`TransportEvent`]s on the session's [`TransportEvents`] sink.
//!
//! # Architecture
//!
//! ```text
//! capture callback ──▶ TransportLink::send ──▶ FIFO ──▶ writer ──▶ WebSocket
//!                                                                     │
//! session loop ◀── TransportMessage ◀── TransportEvents ◀── reader ◀──┘
//! ```
//!
//! # Event contract
//!
//! - Exactly one `Opened` precedes any `AudioChunk`/`Interrupted`
//! - `Closed`/`Error` are terminal; the sink drops anything after them
//! - No automatic reconnection; the session decides what happens next

pub mod live_client;
pub mod protocol;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio::AudioFrame;
use crate::session::Voice;

pub use live_client::LiveTransport;
pub use protocol::{ClientMessage, ServerMessage, DEFAULT_MODEL, LIVE_API_URL};

/// Errors that can occur on the streaming transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// API key not configured
    MissingApiKey,
    /// Failed to establish the WebSocket or complete setup
    ConnectionFailed(String),
    /// Unexpected or invalid message
    ProtocolError(String),
    /// Connection was closed unexpectedly
    Disconnected(String),
    /// Failed to send audio data
    SendFailed(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::MissingApiKey => {
                write!(
                    f,
                    "API key not configured. Set GEMINI_API_KEY environment variable."
                )
            }
            TransportError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to Live API: {}", e)
            }
            TransportError::ProtocolError(e) => {
                write!(f, "WebSocket protocol error: {}", e)
            }
            TransportError::Disconnected(e) => {
                write!(f, "WebSocket disconnected: {}", e)
            }
            TransportError::SendFailed(e) => {
                write!(f, "Failed to send audio: {}", e)
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// Per-session stream configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub endpoint: String,
    pub model: String,
    pub voice: Voice,
    /// System instruction sent with the setup message
    pub instructions: String,
    /// Bound on the WebSocket handshake
    pub connect_timeout: Duration,
    /// Bound on waiting for `setupComplete`
    pub setup_timeout: Duration,
}

impl SessionConfig {
    pub fn new(voice: Voice) -> Self {
        Self {
            endpoint: LIVE_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice,
            instructions: String::new(),
            connect_timeout: Duration::from_secs(10),
            setup_timeout: Duration::from_secs(5),
        }
    }
}

/// Something the remote service (or the stream itself) reported
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Setup confirmed; audio may flow in both directions
    Opened,
    /// PCM16 mono speech at 24kHz
    AudioChunk(Vec<u8>),
    /// The service's turn was cut off by the user
    Interrupted,
    /// The service finished its turn
    TurnComplete,
    /// Stream closed, with the peer's close reason if any
    Closed(Option<String>),
    /// Stream failed
    Error(String),
}

impl TransportEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::Closed(_) | TransportEvent::Error(_))
    }
}

/// A transport event tagged with the session it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub session_id: Uuid,
    pub event: TransportEvent,
}

/// Event sink handed to a transport when a stream is opened
///
/// Enforces the terminal-event contract: once `Closed` or `Error` was
/// emitted, further events are dropped.
#[derive(Clone)]
pub struct TransportEvents {
    session_id: Uuid,
    tx: mpsc::UnboundedSender<TransportMessage>,
    finished: Arc<AtomicBool>,
}

impl TransportEvents {
    pub fn new(session_id: Uuid, tx: mpsc::UnboundedSender<TransportMessage>) -> Self {
        Self {
            session_id,
            tx,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Deliver an event to the session
    ///
    /// Returns false if the event was dropped (stream already finished or
    /// the session is gone).
    pub fn emit(&self, event: TransportEvent) -> bool {
        if event.is_terminal() {
            if self.finished.swap(true, Ordering::SeqCst) {
                return false;
            }
        } else if self.finished.load(Ordering::SeqCst) {
            log::debug!("Dropping {:?} after terminal event", event);
            return false;
        }

        self.tx
            .send(TransportMessage {
                session_id: self.session_id,
                event,
            })
            .is_ok()
    }

    /// True once a terminal event was emitted
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Opens streams to the remote service
pub trait Transport: Send + Sync + 'static {
    /// Start opening a stream
    ///
    /// Never fails synchronously: connection problems surface as an `Error`
    /// event on `events`.
    fn open(&self, config: SessionConfig, events: TransportEvents) -> Arc<dyn TransportLink>;
}

/// Outbound half of an open stream
pub trait TransportLink: Send + Sync {
    /// Queue a frame for transmission; fire-and-forget
    ///
    /// Frames are transmitted in the order they were queued. Failures
    /// surface as an `Error` event.
    fn send(&self, frame: AudioFrame);

    /// Close the stream. Safe to call more than once.
    fn close(&self);
}

/// Get the API key from environment
///
/// Reads `GEMINI_API_KEY`, falling back to `API_KEY`. Empty values count as
/// missing.
pub fn get_api_key() -> Option<String> {
    ["GEMINI_API_KEY", "API_KEY"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|k| !k.trim().is_empty())
}

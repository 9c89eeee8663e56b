//! Live voice session
//!
//! Coordinates capture, playback and the transport for at most one live
//! session at a time.
//!
//! # Architecture
//!
//! ```text
//!  connect / disconnect ──▶ SessionController ──▶ dedicated thread
//!                                                    │
//!                             ┌──────────────────────┘
//!                             ▼
//!       commands, transport events, device errors, meter tick
//!                             │
//!                             ▼
//!                  SessionCore::handle ── reduce() ──▶ effects
//!                             │
//!                             ▼
//!             watch::Sender<SessionSnapshot> ──▶ observers (UI)
//! ```

pub mod controller;
pub mod core;
pub mod state;
pub mod voice;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::audio::AudioError;
use crate::transport::TransportError;

pub use self::controller::SessionController;
pub use self::core::SessionCore;
pub use self::state::{reduce, Effect, Event, SessionState, Status};
pub use self::voice::Voice;

/// Errors surfaced by a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Microphone or speaker could not be acquired or failed
    DeviceUnavailable(String),
    /// Inbound audio could not be decoded
    MalformedAudioData(String),
    /// Network or service failure
    TransportError(String),
    /// Operation requires a connected session
    NotConnected,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::DeviceUnavailable(e) => write!(f, "Audio device unavailable: {}", e),
            SessionError::MalformedAudioData(e) => write!(f, "Malformed audio data: {}", e),
            SessionError::TransportError(e) => write!(f, "Connection error: {}", e),
            SessionError::NotConnected => write!(f, "Session is not connected"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<AudioError> for SessionError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::DeviceUnavailable(e) => SessionError::DeviceUnavailable(e),
            AudioError::MalformedAudioData(e) => SessionError::MalformedAudioData(e),
            other => SessionError::DeviceUnavailable(other.to_string()),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        SessionError::TransportError(err.to_string())
    }
}

/// Observable session state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: Status,
    /// Why the last session ended, if it ended abnormally
    pub error: Option<String>,
    /// Microphone level, 0.0-1.0
    pub input_volume: f32,
    /// Speaker level, 0.0-1.0
    pub output_volume: f32,
    pub voice: Option<Voice>,
    pub connected_at: Option<DateTime<Utc>>,
    pub session_id: Option<Uuid>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            status: Status::Disconnected,
            error: None,
            input_volume: 0.0,
            output_volume: 0.0,
            voice: None,
            connected_at: None,
            session_id: None,
        }
    }
}

impl SessionSnapshot {
    pub fn from_state(state: &SessionState, input_volume: f32, output_volume: f32) -> Self {
        match state {
            SessionState::Disconnected { error } => Self {
                error: error.clone(),
                ..Default::default()
            },
            SessionState::Connecting { session_id, voice } => Self {
                status: Status::Connecting,
                input_volume,
                output_volume,
                voice: Some(*voice),
                session_id: Some(*session_id),
                ..Default::default()
            },
            SessionState::Connected {
                session_id,
                voice,
                connected_at,
            } => Self {
                status: Status::Connected,
                input_volume,
                output_volume,
                voice: Some(*voice),
                connected_at: Some(*connected_at),
                session_id: Some(*session_id),
                ..Default::default()
            },
        }
    }
}

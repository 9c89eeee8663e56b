//! Session state machine
//!
//! All state transitions go through [`reduce`], which returns the next state
//! and the effects the session core must execute. The reducer never touches
//! devices or the network.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Voice;

/// Lifecycle of the (at most one) live session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Disconnected {
        /// Why the previous session ended, if it ended abnormally
        error: Option<String>,
    },
    Connecting {
        session_id: Uuid,
        voice: Voice,
    },
    Connected {
        session_id: Uuid,
        voice: Voice,
        connected_at: DateTime<Utc>,
    },
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Disconnected { error: None }
    }
}

impl SessionState {
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            SessionState::Disconnected { .. } => None,
            SessionState::Connecting { session_id, .. } => Some(*session_id),
            SessionState::Connected { session_id, .. } => Some(*session_id),
        }
    }

    pub fn is_live(&self) -> bool {
        self.session_id().is_some()
    }

    pub fn status(&self) -> Status {
        match self {
            SessionState::Disconnected { .. } => Status::Disconnected,
            SessionState::Connecting { .. } => Status::Connecting,
            SessionState::Connected { .. } => Status::Connected,
        }
    }
}

/// Connection status as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Disconnected => write!(f, "disconnected"),
            Status::Connecting => write!(f, "connecting"),
            Status::Connected => write!(f, "connected"),
        }
    }
}

/// Events that can trigger state transitions.
/// Sent by the controller (user commands), the transport and the devices.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// User asked to start a session
    Connect { voice: Voice },
    /// User asked to end the session
    Disconnect,
    /// Devices could not be acquired while connecting
    StartFailed { id: Uuid, err: String },

    // Transport events
    TransportOpened { id: Uuid },
    AudioChunk { id: Uuid, payload: Vec<u8> },
    Interrupted { id: Uuid },
    TurnComplete { id: Uuid },
    TransportClosed { id: Uuid, reason: Option<String> },
    TransportFailed { id: Uuid, err: String },

    /// Microphone or speaker failed after it was opened
    DeviceFailed { id: Uuid, err: String },

    /// Volume refresh tick
    MeterTick,
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Acquire devices and open the transport
    StartSession { id: Uuid, voice: Voice },
    /// Let captured frames through to the transport
    BeginForwarding { id: Uuid },
    /// Decode and schedule an inbound chunk
    PlayChunk { id: Uuid, payload: Vec<u8> },
    /// Barge-in: drop all queued and playing output
    InterruptPlayback { id: Uuid },
    /// Recompute input/output volumes
    SampleLevels,
    /// Release every resource of the session and zero the volumes
    Teardown { id: Uuid },
    /// Publish a fresh snapshot to observers
    EmitStatus,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events carrying a session id other than the live one
/// - At most one live session; `Connect` while live is a no-op
/// - Close and error from any live state end the session
pub fn reduce(state: &SessionState, event: Event) -> (SessionState, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use SessionState::*;

    let current_id = state.session_id();
    let is_current = |eid: Uuid| current_id == Some(eid);

    // Helper: end the live session, recording `error`
    let end = |error: Option<String>| -> (SessionState, Vec<Effect>) {
        let mut effects = Vec::new();
        if let Some(id) = current_id {
            effects.push(Teardown { id });
        }
        effects.push(EmitStatus);
        (Disconnected { error }, effects)
    };

    match (state, event) {
        // -----------------
        // Disconnected
        // -----------------
        (Disconnected { .. }, Connect { voice }) => {
            let id = Uuid::new_v4();
            (
                Connecting {
                    session_id: id,
                    voice,
                },
                vec![StartSession { id, voice }, EmitStatus],
            )
        }
        // Keep the recorded error; nothing to release
        (Disconnected { .. }, Disconnect) => (state.clone(), vec![]),

        // -----------------
        // Connecting
        // -----------------
        (Connecting { session_id, voice }, TransportOpened { id }) if *session_id == id => (
            Connected {
                session_id: *session_id,
                voice: *voice,
                connected_at: Utc::now(),
            },
            vec![BeginForwarding { id }, EmitStatus],
        ),
        (Connecting { session_id, .. }, StartFailed { id, err }) if *session_id == id => {
            end(Some(err))
        }

        // -----------------
        // Connected
        // -----------------
        (Connected { session_id, .. }, AudioChunk { id, payload }) if *session_id == id => {
            (state.clone(), vec![PlayChunk { id, payload }])
        }
        (Connected { session_id, .. }, Interrupted { id }) if *session_id == id => {
            (state.clone(), vec![InterruptPlayback { id }])
        }

        // -----------------
        // Any live state
        // -----------------
        (Connecting { .. } | Connected { .. }, Connect { voice }) => {
            log::info!("Connect({}) ignored: session already live", voice);
            (state.clone(), vec![])
        }
        (Connecting { .. } | Connected { .. }, Disconnect) => end(None),
        (_, TransportClosed { id, reason }) if is_current(id) => {
            end(reason.map(|r| format!("Connection closed: {}", r)))
        }
        (_, TransportFailed { id, err }) if is_current(id) => end(Some(err)),
        (_, DeviceFailed { id, err }) if is_current(id) => end(Some(err)),
        (Connecting { .. } | Connected { .. }, MeterTick) => (state.clone(), vec![SampleLevels]),

        // -----------------
        // Informational / out of order (no transition)
        // -----------------
        (Connected { session_id, .. }, TurnComplete { id }) if *session_id == id => {
            log::debug!("Remote turn complete");
            (state.clone(), vec![])
        }
        (Connecting { .. }, AudioChunk { .. } | Interrupted { .. }) => {
            log::warn!("Transport event before open ignored");
            (state.clone(), vec![])
        }

        // Stale events and everything else: drop silently
        _ => (state.clone(), vec![]),
    }
}

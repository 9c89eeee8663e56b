//! Live API protocol types
//!
//! JSON messages exchanged with the bidirectional streaming endpoint.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://…/BidiGenerateContent?key=<API key>`
//! 2. Send `setup` with model, voice and system instruction
//! 3. Receive `setupComplete`
//! 4. Stream microphone audio via `realtimeInput.mediaChunks`
//! 5. Receive speech via `serverContent.modelTurn.parts[].inlineData`,
//!    barge-in via `serverContent.interrupted`, end of turn via
//!    `serverContent.turnComplete`

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use super::TransportEvent;

/// Live API WebSocket endpoint (API key is appended as `?key=`)
pub const LIVE_API_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default model for audio conversations
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-exp";

/// MIME type of outbound microphone frames
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Prefix of MIME types carrying synthesized speech
const AUDIO_MIME_PREFIX: &str = "audio/pcm";

/// Setup payload sent as the first message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfig {
    /// Fully qualified model name (`models/<name>`)
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Always `["AUDIO"]`; the session speaks its replies
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// A turn's content: an ordered list of parts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// One part of a turn; either text or inline binary data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// Base64-encoded binary payload with its MIME type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

// ============================================================================
// Client Messages (sent TO the service)
// ============================================================================

/// Messages sent from client to the Live API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// Session configuration, must be the first message
    Setup(SetupConfig),
    /// Streamed microphone audio
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Create the setup message for an audio conversation
    pub fn setup(model: &str, voice_name: &str, instructions: &str) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };

        let system_instruction = if instructions.is_empty() {
            None
        } else {
            Some(Content {
                parts: vec![Part {
                    text: Some(instructions.to_string()),
                    inline_data: None,
                }],
            })
        };

        Self::Setup(SetupConfig {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice_name.to_string(),
                        },
                    },
                },
            },
            system_instruction,
        })
    }

    /// Create a realtime input message from an encoded PCM16 frame
    pub fn audio(payload: &[u8]) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: INPUT_MIME_TYPE.to_string(),
                data: STANDARD.encode(payload),
            }],
        })
    }
}

// ============================================================================
// Server Messages (received FROM the service)
// ============================================================================

/// Messages received from the Live API
///
/// The service sends one top-level key per message; everything we do not
/// handle is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    /// The model's turn was cut off by user speech
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

/// Server announces it will close the connection soon
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Translate into transport events, in delivery order
    ///
    /// Audio parts come first, then the interruption marker, then the end of
    /// turn. Parts whose base64 payload fails to decode are dropped.
    pub fn into_events(self) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        if let Some(go_away) = &self.go_away {
            log::warn!(
                "Server is going away (time left: {})",
                go_away.time_left.as_deref().unwrap_or("unknown")
            );
        }

        let Some(content) = self.server_content else {
            return events;
        };

        let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
        for blob in parts.into_iter().filter_map(|p| p.inline_data) {
            if !blob.mime_type.starts_with(AUDIO_MIME_PREFIX) {
                log::debug!("Ignoring inline data of type {}", blob.mime_type);
                continue;
            }
            match STANDARD.decode(blob.data.as_bytes()) {
                Ok(bytes) => events.push(TransportEvent::AudioChunk(bytes)),
                Err(e) => log::warn!("Dropping audio part with invalid base64: {}", e),
            }
        }

        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }

        events
    }
}

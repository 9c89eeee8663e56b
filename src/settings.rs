use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::Voice;
use crate::transport::{SessionConfig, DEFAULT_MODEL, LIVE_API_URL};

const SETTINGS_DIR_NAME: &str = "vokey-live";
const SETTINGS_FILE_NAME: &str = "settings.json";

const DEFAULT_INSTRUCTIONS: &str = "You are a friendly, concise voice assistant. \
Answer in short spoken sentences and stop talking as soon as the user interrupts.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    /// Model used for the live session (with or without the `models/` prefix).
    pub model: String,

    /// WebSocket endpoint of the streaming service; the API key is appended.
    pub endpoint: String,

    /// System instruction sent when the session is set up.
    pub instructions: String,

    /// Voice used when the caller does not pick one.
    pub default_voice: Voice,

    /// Volume meter refresh interval. 33ms is roughly 30 frames per second.
    pub meter_interval_ms: u64,

    /// Upper bound on the WebSocket handshake.
    pub connect_timeout_ms: u64,

    /// Upper bound on waiting for the service to confirm the session setup.
    pub setup_timeout_ms: u64,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            endpoint: LIVE_API_URL.to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            default_voice: Voice::default(),
            meter_interval_ms: 33,
            connect_timeout_ms: 10_000,
            setup_timeout_ms: 5_000,
        }
    }
}

impl LiveSettings {
    /// Stream configuration for a session with `voice`
    pub fn session_config(&self, voice: Voice) -> SessionConfig {
        SessionConfig {
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            voice,
            instructions: self.instructions.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            setup_timeout: Duration::from_millis(self.setup_timeout_ms),
        }
    }

    /// Meter tick period, never shorter than 1ms
    pub fn meter_interval(&self) -> Duration {
        Duration::from_millis(self.meter_interval_ms.max(1))
    }
}

/// `<config dir>/vokey-live/settings.json`
pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> LiveSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<LiveSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                LiveSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => LiveSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            LiveSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &LiveSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

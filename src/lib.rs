//! Real-time voice sessions with a streaming conversational AI endpoint
//!
//! Microphone audio is captured at 16 kHz, framed into PCM16 chunks and
//! streamed over a WebSocket; synthesized speech comes back as 24 kHz PCM16
//! and is played gaplessly. The remote side can interrupt playback at any
//! time (barge-in).
//!
//! Start with [`SessionController`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use vokey_live::{CpalHost, LiveSettings, LiveTransport, SessionController, Voice};
//!
//! let controller = SessionController::start(
//!     Arc::new(CpalHost::new()),
//!     Arc::new(LiveTransport::from_env()),
//!     LiveSettings::default(),
//! )?;
//! controller.connect(Voice::Kore);
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod audio;
pub mod session;
pub mod settings;
pub mod transport;

pub use audio::{AudioError, CpalHost};
pub use session::{SessionController, SessionCore, SessionError, SessionSnapshot, Status, Voice};
pub use settings::LiveSettings;
pub use transport::live_client::LiveTransport;
pub use transport::TransportError;

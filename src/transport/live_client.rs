//! Live API WebSocket client
//!
//! Production [`Transport`]. Each opened stream runs as one task that owns the
//! WebSocket: it connects, performs setup, then multiplexes outbound audio
//! frames and inbound server messages until either side closes.
//!
//! # Connection Flow
//!
//! 1. WebSocket handshake (bounded by `connect_timeout`)
//! 2. Send `setup`, wait for `setupComplete` (bounded by `setup_timeout`)
//! 3. Emit `Opened`, then stream audio both ways
//! 4. Emit exactly one `Closed` or `Error` when the stream ends
//!
//! # Retry Strategy
//!
//! None. A failed connection ends the session; the user reconnects.

use std::sync::{Arc, Once};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rustls::crypto::{ring, CryptoProvider};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientMessage, ServerMessage};
use super::{
    get_api_key, SessionConfig, Transport, TransportError, TransportEvent, TransportEvents,
    TransportLink,
};
use crate::audio::AudioFrame;

/// Bound on sending the close frame during shutdown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Log a progress line every N outbound frames (~10s of audio)
const FRAME_LOG_INTERVAL: u64 = 40;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// WebSocket transport to the Live API
pub struct LiveTransport {
    api_key: Option<String>,
}

impl LiveTransport {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
        }
    }

    /// Use the API key from the environment (see [`get_api_key`])
    pub fn from_env() -> Self {
        Self {
            api_key: get_api_key(),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

impl Transport for LiveTransport {
    fn open(&self, config: SessionConfig, events: TransportEvents) -> Arc<dyn TransportLink> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let link = Arc::new(LiveLink {
            outbound: outbound_tx,
            cancel: cancel.clone(),
        });

        let Some(api_key) = self.api_key.clone() else {
            log::error!("Cannot open live session: no API key");
            events.emit(TransportEvent::Error(
                TransportError::MissingApiKey.to_string(),
            ));
            return link;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(run_stream(api_key, config, events, outbound_rx, cancel));
            }
            Err(e) => {
                events.emit(TransportEvent::Error(
                    TransportError::ConnectionFailed(format!("no async runtime: {}", e))
                        .to_string(),
                ));
            }
        }

        link
    }
}

/// Outbound handle of one stream
struct LiveLink {
    outbound: mpsc::UnboundedSender<AudioFrame>,
    cancel: CancellationToken,
}

impl TransportLink for LiveLink {
    fn send(&self, frame: AudioFrame) {
        if self.outbound.send(frame).is_err() {
            log::trace!("Stream task gone, frame dropped");
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LiveLink {
    fn drop(&mut self) {
        // Ensure the stream task winds down if close() was never called
        self.cancel.cancel();
    }
}

/// How the streaming loop ended
#[derive(Debug)]
enum StreamEnd {
    /// Closed from our side
    Local,
    /// Peer sent a close frame
    Remote(Option<String>),
    Failed(TransportError),
}

/// Whole lifetime of one stream
async fn run_stream(
    api_key: String,
    config: SessionConfig,
    events: TransportEvents,
    mut outbound: mpsc::UnboundedReceiver<AudioFrame>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            log::info!("Live stream cancelled before setup completed");
            events.emit(TransportEvent::Closed(None));
            return;
        }
        result = establish(&api_key, &config) => result,
    };

    let (mut write, mut read) = match connected {
        Ok(halves) => halves,
        Err(e) => {
            log::warn!("Live stream failed to open: {}", e);
            events.emit(TransportEvent::Error(e.to_string()));
            return;
        }
    };

    if !events.emit(TransportEvent::Opened) {
        close_socket(&mut write).await;
        return;
    }

    let mut frames_sent: u64 = 0;
    let outcome = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break StreamEnd::Local,

            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = send_message(&mut write, &ClientMessage::audio(&frame.payload)).await {
                        break StreamEnd::Failed(e);
                    }
                    frames_sent += 1;
                    if frames_sent % FRAME_LOG_INTERVAL == 0 {
                        log::debug!("Sent {} frames (last sequence {})", frames_sent, frame.sequence);
                    }
                }
                None => break StreamEnd::Local,
            },

            incoming = read.next() => match incoming {
                Some(Ok(message)) => match decode_frame(message) {
                    Incoming::Message(msg) => {
                        for event in msg.into_events() {
                            events.emit(event);
                        }
                    }
                    Incoming::Closed(reason) => break StreamEnd::Remote(reason),
                    Incoming::Skip => {}
                },
                Some(Err(e)) => break StreamEnd::Failed(TransportError::ProtocolError(e.to_string())),
                None => break StreamEnd::Failed(TransportError::Disconnected("Stream ended".to_string())),
            },
        }
    };

    log::info!(
        "Live stream ended after {} frame(s): {:?}",
        frames_sent,
        outcome
    );

    match outcome {
        StreamEnd::Local => {
            close_socket(&mut write).await;
            events.emit(TransportEvent::Closed(None));
        }
        StreamEnd::Remote(reason) => {
            events.emit(TransportEvent::Closed(reason));
        }
        StreamEnd::Failed(e) => {
            events.emit(TransportEvent::Error(e.to_string()));
        }
    }
}

/// Connect and complete setup; single attempt
async fn establish(
    api_key: &str,
    config: &SessionConfig,
) -> Result<(WsWrite, WsRead), TransportError> {
    install_crypto_provider();

    let request = build_url(&config.endpoint, api_key)
        .into_client_request()
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    log::info!(
        "Connecting to Live API (model {}, voice {})...",
        config.model,
        config.voice
    );

    let (ws_stream, _response) = timeout(
        config.connect_timeout,
        // Small frames at a steady cadence; send them without Nagle delay
        connect_async_with_config(request, None, true),
    )
    .await
    .map_err(|_| TransportError::ConnectionFailed("Connection timeout".to_string()))?
    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    log::info!("WebSocket connected, sending setup...");

    let (mut write, mut read) = ws_stream.split();

    let setup = ClientMessage::setup(&config.model, config.voice.as_str(), &config.instructions);
    send_message(&mut write, &setup).await?;

    timeout(config.setup_timeout, wait_for_setup(&mut read))
        .await
        .map_err(|_| TransportError::ConnectionFailed("Session setup timeout".to_string()))??;

    log::info!("Live session setup complete");
    Ok((write, read))
}

/// Wait for `setupComplete`, skipping anything else
async fn wait_for_setup(read: &mut WsRead) -> Result<(), TransportError> {
    while let Some(result) = read.next().await {
        let message = result.map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        match decode_frame(message) {
            Incoming::Message(msg) if msg.is_setup_complete() => return Ok(()),
            Incoming::Message(_) => {
                log::debug!("Ignoring message while waiting for setupComplete");
            }
            Incoming::Closed(reason) => {
                return Err(TransportError::Disconnected(reason.unwrap_or_else(|| {
                    "Connection closed before setup completed".to_string()
                })));
            }
            Incoming::Skip => {}
        }
    }
    Err(TransportError::Disconnected("Stream ended".to_string()))
}

/// Send a client message over the WebSocket
async fn send_message(write: &mut WsWrite, msg: &ClientMessage) -> Result<(), TransportError> {
    let json =
        serde_json::to_string(msg).map_err(|e| TransportError::ProtocolError(e.to_string()))?;

    write
        .send(Message::Text(json))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

async fn close_socket(write: &mut WsWrite) {
    match timeout(CLOSE_TIMEOUT, write.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Error closing WebSocket: {}", e),
        Err(_) => log::warn!("Timed out closing WebSocket"),
    }
}

/// A decoded WebSocket frame
#[derive(Debug)]
enum Incoming {
    Message(ServerMessage),
    Closed(Option<String>),
    /// Ping/pong, or a payload we could not parse
    Skip,
}

/// Server messages arrive as text or binary frames
fn decode_frame(message: Message) -> Incoming {
    match message {
        Message::Text(text) => parse_message(text.as_bytes()),
        Message::Binary(data) => parse_message(&data),
        Message::Close(frame) => Incoming::Closed(
            frame
                .map(|f| f.reason.to_string())
                .filter(|reason| !reason.is_empty()),
        ),
        _ => Incoming::Skip,
    }
}

fn parse_message(bytes: &[u8]) -> Incoming {
    match serde_json::from_slice::<ServerMessage>(bytes) {
        Ok(msg) => Incoming::Message(msg),
        Err(e) => {
            log::warn!("Failed to parse message: {}", e);
            Incoming::Skip
        }
    }
}

fn build_url(endpoint: &str, api_key: &str) -> String {
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    format!("{}{}key={}", endpoint, separator, api_key)
}

/// rustls 0.23 needs a process-wide crypto provider
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if CryptoProvider::install_default(ring::default_provider()).is_err() {
            log::debug!("rustls crypto provider already installed");
        }
    });
}

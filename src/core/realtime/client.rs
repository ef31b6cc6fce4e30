//! Realtime protocol client.
//!
//! Owns one WebSocket connection to the speech-AI endpoint per call session:
//! bearer-authenticated handshake, immediate session configuration, outbound
//! audio/control messages, and decoding of inbound events into the typed
//! [`ProtocolEvent`] stream the session controller consumes.
//!
//! The client never reconnects on its own. A dropped connection is reported
//! as a terminal [`ProtocolEvent::ProtocolError`]; the controller decides
//! whether to fall back to human-handled audio or end the call. Retrying at
//! this layer would mask real failures during a live call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use super::config::RealtimeConfig;
use super::messages::{ClientEvent, ConversationItem, ServerEvent};
use crate::core::audio::AudioFrame;

/// Channel capacity for outbound WebSocket messages and inbound events.
const CHANNEL_CAPACITY: usize = 256;

/// Grace period for the connection task to finish after a close request.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

// =============================================================================
// Errors and Events
// =============================================================================

/// Errors establishing the realtime connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// WebSocket handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Connect attempt timed out
    #[error("Connect timed out after {0}s")]
    Timeout(u64),

    /// The handshake request could not be built
    #[error("Invalid connect request: {0}")]
    InvalidRequest(String),

    /// A connection for this session is already open
    #[error("Already connected")]
    AlreadyConnected,
}

/// One decoded inbound message, or a connection lifecycle notification.
///
/// Produced only by [`RealtimeClient`]; consumed exactly once by the session
/// controller's dispatch loop, in arrival order.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// The endpoint created the session
    SessionReady {
        /// Endpoint-assigned session ID
        session_id: String,
    },
    /// The endpoint acknowledged the session configuration
    SessionConfirmed,
    /// Accumulated in-progress agent transcript
    TranscriptDelta {
        /// Transcript so far for the open utterance
        text: String,
    },
    /// Final agent transcript for the utterance
    TranscriptFinal {
        /// Full transcript
        text: String,
    },
    /// Final transcription of the caller's speech
    CallerTranscriptFinal {
        /// Transcript text
        text: String,
    },
    /// Decoded agent audio for playback
    AudioChunk {
        /// Raw PCM16 bytes
        bytes: Bytes,
    },
    /// Terminal protocol failure (server-reported error or unexpected close)
    ProtocolError {
        /// Failure description
        message: String,
    },
    /// The connection is gone, whether closed by us or by the endpoint.
    /// Always the last event a connection emits, so cleanup is uniform.
    SessionClosed,
}

// =============================================================================
// Client
// =============================================================================

enum Outbound {
    Event(ClientEvent),
    Close,
}

/// Cloneable outbound-audio handle, used by the capture pump task.
#[derive(Clone)]
pub struct AudioSender {
    outbound: mpsc::Sender<Outbound>,
    connected: Arc<AtomicBool>,
}

impl AudioSender {
    /// Transmit one captured frame as an append message. Never fails: when
    /// the connection is gone or the send queue is full the frame is dropped
    /// with a log line.
    pub fn send_frame(&self, frame: &AudioFrame) {
        if !self.connected.load(Ordering::SeqCst) {
            tracing::warn!(seq = frame.seq, "Not connected, dropping capture frame");
            return;
        }
        let event = ClientEvent::audio_append(&frame.pcm);
        if self.outbound.try_send(Outbound::Event(event)).is_err() {
            tracing::warn!(seq = frame.seq, "Outbound queue full, dropping capture frame");
        }
    }
}

/// WebSocket client for the speech-AI realtime session.
///
/// At most one connection is active at a time. All inbound traffic is decoded
/// on a single spawned task and surfaced through the event receiver returned
/// by [`RealtimeClient::connect`].
pub struct RealtimeClient {
    config: RealtimeConfig,
    outbound: Option<mpsc::Sender<Outbound>>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeClient {
    /// Create a disconnected client.
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            outbound: None,
            connected: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Whether the connection task is live.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Cloneable handle for the capture pump, if connected.
    pub fn audio_sender(&self) -> Option<AudioSender> {
        self.outbound.as_ref().map(|tx| AudioSender {
            outbound: tx.clone(),
            connected: self.connected.clone(),
        })
    }

    /// Open the connection and start the session.
    ///
    /// On success the session configuration (with the given instructions) has
    /// been queued and the returned channel will deliver protocol events,
    /// starting with [`ProtocolEvent::SessionReady`] once the endpoint
    /// creates the session. Handshake failures are returned directly; they
    /// leave the client disconnected.
    pub async fn connect(
        &mut self,
        instructions: &str,
    ) -> Result<mpsc::Receiver<ProtocolEvent>, ConnectionError> {
        if self.is_connected() {
            return Err(ConnectionError::AlreadyConnected);
        }

        let ws_url = self.config.ws_url();
        let host = url::Url::parse(&ws_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .ok_or_else(|| ConnectionError::InvalidRequest(format!("bad URL: {ws_url}")))?;

        let request = http::Request::builder()
            .uri(&ws_url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("OpenAI-Beta", "realtime=v1")
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header("Sec-WebSocket-Version", "13")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Host", host)
            .body(())
            .map_err(|e| ConnectionError::InvalidRequest(e.to_string()))?;

        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let (ws_stream, _response) =
            match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)).await {
                Ok(Ok(ok)) => ok,
                Ok(Err(e)) => return Err(ConnectionError::Handshake(e.to_string())),
                Err(_) => return Err(ConnectionError::Timeout(self.config.connect_timeout_secs)),
            };

        tracing::info!(url = %ws_url, "Realtime connection established");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<ProtocolEvent>(CHANNEL_CAPACITY);

        // Declare the session before anything else goes out.
        let session = self.config.build_session_config(instructions);
        let _ = out_tx
            .try_send(Outbound::Event(ClientEvent::SessionUpdate { session }));

        self.connected.store(true, Ordering::SeqCst);
        self.closing.store(false, Ordering::SeqCst);

        let connected = self.connected.clone();
        let closing = self.closing.clone();

        let handle = tokio::spawn(async move {
            // Running accumulator for the open agent utterance.
            let mut transcript_acc = String::new();
            let mut failure: Option<String> = None;

            loop {
                tokio::select! {
                    out = out_rx.recv() => {
                        match out {
                            Some(Outbound::Event(event)) => {
                                let json = match serde_json::to_string(&event) {
                                    Ok(j) => j,
                                    Err(e) => {
                                        tracing::error!("Failed to serialize event: {}", e);
                                        continue;
                                    }
                                };
                                if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                                    tracing::error!("Failed to send WebSocket message: {}", e);
                                    if !closing.load(Ordering::SeqCst) {
                                        failure = Some(format!("send failed: {e}"));
                                    }
                                    break;
                                }
                            }
                            Some(Outbound::Close) | None => {
                                let frame = CloseFrame {
                                    code: CloseCode::Normal,
                                    reason: "session ended".into(),
                                };
                                if let Err(e) = ws_sink.send(Message::Close(Some(frame))).await {
                                    tracing::debug!("Close frame not delivered: {}", e);
                                }
                                break;
                            }
                        }
                    }

                    msg = ws_stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(event) =
                                    decode_server_event(&text, &mut transcript_acc)
                                {
                                    let terminal =
                                        matches!(event, ProtocolEvent::ProtocolError { .. });
                                    if event_tx.send(event).await.is_err() {
                                        break;
                                    }
                                    if terminal {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                    tracing::error!("Failed to send pong: {}", e);
                                }
                            }
                            Some(Ok(Message::Close(_))) => {
                                tracing::info!("Realtime connection closed by endpoint");
                                if !closing.load(Ordering::SeqCst) {
                                    failure = Some("connection closed by endpoint".to_string());
                                }
                                break;
                            }
                            Some(Err(e)) => {
                                tracing::error!("WebSocket error: {}", e);
                                if !closing.load(Ordering::SeqCst) {
                                    failure = Some(format!("transport error: {e}"));
                                }
                                break;
                            }
                            None => {
                                if !closing.load(Ordering::SeqCst) {
                                    failure = Some("connection dropped".to_string());
                                }
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }

            connected.store(false, Ordering::SeqCst);
            if let Some(message) = failure {
                let _ = event_tx
                    .send(ProtocolEvent::ProtocolError { message })
                    .await;
            }
            // Uniform cleanup signal regardless of who closed the connection.
            let _ = event_tx.send(ProtocolEvent::SessionClosed).await;
            tracing::info!("Realtime connection task ended");
        });

        self.outbound = Some(out_tx);
        self.task = Some(handle);

        Ok(event_rx)
    }

    /// Transmit one captured frame. No-op with a logged warning when not
    /// connected; never returns an error.
    pub fn send_audio(&self, frame: &AudioFrame) {
        match self.audio_sender() {
            Some(sender) => sender.send_frame(frame),
            None => tracing::warn!(seq = frame.seq, "Not connected, dropping capture frame"),
        }
    }

    /// Close the current utterance boundary. Server-side turn detection does
    /// not remove the need for this in takeover flows.
    pub fn commit_audio_buffer(&self) {
        self.send_event(ClientEvent::InputAudioBufferCommit);
    }

    /// Ask the endpoint to generate a reply.
    pub fn request_response(&self) {
        self.send_event(ClientEvent::ResponseCreate);
    }

    /// Inject a text turn outside the audio channel and immediately request
    /// a response. Used by the message-composition flow.
    pub fn send_text(&self, text: &str) {
        self.send_event(ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(text),
        });
        self.send_event(ClientEvent::ResponseCreate);
    }

    /// Graceful close. Idempotent; the connection task emits
    /// [`ProtocolEvent::SessionClosed`] on its way out, whether this call or
    /// the endpoint tore the connection down.
    pub async fn disconnect(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(tx) = self.outbound.take() {
            let _ = tx.try_send(Outbound::Close);
        }
        if let Some(mut handle) = self.task.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                tracing::warn!("Realtime connection task did not stop in time, aborting");
                handle.abort();
                self.connected.store(false, Ordering::SeqCst);
            }
        }
    }

    fn send_event(&self, event: ClientEvent) {
        if !self.is_connected() {
            tracing::warn!("Not connected, dropping outbound protocol event");
            return;
        }
        if let Some(tx) = self.outbound.as_ref()
            && tx.try_send(Outbound::Event(event)).is_err()
        {
            tracing::warn!("Outbound queue full, dropping protocol event");
        }
    }
}

/// Decode one inbound text frame into a protocol event.
///
/// Transcript deltas are folded into `transcript_acc` and surfaced as the
/// accumulated text; a done event flushes and resets the accumulator, so a
/// transcript is never finalized before its preceding deltas were applied.
/// Unknown-but-well-formed message types are ignored; malformed frames are
/// logged and dropped. Neither ends the session.
fn decode_server_event(text: &str, transcript_acc: &mut String) -> Option<ProtocolEvent> {
    let event = match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            match serde_json::from_str::<serde_json::Value>(text) {
                Ok(value) => tracing::debug!(
                    event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("?"),
                    "Ignoring unhandled server event"
                ),
                Err(_) => tracing::warn!("Malformed server frame: {}", e),
            }
            return None;
        }
    };

    match event {
        ServerEvent::SessionCreated { session } => {
            tracing::info!(session_id = %session.id, "Realtime session created");
            Some(ProtocolEvent::SessionReady {
                session_id: session.id,
            })
        }
        ServerEvent::SessionUpdated { session } => {
            tracing::debug!(session_id = %session.id, "Realtime session configuration confirmed");
            Some(ProtocolEvent::SessionConfirmed)
        }
        ServerEvent::AudioTranscriptDelta { delta } => {
            transcript_acc.push_str(&delta);
            Some(ProtocolEvent::TranscriptDelta {
                text: transcript_acc.clone(),
            })
        }
        ServerEvent::AudioTranscriptDone { transcript } => {
            transcript_acc.clear();
            Some(ProtocolEvent::TranscriptFinal { text: transcript })
        }
        ServerEvent::TranscriptionCompleted { transcript } => {
            Some(ProtocolEvent::CallerTranscriptFinal { text: transcript })
        }
        ServerEvent::AudioDelta { delta } => match ServerEvent::decode_audio_delta(&delta) {
            Ok(bytes) => Some(ProtocolEvent::AudioChunk {
                bytes: Bytes::from(bytes),
            }),
            Err(e) => {
                tracing::warn!("Failed to decode audio delta: {}", e);
                None
            }
        },
        ServerEvent::Error { error } => {
            tracing::error!(
                "Realtime endpoint error: {} - {}",
                error.error_type,
                error.message
            );
            Some(ProtocolEvent::ProtocolError {
                message: format!("{}: {}", error.error_type, error.message),
            })
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_accumulation() {
        let mut acc = String::new();
        let json = r#"{"type":"response.audio_transcript.delta","delta":"Hel"}"#;
        match decode_server_event(json, &mut acc) {
            Some(ProtocolEvent::TranscriptDelta { text }) => assert_eq!(text, "Hel"),
            other => panic!("unexpected: {:?}", other),
        }
        let json = r#"{"type":"response.audio_transcript.delta","delta":"lo"}"#;
        match decode_server_event(json, &mut acc) {
            Some(ProtocolEvent::TranscriptDelta { text }) => assert_eq!(text, "Hello"),
            other => panic!("unexpected: {:?}", other),
        }
        let json = r#"{"type":"response.audio_transcript.done","transcript":"Hello"}"#;
        match decode_server_event(json, &mut acc) {
            Some(ProtocolEvent::TranscriptFinal { text }) => assert_eq!(text, "Hello"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(acc.is_empty(), "accumulator must reset after done");
    }

    #[test]
    fn test_unknown_event_ignored() {
        let mut acc = String::new();
        let json = r#"{"type":"rate_limits.updated","rate_limits":[]}"#;
        assert!(decode_server_event(json, &mut acc).is_none());
    }

    #[test]
    fn test_malformed_frame_ignored() {
        let mut acc = String::new();
        assert!(decode_server_event("{not json", &mut acc).is_none());
    }

    #[test]
    fn test_audio_chunk_decoding() {
        use base64::prelude::*;
        let mut acc = String::new();
        let pcm = vec![1u8, 2, 3, 4];
        let json = format!(
            r#"{{"type":"response.audio.delta","delta":"{}"}}"#,
            BASE64_STANDARD.encode(&pcm)
        );
        match decode_server_event(&json, &mut acc) {
            Some(ProtocolEvent::AudioChunk { bytes }) => assert_eq!(bytes.as_ref(), &pcm[..]),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_when_disconnected_is_noop() {
        let client = RealtimeClient::new(RealtimeConfig::default());
        assert!(!client.is_connected());
        // None of these may panic or error while disconnected.
        client.send_audio(&AudioFrame::capture(0, Bytes::from_static(&[0, 1])));
        client.commit_audio_buffer();
        client.request_response();
        client.send_text("hello");
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let mut client = RealtimeClient::new(RealtimeConfig::default());
        client.disconnect().await;
        client.disconnect().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let config = RealtimeConfig {
            // Nothing listens here.
            url: "ws://127.0.0.1:9".to_string(),
            connect_timeout_secs: 2,
            ..Default::default()
        };
        let mut client = RealtimeClient::new(config);
        match client.connect("test").await {
            Err(ConnectionError::Handshake(_)) | Err(ConnectionError::Timeout(_)) => {}
            other => panic!("expected handshake failure, got {:?}", other.map(|_| ())),
        }
        assert!(!client.is_connected());
    }
}

//! End-to-end call flow scenarios against a scripted in-process speech-AI
//! endpoint. The endpoint is a real WebSocket server speaking the realtime
//! wire protocol, so these tests exercise the full path: controller, relay
//! (with fake devices), protocol client and transcript.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use callpilot::core::audio::{AudioBackend, AudioConfig, AudioError, CaptureDevice, PlaybackDevice};
use callpilot::session::telephony::TelephonyError;
use callpilot::{
    AudioRoute, CallContext, CallSessionController, CallSessionHandle, CallState, Direction,
    RealtimeConfig, SmsOutbox, Speaker, TelephonyControl, TelephonyEvent,
};

// =============================================================================
// Scripted endpoint
// =============================================================================

#[derive(Clone, Copy)]
enum Script {
    /// Confirm the session, then stream "Hel" + "lo" -> "Hello" with audio
    Converse,
    /// Confirm the session, then drop the TCP connection without a close
    DropAfterReady,
    /// Text-only composition: reply to the injected turn with a draft
    Compose(&'static str),
}

async fn spawn_endpoint(script: Script) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // Serve every connection the same way; handoffs reconnect.
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if let Ok(ws) = accept_async(stream).await {
                    run_script(ws, script).await;
                }
            });
        }
    });
    format!("ws://{addr}")
}

async fn run_script(mut ws: WebSocketStream<TcpStream>, script: Script) {
    // The client declares the session before anything else.
    if wait_for_type(&mut ws, "session.update").await.is_none() {
        return;
    }
    send_json(
        &mut ws,
        json!({"type": "session.created", "session": {"id": "sess_1"}}),
    )
    .await;
    send_json(
        &mut ws,
        json!({"type": "session.updated", "session": {"id": "sess_1"}}),
    )
    .await;

    match script {
        Script::Converse => {
            if wait_for_type(&mut ws, "response.create").await.is_none() {
                return;
            }
            send_json(
                &mut ws,
                json!({"type": "response.audio_transcript.delta", "delta": "Hel"}),
            )
            .await;
            send_json(
                &mut ws,
                json!({"type": "response.audio_transcript.delta", "delta": "lo"}),
            )
            .await;
            send_json(
                &mut ws,
                json!({
                    "type": "response.audio.delta",
                    "delta": BASE64_STANDARD.encode([1u8, 2, 3, 4, 5, 6, 7, 8]),
                }),
            )
            .await;
            send_json(
                &mut ws,
                json!({"type": "response.audio_transcript.done", "transcript": "Hello"}),
            )
            .await;
            drain_until_close(&mut ws).await;
        }
        Script::DropAfterReady => {
            let _ = wait_for_type(&mut ws, "response.create").await;
            // Dropped here: no close frame, the client sees an abrupt end.
        }
        Script::Compose(draft) => {
            if wait_for_type(&mut ws, "conversation.item.create").await.is_none() {
                return;
            }
            let _ = wait_for_type(&mut ws, "response.create").await;
            let (head, tail) = draft.split_at(draft.len() / 2);
            for chunk in [head, tail] {
                send_json(
                    &mut ws,
                    json!({"type": "response.audio_transcript.delta", "delta": chunk}),
                )
                .await;
            }
            send_json(
                &mut ws,
                json!({"type": "response.audio_transcript.done", "transcript": draft}),
            )
            .await;
            drain_until_close(&mut ws).await;
        }
    }
}

/// Read frames until one of the wanted type arrives, skipping audio appends
/// and anything else. `None` when the connection ends first.
async fn wait_for_type(ws: &mut WebSocketStream<TcpStream>, wanted: &str) -> Option<()> {
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Text(text) = msg
            && let Ok(value) = serde_json::from_str::<serde_json::Value>(&text)
            && value.get("type").and_then(|t| t.as_str()) == Some(wanted)
        {
            return Some(());
        }
    }
    None
}

async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: serde_json::Value) {
    let _ = ws.send(Message::Text(value.to_string().into())).await;
}

async fn drain_until_close(ws: &mut WebSocketStream<TcpStream>) {
    while let Some(Ok(msg)) = ws.next().await {
        if msg.is_close() {
            break;
        }
    }
}

// =============================================================================
// Fake collaborators and devices
// =============================================================================

#[derive(Default)]
struct FakeTelephony {
    calls: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl TelephonyControl for FakeTelephony {
    async fn answer(&self) -> Result<(), TelephonyError> {
        self.calls.lock().push("answer");
        Ok(())
    }
    async fn reject(&self) -> Result<(), TelephonyError> {
        self.calls.lock().push("reject");
        Ok(())
    }
    async fn disconnect(&self) -> Result<(), TelephonyError> {
        self.calls.lock().push("disconnect");
        Ok(())
    }
    async fn set_muted(&self, _muted: bool) -> Result<(), TelephonyError> {
        Ok(())
    }
    async fn set_audio_route(&self, _route: AudioRoute) -> Result<(), TelephonyError> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeSms {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl SmsOutbox for FakeSms {
    async fn send_sms(&self, number: &str, text: &str) -> bool {
        self.sent.lock().push((number.to_owned(), text.to_owned()));
        true
    }
}

/// Microphone that produces 10ms of silence per read; speaker that records.
struct FakeDevices {
    played: Arc<Mutex<Vec<u8>>>,
}

struct SilenceCapture;

impl CaptureDevice for SilenceCapture {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        std::thread::sleep(Duration::from_millis(10));
        buf.fill(0);
        Ok(buf.len())
    }
}

struct RecordingPlayback {
    played: Arc<Mutex<Vec<u8>>>,
}

impl PlaybackDevice for RecordingPlayback {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        self.played.lock().extend_from_slice(pcm);
        Ok(())
    }
    fn set_route(&mut self, _speaker: bool) -> Result<(), AudioError> {
        Ok(())
    }
}

impl AudioBackend for FakeDevices {
    fn open_capture(&self, _: &AudioConfig) -> Result<Box<dyn CaptureDevice>, AudioError> {
        Ok(Box::new(SilenceCapture))
    }
    fn open_playback(&self, _: &AudioConfig) -> Result<Box<dyn PlaybackDevice>, AudioError> {
        Ok(Box::new(RecordingPlayback {
            played: self.played.clone(),
        }))
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    handle: CallSessionHandle,
    #[allow(dead_code)]
    events: mpsc::Sender<TelephonyEvent>,
    telephony: Arc<FakeTelephony>,
    sms: Arc<FakeSms>,
    played: Arc<Mutex<Vec<u8>>>,
}

fn spawn_session(url: String) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let telephony = Arc::new(FakeTelephony::default());
    let sms = Arc::new(FakeSms::default());
    let played = Arc::new(Mutex::new(Vec::new()));

    let context = CallContext {
        counterpart_number: "+15550100".into(),
        counterpart_name: Some("Dana".into()),
        direction: Direction::Inbound,
    };
    let realtime = RealtimeConfig {
        url,
        api_key: "test-key".into(),
        connect_timeout_secs: 5,
        ..Default::default()
    };
    let backend = Arc::new(FakeDevices {
        played: played.clone(),
    });

    let (handle, events) = CallSessionController::spawn(
        context,
        realtime,
        AudioConfig::default(),
        backend,
        telephony.clone(),
        sms.clone(),
    );
    Harness {
        handle,
        events,
        telephony,
        sms,
        played,
    }
}

async fn wait_for_state(handle: &CallSessionHandle, state: CallState) {
    let mut rx = handle.watch_session();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if rx.borrow().state == state {
                return;
            }
            if rx.changed().await.is_err() {
                assert_eq!(rx.borrow().state, state, "controller exited in wrong state");
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {state:?}"));
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn ai_answers_call_and_streams_transcript() {
    let url = spawn_endpoint(Script::Converse).await;
    let h = spawn_session(url);

    h.handle.start_ai_handling().await.unwrap();
    wait_for_state(&h.handle, CallState::AiHandling).await;

    // The AI answered the provider call on the way in.
    assert!(h.telephony.calls.lock().contains(&"answer"));

    // "Hel" + "lo" resolve to exactly one finalized entry.
    wait_until(
        || {
            h.handle
                .transcript()
                .iter()
                .any(|e| e.is_final && e.text == "Hello" && e.speaker == Speaker::Ai)
        },
        "finalized agent transcript",
    )
    .await;
    let transcript = h.handle.transcript();
    assert_eq!(transcript.iter().filter(|e| !e.is_final).count(), 0);

    // Agent audio reached the speaker.
    wait_until(|| !h.played.lock().is_empty(), "agent audio playback").await;
    assert_eq!(h.played.lock().as_slice(), &[1u8, 2, 3, 4, 5, 6, 7, 8][..]);

    h.handle.end_call().await.unwrap();
    wait_for_state(&h.handle, CallState::Ended).await;
    assert!(h.telephony.calls.lock().contains(&"disconnect"));
}

#[tokio::test]
async fn connection_drop_fails_safe_to_human() {
    let url = spawn_endpoint(Script::DropAfterReady).await;
    let h = spawn_session(url);

    h.handle.start_ai_handling().await.unwrap();
    wait_for_state(&h.handle, CallState::AiHandling).await;

    // The endpoint drops the connection; the call falls back to the human
    // with one recoverable error, it is never dropped outright.
    wait_for_state(&h.handle, CallState::Active).await;
    let mut errors = h.handle.watch_errors();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if errors.borrow().is_some() {
                return;
            }
            errors.changed().await.expect("controller alive");
        }
    })
    .await
    .expect("recoverable error surfaced");
    assert_eq!(h.handle.session().state, CallState::Active);
}

#[tokio::test]
async fn hand_to_ai_and_take_back_preserve_timer() {
    let url = spawn_endpoint(Script::Converse).await;
    let h = spawn_session(url);

    h.handle.answer().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2200)).await;
    let before = h.handle.session().elapsed_seconds;
    assert!(before >= 1, "timer should have ticked, got {before}");

    h.handle.hand_to_ai().await.unwrap();
    wait_for_state(&h.handle, CallState::AiHandling).await;
    h.handle.take_back().await.unwrap();
    wait_for_state(&h.handle, CallState::Active).await;

    // Handoff and reclaim never reset the duration clock.
    let after = h.handle.session().elapsed_seconds;
    assert!(after >= before, "elapsed went backwards: {before} -> {after}");
    assert!(after - before <= 3, "elapsed jumped: {before} -> {after}");

    h.handle.end_call().await.unwrap();
    wait_for_state(&h.handle, CallState::Ended).await;
}

#[tokio::test]
async fn compose_sends_endpoint_draft_as_sms() {
    let draft = "Sorry, I'm tied up. I'll call you back within the hour.";
    let url = spawn_endpoint(Script::Compose(draft)).await;
    let h = spawn_session(url);

    h.handle.compose_message("busy").await.unwrap();
    wait_for_state(&h.handle, CallState::Declined).await;

    let sent = h.sms.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "+15550100");
    assert_eq!(sent[0].1, draft);
    assert!(h.telephony.calls.lock().contains(&"reject"));

    // The draft is visible in the transcript as a finalized agent entry.
    let transcript = h.handle.transcript();
    assert!(
        transcript
            .iter()
            .any(|e| e.is_final && e.speaker == Speaker::Ai && e.text == draft)
    );
}

#[tokio::test]
async fn take_back_releases_connection_for_next_handoff() {
    let url = spawn_endpoint(Script::Converse).await;
    let h = spawn_session(url);

    h.handle.answer().await.unwrap();
    h.handle.hand_to_ai().await.unwrap();
    wait_for_state(&h.handle, CallState::AiHandling).await;
    h.handle.take_back().await.unwrap();
    wait_for_state(&h.handle, CallState::Active).await;

    // A second handoff must get a fresh session on a fresh socket.
    h.handle.hand_to_ai().await.unwrap();
    wait_for_state(&h.handle, CallState::AiHandling).await;

    h.handle.end_call().await.unwrap();
    wait_for_state(&h.handle, CallState::Ended).await;
}

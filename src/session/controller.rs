//! Call session controller.
//!
//! The controller is an actor: a cloneable [`CallSessionHandle`] sends typed
//! commands over a channel, and a single run loop owns all mutable session
//! state. Worker events (protocol, telephony, timers) are marshaled into the
//! same loop before being applied, so session state needs no locks and no
//! cross-component ordering decisions happen anywhere else.
//!
//! Connect attempts run as separate tasks tagged with the session epoch;
//! teardown bumps the epoch, and a connect that completes under a stale
//! epoch is disconnected immediately instead of wired up. A stale completion
//! must never mutate a newer session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::core::audio::{AudioBackend, AudioConfig, AudioRelay};
use crate::core::realtime::{ConnectionError, ProtocolEvent, RealtimeClient, RealtimeConfig};
use crate::core::transcript::{Speaker, TranscriptEntry, TranscriptLog};

use super::state::{CallContext, CallSession, CallState};
use super::telephony::{AudioRoute, SmsOutbox, TelephonyControl, TelephonyEvent};
use super::templates;

/// How long a recoverable error stays visible before auto-clearing.
const ERROR_DISPLAY_DURATION: Duration = Duration::from_secs(5);

/// Fatal errors tolerated before the call is ended outright.
const MAX_FATAL_ERRORS: u32 = 2;

const COMMAND_CAPACITY: usize = 32;
const INTERNAL_CAPACITY: usize = 256;
const TELEPHONY_CAPACITY: usize = 8;

// =============================================================================
// Public surface
// =============================================================================

/// Errors returned to command callers.
#[derive(Debug, Error)]
pub enum CallError {
    /// The command is not valid in the current state
    #[error("Command {command} is not valid in state {from}")]
    InvalidTransition {
        from: CallState,
        command: &'static str,
    },

    /// A connect attempt is already in flight
    #[error("A connect attempt is already in flight")]
    ConnectPending,

    /// The telephony provider refused the operation
    #[error("Telephony failure: {0}")]
    Telephony(String),

    /// The controller task has exited
    #[error("Session controller is gone")]
    ControllerGone,
}

/// A transient, dismissable error surfaced to the observer. Auto-clears
/// after a fixed display duration.
#[derive(Debug, Clone)]
pub struct RecoverableError {
    pub message: String,
}

enum Command {
    Answer(Reply),
    Decline(Reply),
    StartAiHandling(Reply),
    HandToAi(Reply),
    TakeBack(Reply),
    ComposeMessage { reason: String, reply: Reply },
    EndCall(Reply),
    SetMuted { muted: bool, reply: Reply },
    SetSpeakerRoute { speaker: bool, reply: Reply },
}

type Reply = oneshot::Sender<Result<(), CallError>>;

/// Cloneable command/observation handle to a running controller.
#[derive(Clone)]
pub struct CallSessionHandle {
    commands: mpsc::Sender<Command>,
    session_rx: watch::Receiver<CallSession>,
    transcript_rx: watch::Receiver<Vec<TranscriptEntry>>,
    error_rx: watch::Receiver<Option<RecoverableError>>,
}

impl CallSessionHandle {
    async fn command(&self, make: impl FnOnce(Reply) -> Command) -> Result<(), CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| CallError::ControllerGone)?;
        reply_rx.await.map_err(|_| CallError::ControllerGone)?
    }

    /// Answer the ringing call; human takes it.
    pub async fn answer(&self) -> Result<(), CallError> {
        self.command(Command::Answer).await
    }

    /// Reject the ringing call.
    pub async fn decline(&self) -> Result<(), CallError> {
        self.command(Command::Decline).await
    }

    /// Let the AI agent handle the call (answering it first if ringing).
    pub async fn start_ai_handling(&self) -> Result<(), CallError> {
        self.command(Command::StartAiHandling).await
    }

    /// Hand an active human-held call to the AI agent.
    pub async fn hand_to_ai(&self) -> Result<(), CallError> {
        self.command(Command::HandToAi).await
    }

    /// Reclaim the call from the AI agent.
    pub async fn take_back(&self) -> Result<(), CallError> {
        self.command(Command::TakeBack).await
    }

    /// Decline the call with a composed SMS instead of answering.
    pub async fn compose_message(&self, reason: &str) -> Result<(), CallError> {
        let reason = reason.to_owned();
        self.command(|reply| Command::ComposeMessage { reason, reply })
            .await
    }

    /// Hang up, from any non-terminal state.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.command(Command::EndCall).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.command(|reply| Command::SetMuted { muted, reply })
            .await
    }

    pub async fn set_speaker_route(&self, speaker: bool) -> Result<(), CallError> {
        self.command(|reply| Command::SetSpeakerRoute { speaker, reply })
            .await
    }

    /// Current session snapshot.
    pub fn session(&self) -> CallSession {
        self.session_rx.borrow().clone()
    }

    /// Current transcript snapshot.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript_rx.borrow().clone()
    }

    /// Live session snapshots.
    pub fn watch_session(&self) -> watch::Receiver<CallSession> {
        self.session_rx.clone()
    }

    /// Live transcript snapshots.
    pub fn watch_transcript(&self) -> watch::Receiver<Vec<TranscriptEntry>> {
        self.transcript_rx.clone()
    }

    /// Recoverable-error stream; `None` when nothing is showing.
    pub fn watch_errors(&self) -> watch::Receiver<Option<RecoverableError>> {
        self.error_rx.clone()
    }
}

// =============================================================================
// Controller internals
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectPurpose {
    /// Full duplex audio session (answering or takeover)
    Audio,
    /// Text-only decline-message composition
    Compose,
}

enum Internal {
    Connected {
        epoch: u64,
        purpose: ConnectPurpose,
        result: Result<(RealtimeClient, mpsc::Receiver<ProtocolEvent>), ConnectionError>,
    },
    Protocol {
        epoch: u64,
        event: ProtocolEvent,
    },
    ClearError {
        seq: u64,
    },
}

/// The state machine owning one [`CallSession`].
///
/// Constructed via [`CallSessionController::spawn`], which starts the run
/// loop and returns the command handle plus a sender the embedder feeds
/// provider events into (a remote hangup is treated as `end_call`).
pub struct CallSessionController {
    context: CallContext,
    session: CallSession,
    realtime: RealtimeConfig,
    relay: AudioRelay,
    telephony: Arc<dyn TelephonyControl>,
    sms: Arc<dyn SmsOutbox>,
    transcript: TranscriptLog,

    client: Option<RealtimeClient>,
    forwarder: Option<JoinHandle<()>>,
    capture_pump: Option<JoinHandle<()>>,
    pending: Option<ConnectPurpose>,
    connect_purpose: Option<ConnectPurpose>,
    compose_reason: Option<String>,

    epoch: u64,
    answered_at: Option<Instant>,
    fatal_errors: u32,
    error_seq: u64,

    internal_tx: mpsc::Sender<Internal>,
    session_tx: watch::Sender<CallSession>,
    transcript_tx: watch::Sender<Vec<TranscriptEntry>>,
    error_tx: watch::Sender<Option<RecoverableError>>,
}

impl CallSessionController {
    /// Start a controller for one detected call.
    ///
    /// Returns the command handle and the channel for provider-driven
    /// telephony events. The controller task exits once the session reaches
    /// a terminal state; commands sent after that fail with
    /// [`CallError::ControllerGone`].
    pub fn spawn(
        context: CallContext,
        realtime: RealtimeConfig,
        audio: AudioConfig,
        backend: Arc<dyn AudioBackend>,
        telephony: Arc<dyn TelephonyControl>,
        sms: Arc<dyn SmsOutbox>,
    ) -> (CallSessionHandle, mpsc::Sender<TelephonyEvent>) {
        let session = CallSession::new(&context);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_CAPACITY);
        let (telephony_tx, telephony_rx) = mpsc::channel(TELEPHONY_CAPACITY);
        let (session_tx, session_rx) = watch::channel(session.clone());
        let (transcript_tx, transcript_rx) = watch::channel(Vec::new());
        let (error_tx, error_rx) = watch::channel(None);

        let controller = Self {
            context,
            session,
            realtime,
            relay: AudioRelay::new(backend, audio),
            telephony,
            sms,
            transcript: TranscriptLog::new(),
            client: None,
            forwarder: None,
            capture_pump: None,
            pending: None,
            connect_purpose: None,
            compose_reason: None,
            epoch: 0,
            answered_at: None,
            fatal_errors: 0,
            error_seq: 0,
            internal_tx,
            session_tx,
            transcript_tx,
            error_tx,
        };

        tokio::spawn(controller.run(command_rx, internal_rx, telephony_rx));

        let handle = CallSessionHandle {
            commands: command_tx,
            session_rx,
            transcript_rx,
            error_rx,
        };
        (handle, telephony_tx)
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<Command>,
        mut internal_rx: mpsc::Receiver<Internal>,
        mut telephony_rx: mpsc::Receiver<TelephonyEvent>,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(id = %self.session.id, "Call session controller started");

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // All handles dropped: nobody can drive the call anymore.
                    None => self.do_end_call().await,
                },
                Some(internal) = internal_rx.recv() => self.handle_internal(internal).await,
                Some(event) = telephony_rx.recv() => self.handle_telephony(event).await,
                _ = ticker.tick() => self.tick(),
            }

            if self.session.state.is_terminal() {
                break;
            }
        }

        // Belt-and-braces release of devices and socket on exit.
        self.teardown_ai().await;
        tracing::info!(id = %self.session.id, state = %self.session.state,
            "Call session controller stopped");
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Answer(reply) => {
                let result = self.cmd_answer().await;
                let _ = reply.send(result);
            }
            Command::Decline(reply) => {
                let result = self.cmd_decline().await;
                let _ = reply.send(result);
            }
            Command::StartAiHandling(reply) => {
                let result = self.cmd_start_ai_handling().await;
                let _ = reply.send(result);
            }
            Command::HandToAi(reply) => {
                let result = self.cmd_hand_to_ai().await;
                let _ = reply.send(result);
            }
            Command::TakeBack(reply) => {
                let result = self.cmd_take_back().await;
                let _ = reply.send(result);
            }
            Command::ComposeMessage { reason, reply } => {
                let result = self.cmd_compose_message(reason).await;
                let _ = reply.send(result);
            }
            Command::EndCall(reply) => {
                let result = self.cmd_end_call().await;
                let _ = reply.send(result);
            }
            Command::SetMuted { muted, reply } => {
                let result = self.cmd_set_muted(muted).await;
                let _ = reply.send(result);
            }
            Command::SetSpeakerRoute { speaker, reply } => {
                let result = self.cmd_set_speaker_route(speaker).await;
                let _ = reply.send(result);
            }
        }
    }

    fn require_state(
        &self,
        command: &'static str,
        valid: &[CallState],
    ) -> Result<(), CallError> {
        if valid.contains(&self.session.state) {
            Ok(())
        } else {
            Err(CallError::InvalidTransition {
                from: self.session.state,
                command,
            })
        }
    }

    async fn cmd_answer(&mut self) -> Result<(), CallError> {
        self.require_state("answer", &[CallState::Incoming])?;
        self.telephony
            .answer()
            .await
            .map_err(|e| CallError::Telephony(e.to_string()))?;
        self.mark_answered();
        self.set_state(CallState::Active);
        Ok(())
    }

    async fn cmd_decline(&mut self) -> Result<(), CallError> {
        self.require_state("decline", &[CallState::Incoming])?;
        if let Err(e) = self.telephony.reject().await {
            tracing::debug!("Reject failed, treating call as already gone: {}", e);
        }
        self.set_state(CallState::Declined);
        Ok(())
    }

    async fn cmd_start_ai_handling(&mut self) -> Result<(), CallError> {
        self.require_state(
            "start_ai_handling",
            &[CallState::Incoming, CallState::Active],
        )?;
        if self.pending.is_some() {
            return Err(CallError::ConnectPending);
        }

        let instructions = if self.session.state == CallState::Incoming {
            self.telephony
                .answer()
                .await
                .map_err(|e| CallError::Telephony(e.to_string()))?;
            self.mark_answered();
            self.set_state(CallState::Active);
            templates::answering_instructions(&self.context)
        } else {
            templates::takeover_instructions(&self.context)
        };

        self.begin_connect(ConnectPurpose::Audio, instructions);
        Ok(())
    }

    async fn cmd_hand_to_ai(&mut self) -> Result<(), CallError> {
        self.require_state("hand_to_ai", &[CallState::Active])?;
        if self.pending.is_some() {
            return Err(CallError::ConnectPending);
        }

        // Fresh session per handoff; any stale connection goes first. The
        // duration clock is untouched, this is a mid-call handoff, not a
        // new call.
        self.teardown_ai().await;
        let instructions = templates::takeover_instructions(&self.context);
        self.begin_connect(ConnectPurpose::Audio, instructions);
        Ok(())
    }

    async fn cmd_take_back(&mut self) -> Result<(), CallError> {
        self.require_state("take_back", &[CallState::AiHandling])?;
        self.teardown_ai().await;
        self.set_state(CallState::Active);
        Ok(())
    }

    async fn cmd_compose_message(&mut self, reason: String) -> Result<(), CallError> {
        self.require_state("compose_message", &[CallState::Incoming])?;
        if self.pending.is_some() {
            return Err(CallError::ConnectPending);
        }

        self.compose_reason = Some(reason);
        self.set_state(CallState::ComposingMessage);
        let instructions = templates::compose_instructions(&self.context);
        self.begin_connect(ConnectPurpose::Compose, instructions);
        Ok(())
    }

    async fn cmd_end_call(&mut self) -> Result<(), CallError> {
        if self.session.state.is_terminal() {
            return Err(CallError::InvalidTransition {
                from: self.session.state,
                command: "end_call",
            });
        }
        self.do_end_call().await;
        Ok(())
    }

    async fn cmd_set_muted(&mut self, muted: bool) -> Result<(), CallError> {
        if let Err(e) = self.telephony.set_muted(muted).await {
            tracing::warn!("Provider mute failed: {}", e);
        }

        let was_capturing = self.relay.is_capturing();
        self.relay.set_muted(muted);

        if muted && was_capturing {
            // Close the utterance boundary so the agent replies to what it
            // already heard instead of waiting on a silent stream.
            if let Some(client) = &self.client {
                client.commit_audio_buffer();
            }
        }
        if !muted && self.session.state == CallState::AiHandling && !self.relay.is_capturing() {
            self.restart_capture();
        }

        self.session.is_muted = muted;
        self.publish_session();
        Ok(())
    }

    async fn cmd_set_speaker_route(&mut self, speaker: bool) -> Result<(), CallError> {
        let route = if speaker {
            AudioRoute::Speaker
        } else {
            AudioRoute::Earpiece
        };
        if let Err(e) = self.telephony.set_audio_route(route).await {
            tracing::warn!("Provider route change failed: {}", e);
        }
        self.relay.set_speaker_route(speaker);
        self.session.is_speaker_on = speaker;
        self.publish_session();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Internal events
    // -------------------------------------------------------------------------

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Connected {
                epoch,
                purpose,
                result,
            } => self.handle_connected(epoch, purpose, result).await,
            Internal::Protocol { epoch, event } => {
                if epoch != self.epoch {
                    tracing::debug!("Dropping protocol event from a previous session");
                    return;
                }
                self.handle_protocol_event(event).await;
            }
            Internal::ClearError { seq } => {
                if seq == self.error_seq {
                    self.error_tx.send_replace(None);
                }
            }
        }
    }

    async fn handle_connected(
        &mut self,
        epoch: u64,
        purpose: ConnectPurpose,
        result: Result<(RealtimeClient, mpsc::Receiver<ProtocolEvent>), ConnectionError>,
    ) {
        if epoch != self.epoch {
            // Teardown won the race; never wire a stale connection up.
            if let Ok((mut client, _events)) = result {
                tracing::info!("Disconnecting connection that completed after teardown");
                client.disconnect().await;
            }
            return;
        }
        self.pending = None;

        match result {
            Ok((client, mut events)) => {
                self.client = Some(client);
                self.connect_purpose = Some(purpose);

                let internal = self.internal_tx.clone();
                let event_epoch = self.epoch;
                self.forwarder = Some(tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        let wrapped = Internal::Protocol {
                            epoch: event_epoch,
                            event,
                        };
                        if internal.send(wrapped).await.is_err() {
                            break;
                        }
                    }
                }));
            }
            Err(e) => match purpose {
                ConnectPurpose::Compose => {
                    tracing::warn!("Compose connect failed, using static template: {}", e);
                    self.finish_compose(None).await;
                }
                ConnectPurpose::Audio => {
                    self.handle_fatal(format!("connect failed: {e}")).await;
                }
            },
        }
    }

    async fn handle_protocol_event(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::SessionReady { session_id } => {
                tracing::info!(%session_id, "Speech-AI session ready");
                match self.connect_purpose {
                    Some(ConnectPurpose::Audio) => self.activate_ai_audio().await,
                    Some(ConnectPurpose::Compose) => {
                        let prompt = self
                            .compose_reason
                            .as_deref()
                            .map(templates::compose_prompt)
                            .unwrap_or_else(|| templates::compose_prompt("unavailable"));
                        if let Some(client) = &self.client {
                            client.send_text(&prompt);
                        }
                    }
                    None => {}
                }
            }
            ProtocolEvent::SessionConfirmed => {
                tracing::debug!("Session configuration confirmed");
            }
            ProtocolEvent::TranscriptDelta { text } => {
                self.transcript.update_open_entry(&text);
                self.publish_transcript();
            }
            ProtocolEvent::TranscriptFinal { text } => {
                self.transcript.finalize_open_entry_with(&text);
                self.publish_transcript();
                if self.session.state == CallState::ComposingMessage {
                    self.finish_compose(Some(text)).await;
                }
            }
            ProtocolEvent::CallerTranscriptFinal { text } => {
                self.transcript.append_final(Speaker::Caller, text);
                self.publish_transcript();
            }
            ProtocolEvent::AudioChunk { bytes } => {
                if let Err(e) = self.relay.enqueue_playback(bytes) {
                    tracing::warn!("Playback enqueue failed: {}", e);
                }
            }
            ProtocolEvent::ProtocolError { message } => {
                if self.session.state == CallState::ComposingMessage {
                    tracing::warn!("Compose session failed, using static template: {}", message);
                    self.finish_compose(None).await;
                } else {
                    self.handle_fatal(message).await;
                }
            }
            ProtocolEvent::SessionClosed => {
                tracing::debug!("Speech-AI session closed");
            }
        }
    }

    /// Wire capture and flip to `AiHandling` once the endpoint confirmed the
    /// session. A device failure here aborts the handoff and leaves the call
    /// with the human.
    async fn activate_ai_audio(&mut self) {
        if !self.session.is_muted {
            match self.relay.start_capture() {
                Ok(frames) => self.spawn_capture_pump(frames),
                Err(e) => {
                    tracing::error!("Capture unavailable, aborting AI handoff: {}", e);
                    self.teardown_ai().await;
                    if self.session.state != CallState::Active {
                        self.set_state(CallState::Active);
                    }
                    self.raise_error(format!("Microphone unavailable: {e}"));
                    return;
                }
            }
        }

        self.set_state(CallState::AiHandling);
        // The agent speaks first.
        if let Some(client) = &self.client {
            client.request_response();
        }
    }

    fn spawn_capture_pump(&mut self, mut frames: mpsc::Receiver<crate::core::audio::AudioFrame>) {
        let Some(sender) = self.client.as_ref().and_then(|c| c.audio_sender()) else {
            return;
        };
        self.capture_pump = Some(tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                sender.send_frame(&frame);
            }
        }));
    }

    fn restart_capture(&mut self) {
        match self.relay.start_capture() {
            Ok(frames) => self.spawn_capture_pump(frames),
            Err(e) => self.raise_error(format!("Microphone unavailable: {e}")),
        }
    }

    async fn handle_telephony(&mut self, event: TelephonyEvent) {
        match event {
            TelephonyEvent::RemoteHangup => {
                tracing::info!("Remote party hung up");
                self.do_end_call().await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Failure and teardown
    // -------------------------------------------------------------------------

    /// A fatal AI-session fault. Fails safe toward human control: the call
    /// survives the first fault with the human back in charge; a second one
    /// ends the call.
    async fn handle_fatal(&mut self, message: String) {
        self.fatal_errors += 1;
        tracing::error!(count = self.fatal_errors, "Fatal AI-session error: {}", message);

        if self.fatal_errors >= MAX_FATAL_ERRORS {
            self.do_end_call().await;
            return;
        }

        self.teardown_ai().await;
        if self.session.state == CallState::AiHandling {
            self.set_state(CallState::Active);
        }
        self.raise_error("AI connection failed, the call is back with you".to_string());
    }

    /// Complete the compose flow: `draft` from the endpoint, or the static
    /// reason template when the session never produced one. Ends in
    /// `Declined` either way.
    async fn finish_compose(&mut self, draft: Option<String>) {
        let text = match draft {
            Some(text) => text,
            None => {
                let reason = self.compose_reason.as_deref().unwrap_or_default();
                let text = templates::decline_template(reason).to_string();
                self.transcript.append_final(Speaker::Ai, text.clone());
                self.publish_transcript();
                text
            }
        };

        let number = self.session.counterpart_number.clone();
        if !self.sms.send_sms(&number, &text).await {
            tracing::warn!("Decline SMS was not accepted by the messaging provider");
            self.raise_error("Message could not be sent".to_string());
        }

        self.teardown_ai().await;
        if let Err(e) = self.telephony.reject().await {
            tracing::debug!("Reject failed, treating call as already gone: {}", e);
        }
        self.set_state(CallState::Declined);
    }

    async fn do_end_call(&mut self) {
        if self.session.state.is_terminal() {
            return;
        }
        self.teardown_ai().await;
        // An already-hung-up provider is terminal, not an error to escalate.
        if let Err(e) = self.telephony.disconnect().await {
            tracing::debug!("Provider disconnect: {}", e);
        }
        self.set_state(CallState::Ended);
    }

    /// Release the AI data paths: stop producing outbound frames, then sever
    /// the transport, then stop playback. Bumps the epoch so in-flight
    /// completions from the old session are rejected.
    async fn teardown_ai(&mut self) {
        self.epoch += 1;
        self.pending = None;
        self.connect_purpose = None;

        if let Some(pump) = self.capture_pump.take() {
            pump.abort();
        }
        self.relay.stop_capture();

        if let Some(mut client) = self.client.take() {
            client.disconnect().await;
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        self.relay.stop_playback();
        self.transcript.finalize_open_entry();
        self.publish_transcript();
    }

    // -------------------------------------------------------------------------
    // Observation
    // -------------------------------------------------------------------------

    fn begin_connect(&mut self, purpose: ConnectPurpose, instructions: String) {
        self.pending = Some(purpose);
        let epoch = self.epoch;
        let config = self.realtime.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let mut client = RealtimeClient::new(config);
            let result = match client.connect(&instructions).await {
                Ok(events) => Ok((client, events)),
                Err(e) => Err(e),
            };
            let _ = internal
                .send(Internal::Connected {
                    epoch,
                    purpose,
                    result,
                })
                .await;
        });
    }

    fn mark_answered(&mut self) {
        self.answered_at = Some(Instant::now());
        self.session.started_at = Some(OffsetDateTime::now_utc());
        self.session.elapsed_seconds = 0;
    }

    fn set_state(&mut self, next: CallState) {
        debug_assert!(
            self.session.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.session.state,
            next
        );
        tracing::info!(from = %self.session.state, to = %next, "Call state transition");
        self.session.state = next;
        self.publish_session();
    }

    fn tick(&mut self) {
        if let Some(answered_at) = self.answered_at {
            let elapsed = answered_at.elapsed().as_secs();
            if elapsed != self.session.elapsed_seconds {
                self.session.elapsed_seconds = elapsed;
                self.publish_session();
            }
        }
    }

    fn raise_error(&mut self, message: String) {
        self.error_seq += 1;
        let seq = self.error_seq;
        self.error_tx.send_replace(Some(RecoverableError { message }));

        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ERROR_DISPLAY_DURATION).await;
            let _ = internal.send(Internal::ClearError { seq }).await;
        });
    }

    fn publish_session(&self) {
        self.session_tx.send_replace(self.session.clone());
    }

    fn publish_transcript(&self) {
        self.transcript_tx.send_replace(self.transcript.snapshot());
    }
}

// =============================================================================
// Tests
// =============================================================================

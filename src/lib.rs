//! AI call handling session library.
//!
//! Lets an incoming phone call be handed to an AI agent that converses with
//! the caller in real time, with the human able to reclaim the call at any
//! moment. The crate owns the call state machine, the duplex audio relay
//! between the device microphone/speaker and the speech-AI endpoint, the
//! realtime wire protocol client, and the causally-ordered transcript.
//!
//! The UI, telephony call control and SMS sending are external
//! collaborators: the embedder injects them through the [`session`] traits
//! and observes the session through watch channels on
//! [`session::CallSessionHandle`].

pub mod config;
pub mod core;
pub mod session;

pub use config::Settings;
pub use core::audio::{
    AudioBackend, AudioConfig, AudioError, AudioFrame, AudioRelay, CpalBackend,
};
pub use core::realtime::{ConnectionError, ProtocolEvent, RealtimeClient, RealtimeConfig};
pub use core::transcript::{Speaker, TranscriptEntry, TranscriptLog};
pub use session::{
    AudioRoute, CallContext, CallError, CallSession, CallSessionController, CallSessionHandle,
    CallState, Direction, RecoverableError, SmsOutbox, TelephonyControl, TelephonyEvent,
};

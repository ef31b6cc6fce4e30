//! Realtime speech-AI session module.
//!
//! Implements the WebSocket wire protocol for a live, bidirectional session
//! with the speech-AI endpoint: audio in both directions, transcript deltas,
//! and structured control messages.
//!
//! # Audio Format
//!
//! PCM 16-bit signed little-endian, 24 kHz, mono, base64-encoded on the wire.
//!
//! # Layout
//!
//! - `messages`: closed tagged enums for both wire directions
//! - `config`: session configuration and the `session.update` payload builder
//! - `client`: the connection lifecycle and the [`ProtocolEvent`] stream

pub mod client;
pub mod config;
pub mod messages;

pub use client::{AudioSender, ConnectionError, ProtocolEvent, RealtimeClient};
pub use config::{RealtimeConfig, TurnDetectionSettings};
pub use messages::{ClientEvent, ServerEvent, SessionConfig, TurnDetection};

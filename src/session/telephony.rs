//! Telephony and messaging collaborator seams.
//!
//! The controller never touches provider call-control primitives directly;
//! it drives them through these narrow traits, and the embedder injects the
//! platform implementation. Tests inject recording fakes.

use async_trait::async_trait;
use thiserror::Error;

/// Errors from the telephony provider.
#[derive(Debug, Error)]
pub enum TelephonyError {
    /// The provider rejected the operation
    #[error("Telephony operation failed: {0}")]
    Provider(String),

    /// The call no longer exists on the provider side
    #[error("Call already disconnected")]
    AlreadyDisconnected,
}

/// Output route for call audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioRoute {
    Speaker,
    Earpiece,
}

/// Provider-driven events the controller must react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelephonyEvent {
    /// The remote party hung up; equivalent to an `end_call` command
    RemoteHangup,
}

/// Call-control primitives, consumed but not implemented here.
#[async_trait]
pub trait TelephonyControl: Send + Sync {
    async fn answer(&self) -> Result<(), TelephonyError>;
    async fn reject(&self) -> Result<(), TelephonyError>;
    async fn disconnect(&self) -> Result<(), TelephonyError>;
    async fn set_muted(&self, muted: bool) -> Result<(), TelephonyError>;
    async fn set_audio_route(&self, route: AudioRoute) -> Result<(), TelephonyError>;
}

/// Outbound SMS seam for the message-composition flow.
#[async_trait]
pub trait SmsOutbox: Send + Sync {
    /// Send a text to the given number; returns whether the provider
    /// accepted it.
    async fn send_sms(&self, number: &str, text: &str) -> bool;
}

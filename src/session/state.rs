//! Call session state.
//!
//! [`CallState`] encodes the full transition table of the call life cycle;
//! every command the controller accepts is validated against it, so the
//! session can never reach an undefined state. [`CallSession`] is the
//! immutable snapshot published to observers.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Who initiated the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Life-cycle state of one call.
///
/// `Declined` and `Ended` are terminal. Every non-terminal state may move to
/// `Ended` (hangup or fatal error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Ringing, not yet answered
    Incoming,
    /// Connected, human in control
    Active,
    /// Connected, AI agent in control
    AiHandling,
    /// Drafting a decline SMS instead of answering
    ComposingMessage,
    /// Rejected (terminal)
    Declined,
    /// Hung up or torn down (terminal)
    Ended,
}

impl CallState {
    /// Whether this state accepts no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Declined | Self::Ended)
    }

    /// The full transition table.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Incoming, Active | AiHandling | ComposingMessage | Declined) => true,
            (Active, AiHandling) => true,
            (AiHandling, Active) => true,
            (ComposingMessage, Declined) => true,
            (from, Ended) if !from.is_terminal() => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Incoming => "incoming",
            Self::Active => "active",
            Self::AiHandling => "ai_handling",
            Self::ComposingMessage => "composing_message",
            Self::Declined => "declined",
            Self::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Context the embedder knows about the call before the session starts.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub counterpart_number: String,
    pub counterpart_name: Option<String>,
    pub direction: Direction,
}

impl CallContext {
    /// Display name for the remote party, falling back to the number.
    pub fn counterpart_label(&self) -> &str {
        self.counterpart_name
            .as_deref()
            .unwrap_or(&self.counterpart_number)
    }
}

/// Snapshot of one call's identity and status.
///
/// Exactly one session is live at a time, owned exclusively by the
/// controller; observers receive clones through a watch channel.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub id: String,
    pub counterpart_number: String,
    pub counterpart_name: Option<String>,
    pub direction: Direction,
    pub state: CallState,
    /// Set when the call is answered
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    pub elapsed_seconds: u64,
    pub is_muted: bool,
    pub is_speaker_on: bool,
}

impl CallSession {
    /// Fresh session for a detected call, in `Incoming` state.
    pub fn new(context: &CallContext) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            counterpart_number: context.counterpart_number.clone(),
            counterpart_name: context.counterpart_name.clone(),
            direction: context.direction,
            state: CallState::Incoming,
            started_at: None,
            elapsed_seconds: 0,
            is_muted: false,
            is_speaker_on: false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use CallState::*;

    const ALL: [CallState; 6] = [Incoming, Active, AiHandling, ComposingMessage, Declined, Ended];

    #[test]
    fn test_transition_table_exhaustive() {
        // Every (from, to) pair checked against the intended table.
        for from in ALL {
            for to in ALL {
                let allowed = match (from, to) {
                    (Incoming, Active)
                    | (Incoming, AiHandling)
                    | (Incoming, ComposingMessage)
                    | (Incoming, Declined)
                    | (Active, AiHandling)
                    | (AiHandling, Active)
                    | (ComposingMessage, Declined) => true,
                    (f, Ended) => !f.is_terminal(),
                    _ => false,
                };
                assert_eq!(
                    from.can_transition_to(to),
                    allowed,
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for to in ALL {
            assert!(!Declined.can_transition_to(to), "declined -> {to}");
            assert!(!Ended.can_transition_to(to), "ended -> {to}");
        }
    }

    #[test]
    fn test_new_session_is_incoming() {
        let context = CallContext {
            counterpart_number: "+15550100".into(),
            counterpart_name: Some("Dana".into()),
            direction: Direction::Inbound,
        };
        let session = CallSession::new(&context);
        assert_eq!(session.state, Incoming);
        assert_eq!(session.elapsed_seconds, 0);
        assert!(session.started_at.is_none());
        assert!(!session.is_muted);
        assert_eq!(context.counterpart_label(), "Dana");
    }

    #[test]
    fn test_counterpart_label_falls_back_to_number() {
        let context = CallContext {
            counterpart_number: "+15550100".into(),
            counterpart_name: None,
            direction: Direction::Inbound,
        };
        assert_eq!(context.counterpart_label(), "+15550100");
    }
}

//! Canned text: AI instruction phrasings and decline SMS templates.
//!
//! Instructions differ by entry path. Answering a call fresh, taking over a
//! call mid-conversation, and drafting a decline SMS each get distinct
//! phrasing so the agent behaves appropriately for the handoff context.

use phf::phf_map;

use super::state::CallContext;

/// Static reason-keyed decline messages, used when no protocol session is
/// available to compose one.
static DECLINE_TEMPLATES: phf::Map<&'static str, &'static str> = phf_map! {
    "busy" => "Sorry, I can't take your call right now. I'll get back to you as soon as I can.",
    "driving" => "I'm driving at the moment and can't talk. I'll call you back when I arrive.",
    "meeting" => "I'm in a meeting right now. I'll call you back once it wraps up.",
};

const DEFAULT_DECLINE_TEMPLATE: &str =
    "Sorry, I can't take your call right now. I'll call you back later.";

/// Look up the static decline message for a reason, falling back to a
/// generic one for unknown reasons.
pub fn decline_template(reason: &str) -> &'static str {
    DECLINE_TEMPLATES
        .get(reason.to_ascii_lowercase().as_str())
        .copied()
        .unwrap_or(DEFAULT_DECLINE_TEMPLATE)
}

/// Instructions for an AI agent answering the call from the start.
pub fn answering_instructions(context: &CallContext) -> String {
    format!(
        "You are an assistant answering a phone call on behalf of the owner \
         of this phone. The caller is {}. Greet the caller, explain that the \
         owner is unavailable, find out why they are calling, and take a \
         message. Be brief, polite and natural. Speak first.",
        context.counterpart_label()
    )
}

/// Instructions for an AI agent taking over a call already in progress.
pub fn takeover_instructions(context: &CallContext) -> String {
    format!(
        "You are an assistant taking over an ongoing phone call on behalf of \
         the owner of this phone. The other party is {}. The owner had to \
         step away mid-call. Let the caller know you are taking over, then \
         continue the conversation and take a message if needed. Be brief, \
         polite and natural.",
        context.counterpart_label()
    )
}

/// Instructions for the text-only decline-message composition session.
pub fn compose_instructions(context: &CallContext) -> String {
    format!(
        "You draft short SMS messages. The owner of this phone is declining \
         a call from {} and wants to send them a brief text instead. Reply \
         with the message text only, no quotes or commentary.",
        context.counterpart_label()
    )
}

/// The text turn that kicks off composition for a given decline reason.
pub fn compose_prompt(reason: &str) -> String {
    format!(
        "Draft a one-sentence SMS declining the call because: {reason}. \
         Friendly tone, promise to follow up."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::Direction;

    fn context() -> CallContext {
        CallContext {
            counterpart_number: "+15550100".into(),
            counterpart_name: Some("Dana".into()),
            direction: Direction::Inbound,
        }
    }

    #[test]
    fn test_known_reasons_have_templates() {
        for reason in ["busy", "driving", "meeting", "BUSY"] {
            assert!(!decline_template(reason).is_empty());
        }
        assert_ne!(decline_template("busy"), decline_template("driving"));
    }

    #[test]
    fn test_unknown_reason_falls_back() {
        assert_eq!(decline_template("on the moon"), DEFAULT_DECLINE_TEMPLATE);
    }

    #[test]
    fn test_instructions_mention_counterpart() {
        let ctx = context();
        assert!(answering_instructions(&ctx).contains("Dana"));
        assert!(takeover_instructions(&ctx).contains("Dana"));
        assert!(compose_instructions(&ctx).contains("Dana"));
    }

    #[test]
    fn test_phrasings_differ_by_entry_path() {
        let ctx = context();
        assert_ne!(answering_instructions(&ctx), takeover_instructions(&ctx));
        assert!(takeover_instructions(&ctx).contains("taking over"));
    }
}

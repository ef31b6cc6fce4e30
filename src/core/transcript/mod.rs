//! Call transcript log.
//!
//! Ordered record of everything said on a call: caller speech recognized by
//! the remote endpoint, AI speech streamed as it is generated, and text the
//! user injected. AI entries stream in as deltas against a single open
//! entry; everything else arrives final.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The remote party on the call
    Caller,
    /// The assistant speaking on the user's behalf
    Ai,
    /// The device owner (typed text, not speech)
    User,
}

/// One utterance in the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    /// When the entry was appended (open entries) or finalized
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// False while the entry is still accumulating streamed deltas
    pub is_final: bool,
}

/// Append-only transcript with at most one open (streaming) entry.
///
/// The open entry is always the most recent one and always belongs to the
/// AI; caller and user entries are final on arrival. Finalization timestamps
/// are monotonically non-decreasing in entry order.
#[derive(Debug, Default)]
pub struct TranscriptLog {
    entries: Vec<TranscriptEntry>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a finalized entry. Closes any open entry first so the
    /// open-entry-is-last invariant holds.
    pub fn append_final(&mut self, speaker: Speaker, text: impl Into<String>) {
        self.finalize_open_entry();
        self.entries.push(TranscriptEntry {
            speaker,
            text: text.into(),
            timestamp: OffsetDateTime::now_utc(),
            is_final: true,
        });
    }

    /// Replace the text of the open AI entry, opening one if none exists.
    ///
    /// The caller passes the full accumulated text so far, not a delta. An
    /// open entry with a non-AI speaker is a programming error: fails fast
    /// in debug builds, ignored in release.
    pub fn update_open_entry(&mut self, text: &str) {
        match self.entries.last_mut() {
            Some(entry) if !entry.is_final => {
                debug_assert_eq!(entry.speaker, Speaker::Ai, "only AI entries stream");
                if entry.speaker != Speaker::Ai {
                    return;
                }
                entry.text = text.to_owned();
            }
            _ => self.entries.push(TranscriptEntry {
                speaker: Speaker::Ai,
                text: text.to_owned(),
                timestamp: OffsetDateTime::now_utc(),
                is_final: false,
            }),
        }
    }

    /// Close the open entry, if any, replacing its accumulated text with the
    /// authoritative final text. No-op when nothing is open.
    pub fn finalize_open_entry_with(&mut self, text: &str) {
        if let Some(entry) = self.entries.last_mut()
            && !entry.is_final
        {
            entry.text = text.to_owned();
            entry.is_final = true;
            entry.timestamp = OffsetDateTime::now_utc();
        }
    }

    /// Close the open entry keeping its accumulated text. Idempotent.
    pub fn finalize_open_entry(&mut self) {
        if let Some(entry) = self.entries.last_mut()
            && !entry.is_final
        {
            entry.is_final = true;
            entry.timestamp = OffsetDateTime::now_utc();
        }
    }

    /// Whether a streaming entry is currently open.
    pub fn has_open_entry(&self) -> bool {
        self.entries.last().is_some_and(|e| !e.is_final)
    }

    /// Immutable view of all entries in arrival order.
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// Owned copy of the current entries, for watch-channel publication.
    pub fn snapshot(&self) -> Vec<TranscriptEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_entries_append_in_order() {
        let mut log = TranscriptLog::new();
        log.append_final(Speaker::Caller, "Hi, is this Sam?");
        log.append_final(Speaker::User, "Tell them I'll call back");
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[0].speaker, Speaker::Caller);
        assert!(log.entries()[0].is_final);
        assert_eq!(log.entries()[1].speaker, Speaker::User);
    }

    #[test]
    fn test_updates_land_in_one_open_entry() {
        let mut log = TranscriptLog::new();
        log.update_open_entry("Sam is ");
        log.update_open_entry("Sam is not available");
        assert_eq!(log.len(), 1);
        assert!(log.has_open_entry());
        assert_eq!(log.entries()[0].text, "Sam is not available");
    }

    #[test]
    fn test_finalize_replaces_with_authoritative_text() {
        let mut log = TranscriptLog::new();
        log.update_open_entry("Sam is not avail");
        log.finalize_open_entry_with("Sam is not available right now.");
        assert!(!log.has_open_entry());
        assert_eq!(log.entries()[0].text, "Sam is not available right now.");
        assert!(log.entries()[0].is_final);
    }

    #[test]
    fn test_finalize_idempotent_and_noop_when_closed() {
        let mut log = TranscriptLog::new();
        log.finalize_open_entry();
        assert!(log.is_empty());

        log.update_open_entry("done");
        log.finalize_open_entry();
        log.finalize_open_entry();
        log.finalize_open_entry_with("should not apply");
        assert_eq!(log.entries()[0].text, "done");
    }

    #[test]
    fn test_final_append_closes_open_entry_first() {
        let mut log = TranscriptLog::new();
        log.update_open_entry("One moment");
        log.append_final(Speaker::Caller, "Sure");
        assert_eq!(log.len(), 2);
        assert!(log.entries()[0].is_final, "open entry closed by later final");
        assert!(!log.has_open_entry());
    }

    #[test]
    fn test_new_update_after_finalize_opens_fresh_entry() {
        let mut log = TranscriptLog::new();
        log.update_open_entry("first");
        log.finalize_open_entry();
        log.update_open_entry("second");
        assert_eq!(log.len(), 2);
        assert!(log.has_open_entry());
        assert_eq!(log.entries()[1].text, "second");
    }

    #[test]
    fn test_timestamps_monotonic_in_entry_order() {
        let mut log = TranscriptLog::new();
        log.append_final(Speaker::Caller, "a");
        log.update_open_entry("b");
        log.finalize_open_entry();
        log.append_final(Speaker::User, "c");
        let times: Vec<_> = log.entries().iter().map(|e| e.timestamp).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }
}

//! Core subsystems.
//!
//! - `audio`: device capture/playback and the relay between them
//! - `realtime`: the speech-AI WebSocket protocol client
//! - `transcript`: the speaker-tagged call transcript

pub mod audio;
pub mod realtime;
pub mod transcript;

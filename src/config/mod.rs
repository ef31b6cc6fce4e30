//! Environment-driven configuration.
//!
//! Settings load from the process environment with a `.env` file picked up
//! when present. Every knob has a default; only the API key genuinely needs
//! to be provided.

use std::str::FromStr;

use crate::core::audio::{AudioConfig, SAMPLE_RATE};
use crate::core::realtime::config::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MODEL, DEFAULT_REALTIME_URL,
    DEFAULT_TRANSCRIPTION_MODEL, DEFAULT_VOICE,
};
use crate::core::realtime::{RealtimeConfig, TurnDetectionSettings};

/// Top-level settings for the call session subsystem.
#[derive(Debug, Clone)]
pub struct Settings {
    pub realtime: RealtimeConfig,
    pub audio: AudioConfig,
}

impl Settings {
    /// Load settings from the environment, reading `.env` if present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let vad = TurnDetectionSettings::default();
        let realtime = RealtimeConfig {
            url: env_or("REALTIME_URL", DEFAULT_REALTIME_URL),
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: env_or("REALTIME_MODEL", DEFAULT_MODEL),
            voice: env_or("REALTIME_VOICE", DEFAULT_VOICE),
            transcription_model: env_or("TRANSCRIPTION_MODEL", DEFAULT_TRANSCRIPTION_MODEL),
            turn_detection: TurnDetectionSettings {
                threshold: env_parse("VAD_THRESHOLD", vad.threshold),
                prefix_padding_ms: env_parse("VAD_PREFIX_PADDING_MS", vad.prefix_padding_ms),
                silence_duration_ms: env_parse("VAD_SILENCE_DURATION_MS", vad.silence_duration_ms),
            },
            connect_timeout_secs: env_parse(
                "REALTIME_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            ),
        };

        if realtime.api_key.is_empty() {
            tracing::warn!("OPENAI_API_KEY is not set; realtime connects will be refused");
        }

        let defaults = AudioConfig::default();
        let audio = AudioConfig {
            sample_rate: SAMPLE_RATE,
            buffer_multiple: env_parse("AUDIO_BUFFER_MULTIPLE", defaults.buffer_multiple),
            capture_queue_frames: env_parse("CAPTURE_QUEUE_FRAMES", defaults.capture_queue_frames),
        };

        Self { realtime, audio }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Unparseable setting, using default");
            default
        }),
        Err(_) => default,
    }
}

//! Realtime session configuration.
//!
//! Carries everything needed to open a session against the speech-AI
//! endpoint: endpoint URL, bearer credential, model/voice selection and the
//! server-VAD turn detection parameters. Loaded from the environment by
//! [`crate::config::Settings`]; the URL is overridable so tests can point the
//! client at an in-process mock endpoint.

use serde::{Deserialize, Serialize};

use super::messages::{InputAudioTranscription, SessionConfig, TurnDetection};

/// Default realtime endpoint.
pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Default realtime model.
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";

/// Default agent voice.
pub const DEFAULT_VOICE: &str = "alloy";

/// Default transcription model for caller speech.
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Wire audio format for both directions.
pub const AUDIO_FORMAT: &str = "pcm16";

/// Default connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Server-VAD turn detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetectionSettings {
    /// Activation threshold (0.0 to 1.0)
    pub threshold: f32,
    /// Audio included before detected speech (ms)
    pub prefix_padding_ms: u32,
    /// Silence duration that ends a turn (ms)
    pub silence_duration_ms: u32,
}

impl Default for TurnDetectionSettings {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

/// Configuration for the realtime protocol client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Endpoint URL (without the model query parameter)
    pub url: String,

    /// Bearer credential
    pub api_key: String,

    /// Model to use
    pub model: String,

    /// Voice for agent audio output
    pub voice: String,

    /// Transcription model for caller speech
    pub transcription_model: String,

    /// Server-VAD parameters
    pub turn_detection: TurnDetectionSettings,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            turn_detection: TurnDetectionSettings::default(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl RealtimeConfig {
    /// Build the WebSocket URL with the model query parameter. Parsing
    /// through [`url::Url`] normalizes a bare-host endpoint to a `/` path,
    /// which the handshake request requires.
    pub fn ws_url(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(mut parsed) => {
                parsed.set_query(Some(&format!("model={}", self.model)));
                parsed.to_string()
            }
            Err(_) => format!("{}?model={}", self.url, self.model),
        }
    }

    /// Build the session configuration sent immediately after the socket
    /// opens: text+audio modalities, pcm16 in/out, caller transcription and
    /// server-driven turn detection.
    pub fn build_session_config(&self, instructions: &str) -> SessionConfig {
        SessionConfig {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            instructions: Some(instructions.to_string()),
            voice: Some(self.voice.clone()),
            input_audio_format: Some(AUDIO_FORMAT.to_string()),
            output_audio_format: Some(AUDIO_FORMAT.to_string()),
            input_audio_transcription: Some(InputAudioTranscription {
                model: self.transcription_model.clone(),
            }),
            turn_detection: Some(TurnDetection::ServerVad {
                threshold: Some(self.turn_detection.threshold),
                prefix_padding_ms: Some(self.turn_detection.prefix_padding_ms),
                silence_duration_ms: Some(self.turn_detection.silence_duration_ms),
            }),
        }
    }
}

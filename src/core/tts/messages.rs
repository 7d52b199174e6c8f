//! Synthesis provider wire messages.
//!
//! Outbound frames carry text (with optional flush and voice settings);
//! inbound frames carry base64 audio, optional per-character alignment,
//! and an `isFinal` end-of-generation marker.

use serde::{Deserialize, Serialize};

use crate::errors::TtsError;

/// Voice rendering parameters sent with the first frame of a stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.75,
            speed: None,
        }
    }
}

/// Outbound text frame.
#[derive(Debug, Clone, Serialize)]
pub struct TextFrame {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_settings: Option<VoiceSettings>,
}

impl TextFrame {
    /// Stream-opening frame; a single space primes the connection and
    /// carries the voice settings.
    pub fn begin(voice_settings: VoiceSettings) -> Self {
        Self {
            text: " ".to_string(),
            flush: None,
            voice_settings: Some(voice_settings),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            flush: None,
            voice_settings: None,
        }
    }

    /// Force generation of everything buffered so far.
    pub fn flush() -> Self {
        Self {
            text: String::new(),
            flush: Some(true),
            voice_settings: None,
        }
    }

    /// End-of-stream marker.
    pub fn end() -> Self {
        Self {
            text: String::new(),
            flush: None,
            voice_settings: None,
        }
    }

    pub fn to_json(&self) -> Result<String, TtsError> {
        serde_json::to_string(self).map_err(|e| TtsError::NetworkError(e.to_string()))
    }
}

/// Inbound synthesis frame.
#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisMessage {
    /// Base64 audio chunk in the negotiated output format
    #[serde(default)]
    pub audio: Option<String>,

    #[serde(default)]
    pub alignment: Option<WireAlignment>,

    #[serde(rename = "isFinal", default)]
    pub is_final: Option<bool>,

    #[serde(default)]
    pub error: Option<String>,
}

/// Per-character timing block as the provider ships it.
#[derive(Debug, Clone, Deserialize)]
pub struct WireAlignment {
    pub chars: Vec<String>,
    #[serde(rename = "charStartTimesMs")]
    pub char_start_times_ms: Vec<u64>,
    #[serde(rename = "charDurationsMs")]
    pub char_durations_ms: Vec<u64>,
}

impl SynthesisMessage {
    pub fn parse(text: &str) -> Result<Self, TtsError> {
        serde_json::from_str(text).map_err(|e| TtsError::ProtocolError(e.to_string()))
    }
}

//! Recognition provider wire messages and their normalization.
//!
//! The provider emits two payload shapes on the same socket: a results
//! envelope carrying interim/final transcripts, and turn-lifecycle events
//! when the configured model performs native end-of-turn detection. Both
//! are normalized into one canonical [`TranscriptEvent`].

use serde::{Deserialize, Serialize};

use crate::errors::SttError;

/// Canonical transcript event consumed by the turn arbiter.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub text: String,
    pub is_final: bool,
    pub confidence: Option<f32>,
}

/// What a transcript event signifies for turn-taking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptKind {
    /// Interim hypothesis, may be revised
    Partial,
    /// Finalized segment text
    Final,
    /// Provider detected the caller starting to speak
    TurnStarted,
    /// Provider revised the in-progress turn transcript
    TurnUpdate,
    /// Provider believes the turn may have ended (speculation window)
    TurnMaybeEnded,
    /// Provider walked back a maybe-end; the caller kept speaking
    TurnResumed,
    /// Provider confirmed the turn ended
    TurnEnded,
}

impl TranscriptEvent {
    pub fn is_turn_lifecycle(&self) -> bool {
        !matches!(self.kind, TranscriptKind::Partial | TranscriptKind::Final)
    }
}

// =============================================================================
// Provider wire shapes
// =============================================================================

/// Raw provider message, dispatched on its `type` field.
#[derive(Debug, Clone)]
pub enum RecognizerMessage {
    Results(ResultsEnvelope),
    Turn(TurnInfo),
    Error(RecognizerError),
    /// Metadata, keepalive acks and anything else we do not act on
    Unknown(String),
}

/// Results-envelope transcript payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultsEnvelope {
    pub channel: ResultsChannel,
    #[serde(default)]
    pub is_final: bool,
    /// Endpointing signal: the provider heard a pause after this segment
    #[serde(default)]
    pub speech_final: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultsChannel {
    pub alternatives: Vec<ResultsAlternative>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultsAlternative {
    pub transcript: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// Turn-lifecycle payload from models with native turn detection.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnInfo {
    pub event: String,
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub end_of_turn_confidence: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognizerError {
    #[serde(default)]
    pub code: Option<String>,
    pub description: String,
}

/// Frame the client sends to end the stream gracefully.
#[derive(Debug, Serialize)]
pub struct CloseStreamMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
}

impl Default for CloseStreamMessage {
    fn default() -> Self {
        Self {
            message_type: "CloseStream",
        }
    }
}

impl RecognizerMessage {
    /// Parse a provider text frame.
    pub fn parse(text: &str) -> Result<Self, SttError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| SttError::ProtocolError(e.to_string()))?;

        let message_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();

        match message_type.as_str() {
            "Results" => serde_json::from_value(value)
                .map(RecognizerMessage::Results)
                .map_err(|e| SttError::ProtocolError(e.to_string())),
            "TurnInfo" => serde_json::from_value(value)
                .map(RecognizerMessage::Turn)
                .map_err(|e| SttError::ProtocolError(e.to_string())),
            "Error" => serde_json::from_value(value)
                .map(RecognizerMessage::Error)
                .map_err(|e| SttError::ProtocolError(e.to_string())),
            _ => Ok(RecognizerMessage::Unknown(message_type)),
        }
    }

    /// Normalize into the canonical event the arbiter consumes.
    ///
    /// Returns `None` for messages with no turn-taking significance
    /// (empty interim transcripts, metadata).
    pub fn normalize(self) -> Option<TranscriptEvent> {
        match self {
            RecognizerMessage::Results(envelope) => {
                let alternative = envelope.channel.alternatives.into_iter().next()?;
                if alternative.transcript.is_empty() && !envelope.is_final {
                    return None;
                }
                Some(TranscriptEvent {
                    kind: if envelope.is_final {
                        TranscriptKind::Final
                    } else {
                        TranscriptKind::Partial
                    },
                    text: alternative.transcript,
                    is_final: envelope.is_final,
                    confidence: alternative.confidence,
                })
            }
            RecognizerMessage::Turn(turn) => {
                let kind = match turn.event.as_str() {
                    "StartOfTurn" => TranscriptKind::TurnStarted,
                    "Update" => TranscriptKind::TurnUpdate,
                    "EagerEndOfTurn" => TranscriptKind::TurnMaybeEnded,
                    "TurnResumed" => TranscriptKind::TurnResumed,
                    "EndOfTurn" => TranscriptKind::TurnEnded,
                    _ => return None,
                };
                Some(TranscriptEvent {
                    is_final: kind == TranscriptKind::TurnEnded,
                    text: turn.transcript,
                    confidence: turn.end_of_turn_confidence,
                    kind,
                })
            }
            RecognizerMessage::Error(_) | RecognizerMessage::Unknown(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_results_envelope() {
        let msg = RecognizerMessage::parse(
            r#"{"type":"Results","is_final":true,"speech_final":true,
                "channel":{"alternatives":[{"transcript":"hello there","confidence":0.97}]}}"#,
        )
        .unwrap();

        let event = msg.normalize().unwrap();
        assert_eq!(event.kind, TranscriptKind::Final);
        assert_eq!(event.text, "hello there");
        assert!(event.is_final);
        assert!(event.confidence.unwrap() > 0.9);
    }

    #[test]
    fn test_empty_interim_is_skipped() {
        let msg = RecognizerMessage::parse(
            r#"{"type":"Results","is_final":false,
                "channel":{"alternatives":[{"transcript":""}]}}"#,
        )
        .unwrap();
        assert!(msg.normalize().is_none());
    }

    #[test]
    fn test_turn_lifecycle_mapping() {
        for (wire, kind) in [
            ("StartOfTurn", TranscriptKind::TurnStarted),
            ("Update", TranscriptKind::TurnUpdate),
            ("EagerEndOfTurn", TranscriptKind::TurnMaybeEnded),
            ("TurnResumed", TranscriptKind::TurnResumed),
            ("EndOfTurn", TranscriptKind::TurnEnded),
        ] {
            let json = format!(
                r#"{{"type":"TurnInfo","event":"{wire}","transcript":"so anyway","end_of_turn_confidence":0.8}}"#
            );
            let event = RecognizerMessage::parse(&json).unwrap().normalize().unwrap();
            assert_eq!(event.kind, kind, "wire event {wire}");
            assert_eq!(event.text, "so anyway");
            assert!(event.is_turn_lifecycle());
        }
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let msg = RecognizerMessage::parse(r#"{"type":"Metadata","request_id":"abc"}"#).unwrap();
        assert!(matches!(msg, RecognizerMessage::Unknown(_)));
        assert!(msg.normalize().is_none());
    }

    #[test]
    fn test_unparseable_message_is_protocol_error() {
        let err = RecognizerMessage::parse("pcm garbage").unwrap_err();
        assert!(matches!(err, SttError::ProtocolError(_)));
    }
}

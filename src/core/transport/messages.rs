//! Telephony media-stream wire messages.
//!
//! The telephony bridge speaks JSON control frames over a WebSocket. All
//! inbound frames carry an `event` discriminator; outbound `media` frames
//! carry only the raw companded payload, base64-encoded, with no container
//! header.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::TransportError;

/// Inbound frames from the telephony bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundFrame {
    /// First frame after the socket opens
    Connected {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },

    /// Stream metadata; carries call identity and custom parameters
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMeta,
    },

    /// One companded audio frame
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaPayload,
    },

    /// Graceful end of the stream
    Stop {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },

    /// Playback-boundary acknowledgment for a previously sent mark
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },

    /// Keypad digit pressed by the caller
    Dtmf {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        dtmf: DtmfPayload,
    },
}

/// Metadata block of a `start` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct StartMeta {
    #[serde(rename = "callSid")]
    pub call_sid: String,

    #[serde(rename = "accountSid", default)]
    pub account_sid: Option<String>,

    /// Caller-supplied parameters; carries persona and user identifiers
    #[serde(rename = "customParameters", default)]
    pub custom_parameters: HashMap<String, String>,

    #[serde(rename = "mediaFormat", default)]
    pub media_format: Option<MediaFormat>,
}

/// Audio format advertised in the `start` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaFormat {
    pub encoding: String,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    pub channels: u32,
}

/// Payload of an inbound `media` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    /// Base64 companded 8kHz mono audio
    pub payload: String,

    #[serde(default)]
    pub track: Option<String>,

    /// Millisecond timestamp relative to stream start
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DtmfPayload {
    pub digit: String,
    #[serde(default)]
    pub track: Option<String>,
}

/// Outbound frames to the telephony bridge.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundFrame {
    /// Raw companded audio, base64-encoded, no container header
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },

    /// Named playback boundary; echoed back as an inbound `mark`
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload2,
    },

    /// Discard any audio the bridge has queued but not yet played
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkPayload2 {
    pub name: String,
}

impl InboundFrame {
    /// Parse a text frame off the telephony socket.
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| TransportError::MalformedFrame(e.to_string()))
    }
}

impl OutboundFrame {
    /// Build an outbound media frame from already-companded audio.
    pub fn media(stream_sid: &str, companded: &[u8]) -> Self {
        use base64::Engine as _;
        OutboundFrame::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia {
                payload: base64::engine::general_purpose::STANDARD.encode(companded),
            },
        }
    }

    pub fn mark(stream_sid: &str, name: &str) -> Self {
        OutboundFrame::Mark {
            stream_sid: stream_sid.to_string(),
            mark: MarkPayload2 {
                name: name.to_string(),
            },
        }
    }

    pub fn clear(stream_sid: &str) -> Self {
        OutboundFrame::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Decode the base64 payload of an inbound media frame.
pub fn decode_media_payload(payload: &str) -> Result<Vec<u8>, TransportError> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| TransportError::InvalidPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connected_frame() {
        let frame =
            InboundFrame::parse(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#)
                .unwrap();
        assert!(matches!(frame, InboundFrame::Connected { .. }));
    }

    #[test]
    fn test_parse_start_frame_with_custom_parameters() {
        let json = r#"{
            "event": "start",
            "streamSid": "MZ123",
            "start": {
                "callSid": "CA456",
                "accountSid": "AC789",
                "customParameters": {"personaId": "poet", "userId": "u-1"},
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            }
        }"#;
        let frame = InboundFrame::parse(json).unwrap();
        match frame {
            InboundFrame::Start { stream_sid, start } => {
                assert_eq!(stream_sid, "MZ123");
                assert_eq!(start.call_sid, "CA456");
                assert_eq!(
                    start.custom_parameters.get("personaId").map(String::as_str),
                    Some("poet")
                );
                let fmt = start.media_format.unwrap();
                assert_eq!(fmt.sample_rate, 8000);
            }
            other => panic!("expected start frame, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_media_frame_and_decode_payload() {
        let json = r#"{
            "event": "media",
            "streamSid": "MZ123",
            "media": {"track": "inbound", "timestamp": "5", "payload": "AAEC"}
        }"#;
        let frame = InboundFrame::parse(json).unwrap();
        match frame {
            InboundFrame::Media { media, .. } => {
                let bytes = decode_media_payload(&media.payload).unwrap();
                assert_eq!(bytes, vec![0u8, 1, 2]);
            }
            other => panic!("expected media frame, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_malformed_frame() {
        let err = InboundFrame::parse("not json").unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame(_)));

        let err = InboundFrame::parse(r#"{"event":"teleport"}"#).unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame(_)));
    }

    #[test]
    fn test_outbound_media_is_bare_payload() {
        let frame = OutboundFrame::media("MZ123", &[0x7f, 0xff]);
        let json = frame.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event"], "media");
        assert_eq!(value["streamSid"], "MZ123");
        // Raw base64 of the companded bytes, nothing else
        assert_eq!(value["media"]["payload"], "f/8=");
        assert!(value["media"].get("track").is_none());
    }

    #[test]
    fn test_outbound_clear_frame() {
        let json = OutboundFrame::clear("MZ123").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event"], "clear");
        assert_eq!(value["streamSid"], "MZ123");
    }

    #[test]
    fn test_decode_invalid_payload() {
        let err = decode_media_payload("@@@").unwrap_err();
        assert!(matches!(err, TransportError::InvalidPayload(_)));
    }
}

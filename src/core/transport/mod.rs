//! Telephony media-stream transport adapter.
//!
//! Speaks the inbound/outbound media-stream wire protocol (JSON control
//! frames over WebSocket) and the G.711 mu-law companding the bridge uses.

pub mod codec;
pub mod messages;

pub use codec::{decode_to_pcm16le, encode_pcm16le, linear_to_ulaw, ulaw_to_linear};
pub use messages::{
    DtmfPayload, InboundFrame, MarkPayload, MediaFormat, MediaPayload, OutboundFrame, StartMeta,
    decode_media_payload,
};

/// Samples per second on the telephony leg. One byte per sample in mu-law.
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

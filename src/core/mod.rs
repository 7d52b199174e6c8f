//! Streaming provider clients and the telephony transport.

pub mod llm;
pub mod stt;
pub mod transport;
pub mod tts;

//! Streaming synthesis client, wire messages, and alignment tracking.

pub mod alignment;
pub mod client;
pub mod messages;

pub use alignment::{AlignmentTrace, AlignmentUnit};
pub use client::{SynthesisClient, SynthesisEvent, SynthesisHandle, TtsConfig};
pub use messages::{SynthesisMessage, TextFrame, VoiceSettings};

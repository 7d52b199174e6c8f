//! Transcription stream client and canonical transcript events.

pub mod client;
pub mod messages;

pub use client::{SttConfig, SttStreamEvent, TranscriptionStream};
pub use messages::{RecognizerMessage, TranscriptEvent, TranscriptKind};

//! Inference provider client, prompt assembly, and response generation.

pub mod client;
pub mod generator;
pub mod prompt;

pub use client::{ChatClient, ChatMessage, Completion, LlmConfig, TokenUsage};
pub use generator::{
    APOLOGY_UTTERANCE, GeneratedResponse, GenerationLimits, ResponseGenerator, SpeculativeDraft,
};
pub use prompt::{PromptBuilder, PromptContext, StageDirectionPolicy};

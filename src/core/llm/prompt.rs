//! Layered prompt assembly and spoken-text sanitization.
//!
//! The system prompt is built in fixed layers: persona instructions,
//! call scenario, relationship context, long-term caller facts, then
//! output-format directives. Stage directions are stripped from
//! generated text before it reaches synthesis, since bracketed cues
//! would otherwise be read aloud verbatim.

use once_cell::sync::Lazy;
use regex::Regex;

use super::client::ChatMessage;

/// Directives appended as the last prompt layer. Spoken output has to
/// stay short and free of written-style markup.
const OUTPUT_DIRECTIVES: &str = "You are speaking on a live phone call. Keep replies brief and \
conversational, one to three sentences. Speak plainly. Never include stage directions, \
bracketed cues, emotes, or any text that is not meant to be said aloud.";

/// Context layers for one call, resolved from the collaborator stores
/// at session start.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub persona_instructions: String,
    pub scenario: Option<String>,
    pub relationship: Option<String>,
    pub facts: Vec<String>,
}

/// Assembles provider message lists from context, bounded history, and
/// the new caller turn.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    /// Most recent turns kept in the window, counted in messages
    history_window: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self { history_window: 20 }
    }
}

impl PromptBuilder {
    pub fn new(history_window: usize) -> Self {
        Self { history_window }
    }

    /// System prompt from the context layers, in fixed order. Empty
    /// layers are omitted entirely.
    pub fn system_prompt(&self, context: &PromptContext) -> String {
        let mut sections = Vec::new();
        if !context.persona_instructions.is_empty() {
            sections.push(context.persona_instructions.clone());
        }
        if let Some(scenario) = context.scenario.as_ref().filter(|s| !s.is_empty()) {
            sections.push(format!("Call context: {scenario}"));
        }
        if let Some(relationship) = context.relationship.as_ref().filter(|s| !s.is_empty()) {
            sections.push(format!("Your relationship with this caller: {relationship}"));
        }
        if !context.facts.is_empty() {
            let mut block = String::from("Known facts about this caller:");
            for fact in &context.facts {
                block.push_str("\n- ");
                block.push_str(fact);
            }
            sections.push(block);
        }
        sections.push(OUTPUT_DIRECTIVES.to_string());
        sections.join("\n\n")
    }

    /// Full message list: system prompt, trailing history window, then
    /// the confirmed caller turn.
    pub fn build(
        &self,
        context: &PromptContext,
        history: &[ChatMessage],
        caller_turn: &str,
    ) -> Vec<ChatMessage> {
        let window_start = history.len().saturating_sub(self.history_window);
        let mut messages = Vec::with_capacity(history.len() - window_start + 2);
        messages.push(ChatMessage::system(self.system_prompt(context)));
        messages.extend_from_slice(&history[window_start..]);
        messages.push(ChatMessage::user(caller_turn));
        messages
    }
}

static DEFAULT_STAGE_DIRECTIONS: Lazy<Vec<Regex>> = Lazy::new(|| {
    // Compile-checked in tests; literals here never fail to parse
    [r"\[[^\]]*\]", r"\([^)]*\)", r"\*[^*]*\*"]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
});

static REPEATED_SPACES: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\s{2,}").ok());

/// Configurable pattern policy for scrubbing non-spoken tokens.
#[derive(Debug, Clone)]
pub struct StageDirectionPolicy {
    patterns: Vec<Regex>,
}

impl Default for StageDirectionPolicy {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_STAGE_DIRECTIONS.clone(),
        }
    }
}

impl StageDirectionPolicy {
    /// Build from user-supplied patterns; invalid patterns are rejected.
    pub fn from_patterns(patterns: &[String]) -> Result<Self, regex::Error> {
        let compiled = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns: compiled })
    }

    /// Remove every stage-direction match and normalize the leftover
    /// whitespace.
    pub fn strip(&self, text: &str) -> String {
        let mut out = text.to_string();
        for pattern in &self.patterns {
            out = pattern.replace_all(&out, "").into_owned();
        }
        if let Some(spaces) = REPEATED_SPACES.as_ref() {
            out = spaces.replace_all(&out, " ").into_owned();
        }
        out.trim().to_string()
    }
}

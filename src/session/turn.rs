//! Conversation turns and per-call history.

use crate::core::llm::ChatMessage;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    Caller,
    Assistant,
}

/// How an assistant turn ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompletionStatus {
    Completed,
    /// Cut off by caller speech; fraction of the response actually heard
    Interrupted { heard_fraction: f32 },
}

/// One turn of the conversation.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: TurnRole,
    /// What was actually said or heard on the call
    pub text: String,
    /// Full intended text when an assistant turn was interrupted
    pub full_text: Option<String>,
    pub status: CompletionStatus,
}

impl Turn {
    pub fn caller(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Caller,
            text: text.into(),
            full_text: None,
            status: CompletionStatus::Completed,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
            full_text: None,
            status: CompletionStatus::Completed,
        }
    }

    /// Interrupted assistant turn. `heard_text` is the prefix the caller
    /// heard; the full intended text is kept for conversational
    /// continuity.
    pub fn interrupted(
        heard_text: impl Into<String>,
        full_text: impl Into<String>,
        heard_fraction: f32,
    ) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: heard_text.into(),
            full_text: Some(full_text.into()),
            status: CompletionStatus::Interrupted { heard_fraction },
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self.status, CompletionStatus::Interrupted { .. })
    }
}

/// Ordered turn history for one call.
#[derive(Debug, Clone, Default)]
pub struct TurnHistory {
    turns: Vec<Turn>,
}

impl TurnHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// History as provider chat messages. Interrupted turns carry their
    /// full intended text so the model knows what it was going to say.
    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .map(|turn| {
                let content = turn.full_text.as_deref().unwrap_or(&turn.text);
                match turn.role {
                    TurnRole::Caller => ChatMessage::user(content),
                    TurnRole::Assistant => ChatMessage::assistant(content),
                }
            })
            .collect()
    }

    /// Plain-text transcript for the call record. Interrupted turns show
    /// what was actually heard.
    pub fn transcript_text(&self) -> String {
        self.turns
            .iter()
            .map(|turn| {
                let speaker = match turn.role {
                    TurnRole::Caller => "Caller",
                    TurnRole::Assistant => "Assistant",
                };
                if turn.is_interrupted() {
                    format!("{speaker} (interrupted): {}", turn.text)
                } else {
                    format!("{speaker}: {}", turn.text)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_to_chat_messages_uses_full_text() {
        let mut history = TurnHistory::new();
        history.push(Turn::caller("hi"));
        history.push(Turn::interrupted("Well, I was", "Well, I was going to say more.", 0.4));

        let messages = history.to_chat_messages();
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "Well, I was going to say more.");
    }

    #[test]
    fn test_transcript_marks_interruptions() {
        let mut history = TurnHistory::new();
        history.push(Turn::caller("hi"));
        history.push(Turn::interrupted("Well", "Well then.", 0.5));

        let transcript = history.transcript_text();
        assert!(transcript.contains("Caller: hi"));
        assert!(transcript.contains("Assistant (interrupted): Well"));
        assert!(!transcript.contains("Well then."));
    }
}

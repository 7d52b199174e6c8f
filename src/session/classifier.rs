//! Model-based turn-completion classifier.
//!
//! Consulted only when the lexical heuristic is unclear. Runs under a
//! strict budget; a timeout or provider error falls back to responding,
//! since dead air is worse than an early reply.

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::llm::{ChatClient, ChatMessage};
use crate::session::heuristic::TurnDecision;

const CLASSIFIER_PROMPT: &str = "You judge whether a phone caller has finished their thought. \
Given the caller's words so far, answer with exactly one word: RESPOND if the utterance is \
complete and the assistant should reply now, or WAIT if the caller seems likely to continue \
speaking.";

/// Turn classifier over the shared chat-completion client.
#[derive(Clone)]
pub struct TurnClassifier {
    client: ChatClient,
    budget: Duration,
}

impl TurnClassifier {
    pub fn new(client: ChatClient, budget: Duration) -> Self {
        Self { client, budget }
    }

    /// Classify an unclear transcript. Never returns `Unclear`.
    pub async fn classify(&self, transcript: &str) -> TurnDecision {
        let messages = [
            ChatMessage::system(CLASSIFIER_PROMPT),
            ChatMessage::user(transcript),
        ];

        match timeout(self.budget, self.client.complete(&messages, 4, 0.0)).await {
            Ok(Ok(completion)) => {
                let answer = completion.text.trim().to_uppercase();
                debug!(%answer, "Turn classifier answered");
                if answer.contains("WAIT") {
                    TurnDecision::Wait
                } else {
                    TurnDecision::Respond
                }
            }
            Ok(Err(e)) => {
                warn!("Turn classifier failed, defaulting to respond: {e}");
                TurnDecision::Respond
            }
            Err(_elapsed) => {
                warn!(
                    budget_ms = self.budget.as_millis() as u64,
                    "Turn classifier timed out, defaulting to respond"
                );
                TurnDecision::Respond
            }
        }
    }
}

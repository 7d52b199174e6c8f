//! Response generation with a hard budget and speculative execution.
//!
//! The generator never surfaces provider failures to the caller: a
//! timeout or error degrades to a fixed spoken apology. Speculative
//! drafts are generated against a transcript snapshot and are usable
//! only when the confirmed transcript matches that snapshot exactly.

use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::{ChatClient, ChatMessage, TokenUsage};
use super::prompt::{PromptBuilder, PromptContext, StageDirectionPolicy};
use crate::errors::GenerationError;

/// Hard budget for one completion round trip.
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Spoken in place of any generation failure. Raw error text never
/// reaches the caller, and neither does silence past the budget.
pub const APOLOGY_UTTERANCE: &str =
    "I'm sorry, I didn't quite catch that. Could you say it one more time?";

/// Persona-configured completion limits.
#[derive(Debug, Clone, Copy)]
pub struct GenerationLimits {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
        }
    }
}

/// One response ready for synthesis.
#[derive(Debug, Clone)]
pub struct GeneratedResponse {
    /// Sanitized spoken text
    pub text: String,
    pub usage: TokenUsage,
    /// True when this is the apology fallback rather than model output
    pub degraded: bool,
}

impl GeneratedResponse {
    fn apology() -> Self {
        Self {
            text: APOLOGY_UTTERANCE.to_string(),
            usage: TokenUsage::default(),
            degraded: true,
        }
    }
}

/// A pre-computed candidate response tied to the transcript it was
/// generated from.
pub struct SpeculativeDraft {
    snapshot: String,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<Result<GeneratedResponse, GenerationError>>,
}

impl SpeculativeDraft {
    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    /// Byte-identical comparison against the confirmed transcript.
    pub fn matches(&self, confirmed: &str) -> bool {
        self.snapshot == confirmed
    }

    /// Abandon the draft. Safe at any point in the job's lifetime.
    pub fn cancel(self) {
        self.cancel.cancel();
        self.task.abort();
    }

    /// Wait for the draft to finish and take its response.
    pub async fn resolve(self) -> Result<GeneratedResponse, GenerationError> {
        match self.task.await {
            Ok(result) => result,
            Err(_join) => Err(GenerationError::Cancelled),
        }
    }
}

/// Builds prompts, calls the inference provider, and degrades failures
/// to the apology utterance.
#[derive(Clone)]
pub struct ResponseGenerator {
    client: ChatClient,
    builder: PromptBuilder,
    policy: StageDirectionPolicy,
    budget: Duration,
}

impl ResponseGenerator {
    pub fn new(client: ChatClient, policy: StageDirectionPolicy) -> Self {
        Self {
            client,
            builder: PromptBuilder::default(),
            policy,
            budget: GENERATION_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Confirmed-turn generation. Always yields something speakable.
    pub async fn generate(
        &self,
        context: &PromptContext,
        history: &[ChatMessage],
        caller_turn: &str,
        limits: GenerationLimits,
    ) -> GeneratedResponse {
        let messages = self.builder.build(context, history, caller_turn);
        match timeout(
            self.budget,
            self.client
                .complete(&messages, limits.max_tokens, limits.temperature),
        )
        .await
        {
            Ok(Ok(completion)) => {
                let text = self.policy.strip(&completion.text);
                if text.is_empty() {
                    // Everything the model produced was stage direction
                    warn!("Completion was empty after sanitization");
                    return GeneratedResponse::apology();
                }
                GeneratedResponse {
                    text,
                    usage: completion.usage,
                    degraded: false,
                }
            }
            Ok(Err(e)) => {
                warn!("Generation failed, degrading to apology: {e}");
                GeneratedResponse::apology()
            }
            Err(_elapsed) => {
                warn!(
                    budget_ms = self.budget.as_millis() as u64,
                    "Generation timed out, degrading to apology"
                );
                GeneratedResponse::apology()
            }
        }
    }

    /// Start a cancellable draft against the current transcript snapshot.
    pub fn generate_speculative(
        &self,
        context: &PromptContext,
        history: &[ChatMessage],
        snapshot: &str,
        limits: GenerationLimits,
    ) -> SpeculativeDraft {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let generator = self.clone();
        let context = context.clone();
        let history = history.to_vec();
        let snapshot_text = snapshot.to_string();
        let job_snapshot = snapshot_text.clone();

        debug!(chars = snapshot_text.len(), "Starting speculative draft");
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Err(GenerationError::Cancelled),
                response = generator.generate(&context, &history, &job_snapshot, limits) => {
                    Ok(response)
                }
            }
        });

        SpeculativeDraft {
            snapshot: snapshot_text,
            cancel,
            task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::client::LlmConfig;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn generator_for(server: &MockServer) -> ResponseGenerator {
        let client = ChatClient::new(
            reqwest::Client::new(),
            LlmConfig {
                api_key: "key".to_string(),
                endpoint: format!("{}/v1/chat/completions", server.uri()),
                model: "test-model".to_string(),
            },
        )
        .unwrap();
        ResponseGenerator::new(client, StageDirectionPolicy::default())
    }

    fn completion_body(text: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": text}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        })
    }

    #[tokio::test]
    async fn test_generate_strips_stage_directions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion_body("[warmly] Hi there!")),
            )
            .mount(&server)
            .await;

        let response = generator_for(&server)
            .generate(
                &PromptContext::default(),
                &[],
                "hello",
                GenerationLimits::default(),
            )
            .await;
        assert_eq!(response.text, "Hi there!");
        assert!(!response.degraded);
        assert_eq!(response.usage.completion_tokens, 5);
    }

    #[tokio::test]
    async fn test_provider_error_degrades_to_apology() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let response = generator_for(&server)
            .generate(
                &PromptContext::default(),
                &[],
                "hello",
                GenerationLimits::default(),
            )
            .await;
        assert_eq!(response.text, APOLOGY_UTTERANCE);
        assert!(response.degraded);
        assert_eq!(response.usage.total(), 0);
    }

    #[tokio::test]
    async fn test_timeout_degrades_to_apology() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body("too late"))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let response = generator_for(&server)
            .with_budget(Duration::from_millis(50))
            .generate(
                &PromptContext::default(),
                &[],
                "hello",
                GenerationLimits::default(),
            )
            .await;
        assert!(response.degraded);
    }

    #[tokio::test]
    async fn test_speculative_draft_resolves_and_matches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("Drafted.")))
            .mount(&server)
            .await;

        let draft = generator_for(&server).generate_speculative(
            &PromptContext::default(),
            &[],
            "how are you",
            GenerationLimits::default(),
        );
        assert!(draft.matches("how are you"));
        assert!(!draft.matches("how are you today"));

        let response = draft.resolve().await.unwrap();
        assert_eq!(response.text, "Drafted.");
    }

    #[tokio::test]
    async fn test_cancelled_draft_never_resolves() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body("slow"))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let generator = generator_for(&server);
        let draft = generator.generate_speculative(
            &PromptContext::default(),
            &[],
            "um so",
            GenerationLimits::default(),
        );
        draft.cancel();

        let second = generator.generate_speculative(
            &PromptContext::default(),
            &[],
            "um so",
            GenerationLimits::default(),
        );
        second.cancel.cancel();
        assert!(matches!(
            second.resolve().await,
            Err(GenerationError::Cancelled)
        ));
    }
}

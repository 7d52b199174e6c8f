//! End-to-end turn-taking and metering scenarios over the library API.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use parlance::collab::StaticPricingSource;
use parlance::config::{Price, PricingTable, PricingUnit};
use parlance::core::llm::{
    ChatClient, GenerationLimits, LlmConfig, PromptContext, ResponseGenerator,
    StageDirectionPolicy, TokenUsage,
};
use parlance::core::stt::{TranscriptEvent, TranscriptKind};
use parlance::core::tts::AlignmentTrace;
use parlance::session::{
    ArbiterAction, ArbiterState, BargeInConfig, BargeInHandler, Turn, TurnArbiter, TurnHistory,
    TurnTakingConfig, UsageMeter,
};

fn event(kind: TranscriptKind, text: &str) -> TranscriptEvent {
    TranscriptEvent {
        kind,
        text: text.to_string(),
        is_final: matches!(kind, TranscriptKind::Final | TranscriptKind::TurnEnded),
        confidence: None,
    }
}

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
        "usage": {"prompt_tokens": 12, "completion_tokens": 7}
    })
}

/// A full exchange where the provider emits turn lifecycle events: the
/// tentative end starts a draft, the resume cancels it, and the final
/// end confirms a response with the latest transcript.
#[test]
fn provider_turn_events_drive_the_exchange() {
    let mut arbiter = TurnArbiter::new(TurnTakingConfig::default());

    arbiter.on_transcript(&event(TranscriptKind::TurnStarted, ""));
    arbiter.on_transcript(&event(TranscriptKind::TurnUpdate, "could you tell me"));

    let action = arbiter.on_transcript(&event(
        TranscriptKind::TurnMaybeEnded,
        "could you tell me about the harbor",
    ));
    assert_eq!(
        action,
        ArbiterAction::StartSpeculative {
            snapshot: "could you tell me about the harbor".to_string()
        }
    );

    // The caller keeps going; the draft must be abandoned
    assert_eq!(
        arbiter.on_transcript(&event(TranscriptKind::TurnResumed, "")),
        ArbiterAction::CancelSpeculative
    );

    let action = arbiter.on_transcript(&event(
        TranscriptKind::TurnEnded,
        "could you tell me about the harbor at night",
    ));
    assert_eq!(
        action,
        ArbiterAction::Respond {
            transcript: "could you tell me about the harbor at night".to_string()
        }
    );

    // Provider events were seen, so silence timers stay quiet forever
    assert_eq!(
        arbiter.on_silence(Duration::from_secs(10)),
        ArbiterAction::None
    );
}

/// A speculative draft is only consumed against the exact snapshot it
/// was generated from; any divergence forces a fresh generation.
#[tokio::test]
async fn speculative_draft_requires_identical_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("The harbor...")))
        .mount(&server)
        .await;

    let generator = generator_for(&server);
    let draft = generator.generate_speculative(
        &PromptContext::default(),
        &[],
        "tell me about the harbor",
        GenerationLimits::default(),
    );

    assert!(draft.matches("tell me about the harbor"));
    assert!(!draft.matches("tell me about the harbor tonight"));
    assert!(!draft.matches("tell me about the Harbor"));

    let response = draft.resolve().await.unwrap();
    assert_eq!(response.text, "The harbor...");
    assert!(!response.degraded);
}

/// Barge-in mid-response: the arbiter flags the interruption, the
/// handler reconstructs the heard prefix, and both the chat history and
/// the transcript reflect it correctly.
#[test]
fn barge_in_reconstructs_the_partial_turn() {
    let mut arbiter = TurnArbiter::new(TurnTakingConfig::default());
    let handler = BargeInHandler::new(BargeInConfig::default());
    let mut history = TurnHistory::new();

    arbiter.on_transcript(&event(TranscriptKind::TurnEnded, "tell me everything"));
    history.push(Turn::caller("tell me everything"));
    arbiter.on_speaking();

    assert_eq!(
        arbiter.on_transcript(&event(TranscriptKind::TurnStarted, "")),
        ArbiterAction::BargeIn
    );
    assert_eq!(arbiter.state(), ArbiterState::Interrupted);

    // 100-char response, alignment says 50ms per char, cut at 2000ms
    let full_text: String = "abcdefghij".repeat(10);
    let mut alignment = AlignmentTrace::new();
    let chars: Vec<String> = full_text.chars().map(|c| c.to_string()).collect();
    let starts: Vec<u64> = (0..100u64).map(|i| i * 50).collect();
    let durations = vec![50u64; 100];
    alignment.extend_from_wire(&chars, &starts, &durations);

    let estimate = handler.estimate(&full_text, &alignment, 2000, None, 0);
    assert_eq!(estimate.chars, 40);

    history.push(handler.interrupted_turn(&full_text, estimate));
    arbiter.resume_listening();
    assert_eq!(arbiter.state(), ArbiterState::Listening);

    // The model sees the full intended text
    let messages = history.to_chat_messages();
    assert_eq!(messages[1].content, full_text);
    // The call record sees only what was heard
    let transcript = history.transcript_text();
    assert!(transcript.contains(&format!(
        "Assistant (interrupted): {}",
        full_text.chars().take(40).collect::<String>()
    )));
}

/// Silence ladder with no provider turn events: a lone discourse marker
/// waits at the evaluation threshold but the force threshold responds.
#[test]
fn silence_ladder_forces_a_response_eventually() {
    let mut arbiter = TurnArbiter::new(TurnTakingConfig::default());
    arbiter.on_transcript(&event(TranscriptKind::Partial, "okay"));

    assert_eq!(
        arbiter.on_silence(Duration::from_millis(1100)),
        ArbiterAction::None
    );
    assert_eq!(
        arbiter.on_silence(Duration::from_millis(2600)),
        ArbiterAction::Respond {
            transcript: "okay".to_string()
        }
    );
}

/// Finalize produces priced events once; re-finalizing (the error path
/// racing the graceful path) returns the cached totals with no new
/// ledger entries. Overridden prices take precedence over defaults.
#[tokio::test]
async fn finalize_is_idempotent_and_respects_price_overrides() {
    let source = Arc::new(StaticPricingSource::default());
    source.set(
        "recognition:streaming",
        Price::new(0.01, PricingUnit::PerMinute),
    );
    let table = PricingTable::new(source);
    table.refresh_if_stale().await;

    let mut meter = UsageMeter::new();
    meter.record_audio_in(960_000); // 2 minutes
    meter.record_synthesis_chars(500);
    meter.record_tokens(TokenUsage {
        prompt_tokens: 2_000_000,
        completion_tokens: 500_000,
    });

    let (breakdown, events) = meter.finalize(&table);
    assert_eq!(events.len(), 4);
    assert!((breakdown.recognition - 0.02).abs() < 1e-9);
    assert!((breakdown.synthesis - 0.12).abs() < 1e-9);
    // 2M prompt at $0.15/1M plus 0.5M completion at $0.60/1M
    assert!((breakdown.inference - 0.60).abs() < 1e-9);
    assert!((breakdown.minutes - 2.0).abs() < 1e-9);

    let (again, no_events) = meter.finalize(&table);
    assert!(no_events.is_empty());
    assert!((again.total - breakdown.total).abs() < f64::EPSILON);
}

/// The apology fallback is speakable text, so a provider outage still
/// produces a metered, synthesizable response.
#[tokio::test]
async fn degraded_generation_still_flows_into_metering() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let response = generator_for(&server)
        .generate(
            &PromptContext::default(),
            &[],
            "hello?",
            GenerationLimits::default(),
        )
        .await;
    assert!(response.degraded);
    assert!(!response.text.is_empty());

    let mut meter = UsageMeter::new();
    meter.record_tokens(response.usage);
    meter.record_synthesis_chars(response.text.chars().count());

    let table = PricingTable::new(Arc::new(StaticPricingSource::default()));
    let (breakdown, events) = meter.finalize(&table);
    // No tokens were billed, but the spoken apology is
    assert_eq!(events.len(), 1);
    assert!(breakdown.synthesis > 0.0);
    assert_eq!(breakdown.inference, 0.0);
}

//! Turn-taking arbitration.
//!
//! The arbiter is a state machine driven entirely by the session loop.
//! Its decision policy is an ordered chain where the first decisive
//! stage wins: native provider turn events, then the lexical heuristic,
//! then the model classifier on unclear transcripts only, then silence
//! timers when the provider sends no turn events at all. The arbiter
//! itself performs no I/O; actions tell the session what to do.

use std::time::Duration;

use tracing::debug;

use crate::core::stt::{TranscriptEvent, TranscriptKind};
use crate::session::heuristic::{self, TurnDecision};

/// Timer thresholds and evaluation limits for the silence fallback.
#[derive(Debug, Clone, Copy)]
pub struct TurnTakingConfig {
    /// Below this silence no evaluation happens
    pub short_pause: Duration,
    /// Silence that triggers a heuristic/classifier evaluation
    pub evaluation_threshold: Duration,
    /// Silence that forces a response regardless of decision
    pub force_response: Duration,
    /// Evaluations allowed per pending turn
    pub max_evaluations: u32,
    /// Budget for one model-classifier call
    pub classifier_timeout: Duration,
}

impl Default for TurnTakingConfig {
    fn default() -> Self {
        Self {
            short_pause: Duration::from_millis(300),
            evaluation_threshold: Duration::from_millis(1000),
            force_response: Duration::from_millis(2500),
            max_evaluations: 3,
            classifier_timeout: Duration::from_millis(500),
        }
    }
}

/// Arbiter states. There is no terminal state; the session loop ends by
/// dropping the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterState {
    Idle,
    Listening,
    Evaluating,
    Processing,
    Speaking,
    Interrupted,
}

/// What the session loop should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbiterAction {
    None,
    /// Start a speculative draft against this transcript snapshot
    StartSpeculative { snapshot: String },
    /// Cancel the in-flight speculative draft
    CancelSpeculative,
    /// The caller's turn is confirmed; generate and speak a response
    Respond { transcript: String },
    /// Run the model classifier on this unclear transcript
    Classify { transcript: String },
    /// Caller speech arrived while speaking; run barge-in handling
    BargeIn,
}

/// Per-call turn-taking state machine.
#[derive(Debug)]
pub struct TurnArbiter {
    config: TurnTakingConfig,
    state: ArbiterState,
    /// Finalized segments of the pending caller turn. A caller who
    /// pauses mid-thought produces several finals per turn; they all
    /// belong to the turn until it is confirmed.
    finalized: String,
    /// In-progress segment, revised by successive partials
    partial: String,
    /// Set once the provider has sent any turn-lifecycle event; silence
    /// timers stay disabled from then on
    provider_turn_events: bool,
    evaluations: u32,
}

impl TurnArbiter {
    pub fn new(config: TurnTakingConfig) -> Self {
        Self {
            config,
            state: ArbiterState::Idle,
            finalized: String::new(),
            partial: String::new(),
            provider_turn_events: false,
            evaluations: 0,
        }
    }

    pub fn state(&self) -> ArbiterState {
        self.state
    }

    pub fn config(&self) -> &TurnTakingConfig {
        &self.config
    }

    /// Everything the caller has said in the pending turn: the
    /// finalized segments followed by the open partial, if any.
    pub fn pending_transcript(&self) -> String {
        if self.finalized.is_empty() {
            self.partial.clone()
        } else if self.partial.is_empty() {
            self.finalized.clone()
        } else {
            format!("{} {}", self.finalized, self.partial)
        }
    }

    fn pending_is_empty(&self) -> bool {
        self.finalized.is_empty() && self.partial.is_empty()
    }

    fn transition(&mut self, next: ArbiterState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Arbiter transition");
            self.state = next;
        }
    }

    /// Feed one canonical transcript event.
    pub fn on_transcript(&mut self, event: &TranscriptEvent) -> ArbiterAction {
        if event.is_turn_lifecycle() {
            self.provider_turn_events = true;
        }

        // Any caller speech over assistant playback is a barge-in
        if self.state == ArbiterState::Speaking && signals_speech(event) {
            self.transition(ArbiterState::Interrupted);
            self.absorb_text(event);
            return ArbiterAction::BargeIn;
        }

        match event.kind {
            TranscriptKind::TurnStarted => {
                self.transition(ArbiterState::Listening);
                self.absorb_text(event);
                ArbiterAction::None
            }
            TranscriptKind::TurnUpdate => {
                self.transition(ArbiterState::Listening);
                self.absorb_text(event);
                ArbiterAction::None
            }
            TranscriptKind::TurnMaybeEnded => {
                self.absorb_text(event);
                if self.pending_is_empty() {
                    ArbiterAction::None
                } else {
                    ArbiterAction::StartSpeculative {
                        snapshot: self.pending_transcript(),
                    }
                }
            }
            TranscriptKind::TurnResumed => {
                self.transition(ArbiterState::Listening);
                ArbiterAction::CancelSpeculative
            }
            TranscriptKind::TurnEnded => {
                self.absorb_text(event);
                self.confirm_turn()
            }
            TranscriptKind::Partial => {
                if !event.text.is_empty() {
                    self.transition(ArbiterState::Listening);
                    self.absorb_text(event);
                }
                ArbiterAction::None
            }
            TranscriptKind::Final => {
                self.transition(ArbiterState::Listening);
                self.absorb_text(event);
                ArbiterAction::None
            }
        }
    }

    /// Silence elapsed since the last caller speech. Only consulted when
    /// the provider sends no turn events.
    pub fn on_silence(&mut self, silence: Duration) -> ArbiterAction {
        if self.provider_turn_events
            || self.pending_is_empty()
            || !matches!(self.state, ArbiterState::Listening | ArbiterState::Evaluating)
        {
            return ArbiterAction::None;
        }

        if silence < self.config.short_pause {
            return ArbiterAction::None;
        }

        if silence >= self.config.force_response {
            debug!("Silence passed the force-response threshold");
            return self.confirm_turn();
        }

        if silence < self.config.evaluation_threshold {
            return ArbiterAction::None;
        }

        if self.evaluations >= self.config.max_evaluations {
            return ArbiterAction::None;
        }
        self.evaluations += 1;
        self.transition(ArbiterState::Evaluating);

        match heuristic::classify(&self.pending_transcript()) {
            TurnDecision::Respond => self.confirm_turn(),
            TurnDecision::Wait => {
                self.transition(ArbiterState::Listening);
                ArbiterAction::None
            }
            TurnDecision::Unclear => ArbiterAction::Classify {
                transcript: self.pending_transcript(),
            },
        }
    }

    /// Outcome of the model classifier (after the session applied the
    /// timeout and its Respond fallback).
    pub fn on_classifier_decision(&mut self, decision: TurnDecision) -> ArbiterAction {
        match decision {
            TurnDecision::Respond => self.confirm_turn(),
            TurnDecision::Wait | TurnDecision::Unclear => {
                self.transition(ArbiterState::Listening);
                ArbiterAction::None
            }
        }
    }

    /// The session began speaking a response.
    pub fn on_speaking(&mut self) {
        self.transition(ArbiterState::Speaking);
    }

    /// Playback of the current response is exhausted.
    pub fn on_playback_exhausted(&mut self) {
        if self.state == ArbiterState::Speaking {
            self.transition(ArbiterState::Listening);
        }
    }

    /// Barge-in handling finished; back to listening with counters
    /// reset.
    pub fn resume_listening(&mut self) {
        self.transition(ArbiterState::Listening);
        self.evaluations = 0;
    }

    fn absorb_text(&mut self, event: &TranscriptEvent) {
        if event.text.is_empty() {
            return;
        }
        match event.kind {
            // Each results-envelope final closes one segment of the turn
            TranscriptKind::Final => {
                if !self.finalized.is_empty() {
                    self.finalized.push(' ');
                }
                self.finalized.push_str(&event.text);
                self.partial.clear();
            }
            // Partials revise only the open segment
            TranscriptKind::Partial => {
                self.partial = event.text.clone();
            }
            // Turn-lifecycle events carry the cumulative turn text
            _ => {
                self.finalized = event.text.clone();
                self.partial.clear();
            }
        }
    }

    fn confirm_turn(&mut self) -> ArbiterAction {
        let transcript = self.pending_transcript();
        self.finalized.clear();
        self.partial.clear();
        self.evaluations = 0;
        if transcript.is_empty() {
            // Nothing was said; do not generate
            self.transition(ArbiterState::Listening);
            return ArbiterAction::None;
        }
        self.transition(ArbiterState::Processing);
        ArbiterAction::Respond { transcript }
    }
}

fn signals_speech(event: &TranscriptEvent) -> bool {
    match event.kind {
        TranscriptKind::TurnStarted => true,
        TranscriptKind::TurnResumed => true,
        TranscriptKind::TurnMaybeEnded | TranscriptKind::TurnEnded => false,
        _ => !event.text.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: TranscriptKind, text: &str) -> TranscriptEvent {
        TranscriptEvent {
            kind,
            text: text.to_string(),
            is_final: matches!(kind, TranscriptKind::Final | TranscriptKind::TurnEnded),
            confidence: None,
        }
    }

    fn arbiter() -> TurnArbiter {
        TurnArbiter::new(TurnTakingConfig::default())
    }

    #[test]
    fn test_provider_turn_lifecycle_drives_speculation() {
        let mut arbiter = arbiter();
        assert_eq!(
            arbiter.on_transcript(&event(TranscriptKind::TurnStarted, "")),
            ArbiterAction::None
        );
        assert_eq!(arbiter.state(), ArbiterState::Listening);

        arbiter.on_transcript(&event(TranscriptKind::TurnUpdate, "how are"));
        let action = arbiter.on_transcript(&event(TranscriptKind::TurnMaybeEnded, "how are you"));
        assert_eq!(
            action,
            ArbiterAction::StartSpeculative {
                snapshot: "how are you".to_string()
            }
        );

        assert_eq!(
            arbiter.on_transcript(&event(TranscriptKind::TurnResumed, "")),
            ArbiterAction::CancelSpeculative
        );

        let action = arbiter.on_transcript(&event(TranscriptKind::TurnEnded, "how are you today"));
        assert_eq!(
            action,
            ArbiterAction::Respond {
                transcript: "how are you today".to_string()
            }
        );
        assert_eq!(arbiter.state(), ArbiterState::Processing);
    }

    #[test]
    fn test_empty_confirmed_turn_generates_nothing() {
        let mut arbiter = arbiter();
        arbiter.on_transcript(&event(TranscriptKind::TurnStarted, ""));
        assert_eq!(
            arbiter.on_transcript(&event(TranscriptKind::TurnEnded, "")),
            ArbiterAction::None
        );
        assert_eq!(arbiter.state(), ArbiterState::Listening);
    }

    #[test]
    fn test_provider_events_disable_silence_timers() {
        let mut arbiter = arbiter();
        arbiter.on_transcript(&event(TranscriptKind::TurnUpdate, "hello there"));
        assert_eq!(
            arbiter.on_silence(Duration::from_secs(5)),
            ArbiterAction::None
        );
    }

    #[test]
    fn test_silence_ladder_without_provider_events() {
        let mut arbiter = arbiter();
        arbiter.on_transcript(&event(TranscriptKind::Partial, "how are you"));

        // Short pause is ignored
        assert_eq!(
            arbiter.on_silence(Duration::from_millis(200)),
            ArbiterAction::None
        );

        // Evaluation threshold runs the heuristic; question lead responds
        assert_eq!(
            arbiter.on_silence(Duration::from_millis(1100)),
            ArbiterAction::Respond {
                transcript: "how are you".to_string()
            }
        );
    }

    #[test]
    fn test_final_segments_accumulate_across_pauses() {
        let mut arbiter = arbiter();
        arbiter.on_transcript(&event(TranscriptKind::Final, "I wanted to ask"));
        arbiter.on_transcript(&event(TranscriptKind::Final, "about my bill"));

        // Force-response confirmation must carry both segments
        assert_eq!(
            arbiter.on_silence(Duration::from_millis(2600)),
            ArbiterAction::Respond {
                transcript: "I wanted to ask about my bill".to_string()
            }
        );
    }

    #[test]
    fn test_partial_revises_only_the_open_segment() {
        let mut arbiter = arbiter();
        arbiter.on_transcript(&event(TranscriptKind::Final, "what time does"));
        arbiter.on_transcript(&event(TranscriptKind::Partial, "the"));
        arbiter.on_transcript(&event(TranscriptKind::Partial, "the office"));
        assert_eq!(arbiter.pending_transcript(), "what time does the office");

        arbiter.on_transcript(&event(TranscriptKind::Final, "the office open"));
        assert_eq!(
            arbiter.pending_transcript(),
            "what time does the office open"
        );
    }

    #[test]
    fn test_unclear_transcript_escalates_to_classifier() {
        let mut arbiter = arbiter();
        arbiter.on_transcript(&event(TranscriptKind::Partial, "I moved here last spring"));
        assert_eq!(
            arbiter.on_silence(Duration::from_millis(1100)),
            ArbiterAction::Classify {
                transcript: "I moved here last spring".to_string()
            }
        );
        assert_eq!(arbiter.state(), ArbiterState::Evaluating);

        let action = arbiter.on_classifier_decision(TurnDecision::Respond);
        assert_eq!(
            action,
            ArbiterAction::Respond {
                transcript: "I moved here last spring".to_string()
            }
        );
    }

    #[test]
    fn test_evaluation_count_is_bounded() {
        let mut arbiter = arbiter();
        arbiter.on_transcript(&event(TranscriptKind::Partial, "so I was thinking um"));

        // "um" trails, so every evaluation waits
        for _ in 0..3 {
            assert_eq!(
                arbiter.on_silence(Duration::from_millis(1100)),
                ArbiterAction::None
            );
        }
        // Budget spent; further evaluation-threshold silence is ignored
        assert_eq!(
            arbiter.on_silence(Duration::from_millis(1100)),
            ArbiterAction::None
        );
        // The force threshold still fires
        assert!(matches!(
            arbiter.on_silence(Duration::from_millis(2600)),
            ArbiterAction::Respond { .. }
        ));
    }

    #[test]
    fn test_speech_while_speaking_is_barge_in() {
        let mut arbiter = arbiter();
        arbiter.on_transcript(&event(TranscriptKind::TurnEnded, "tell me a story"));
        arbiter.on_speaking();

        let action = arbiter.on_transcript(&event(TranscriptKind::TurnStarted, ""));
        assert_eq!(action, ArbiterAction::BargeIn);
        assert_eq!(arbiter.state(), ArbiterState::Interrupted);

        arbiter.resume_listening();
        assert_eq!(arbiter.state(), ArbiterState::Listening);
    }

    #[test]
    fn test_playback_exhausted_returns_to_listening() {
        let mut arbiter = arbiter();
        arbiter.on_transcript(&event(TranscriptKind::TurnEnded, "hi there friend"));
        arbiter.on_speaking();
        arbiter.on_playback_exhausted();
        assert_eq!(arbiter.state(), ArbiterState::Listening);
    }
}

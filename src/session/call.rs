//! The per-call session.
//!
//! Owns the transport halves, both streaming provider clients, the
//! generator, and every piece of turn-taking state. All external events
//! arrive as [`SessionEvent`]s through one channel and are handled in
//! `run()`, the session's single serialization point. Nothing else
//! mutates session state.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::collab::{Collaborators, Persona, SessionCompletion};
use crate::config::pricing::PricingTable;
use crate::core::llm::{GenerationLimits, PromptContext, ResponseGenerator, SpeculativeDraft};
use crate::core::stt::{SttStreamEvent, TranscriptionStream};
use crate::core::transport::{InboundFrame, OutboundFrame, decode_media_payload};
use crate::core::tts::{SynthesisClient, SynthesisEvent, SynthesisHandle};
use crate::errors::SessionResult;
use crate::session::arbiter::{ArbiterAction, TurnArbiter, TurnTakingConfig};
use crate::session::barge_in::{BargeInConfig, BargeInHandler};
use crate::session::classifier::TurnClassifier;
use crate::session::events::SessionEvent;
use crate::session::guard::{GuardAction, GuardConfig, HEALTH_CHECK_INTERVAL, SessionGuard};
use crate::session::turn::{Turn, TurnHistory};
use crate::session::usage::UsageMeter;

/// Companded telephony audio runs at 8 bytes per millisecond.
const BYTES_PER_MS: u64 = 8;

/// How often accumulated silence is re-examined.
const SILENCE_TICK: Duration = Duration::from_millis(100);

/// Session-level tuning shared across calls.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub turn_taking: TurnTakingConfig,
    pub barge_in: BargeInConfig,
    /// Caller silence that force-terminates the call
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            turn_taking: TurnTakingConfig::default(),
            barge_in: BargeInConfig::default(),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

/// Call identity and resolved context, fixed at stream start.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub call_id: String,
    pub stream_sid: String,
    pub user_id: String,
    pub persona: Persona,
    pub prompt: PromptContext,
}

/// Everything a session needs at construction.
pub struct SessionParams {
    pub context: CallContext,
    pub config: SessionConfig,
    pub stt: TranscriptionStream,
    pub tts: SynthesisClient,
    pub generator: ResponseGenerator,
    pub classifier: TurnClassifier,
    pub pricing: Arc<PricingTable>,
    pub collaborators: Collaborators,
    /// Outbound frames for the telephony socket writer task
    pub outbound_tx: mpsc::Sender<OutboundFrame>,
    /// Clone of the session's own event channel, used to bridge
    /// synthesis streams back into the loop
    pub event_tx: mpsc::Sender<SessionEvent>,
}

/// One in-flight synthesized response.
struct ActivePlayback {
    handle: SynthesisHandle,
    full_text: String,
    seq: u64,
    audio_bytes_sent: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct CallSession {
    context: CallContext,
    arbiter: TurnArbiter,
    barge_in: BargeInHandler,
    guard: SessionGuard,
    meter: UsageMeter,
    history: TurnHistory,
    generator: ResponseGenerator,
    classifier: TurnClassifier,
    stt: TranscriptionStream,
    tts: SynthesisClient,
    pricing: Arc<PricingTable>,
    collaborators: Collaborators,
    outbound_tx: mpsc::Sender<OutboundFrame>,
    event_tx: mpsc::Sender<SessionEvent>,
    draft: Option<SpeculativeDraft>,
    playback: Option<ActivePlayback>,
    /// Warnings deferred because a response was mid-playback
    pending_warnings: Vec<String>,
    last_speech: Instant,
    started_at: Instant,
    next_seq: u64,
    finalized: Option<SessionCompletion>,
}

impl CallSession {
    pub fn new(params: SessionParams) -> Self {
        let guard = SessionGuard::new(GuardConfig {
            idle_timeout: params.config.idle_timeout,
            max_duration: Duration::from_secs(
                u64::from(params.context.persona.max_duration_minutes) * 60,
            ),
        });
        let now = Instant::now();
        Self {
            arbiter: TurnArbiter::new(params.config.turn_taking),
            barge_in: BargeInHandler::new(params.config.barge_in),
            guard,
            meter: UsageMeter::new(),
            history: TurnHistory::new(),
            context: params.context,
            generator: params.generator,
            classifier: params.classifier,
            stt: params.stt,
            tts: params.tts,
            pricing: params.pricing,
            collaborators: params.collaborators,
            outbound_tx: params.outbound_tx,
            event_tx: params.event_tx,
            draft: None,
            playback: None,
            pending_warnings: Vec::new(),
            last_speech: now,
            started_at: now,
            next_seq: 0,
            finalized: None,
        }
    }

    fn limits(&self) -> GenerationLimits {
        GenerationLimits {
            max_tokens: self.context.persona.max_tokens,
            temperature: self.context.persona.temperature,
        }
    }

    /// Drive the session to completion. Every exit path runs the
    /// finalize sequence exactly once.
    pub async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<SessionEvent>,
    ) -> SessionResult<SessionCompletion> {
        info!(call_id = %self.context.call_id, persona = %self.context.persona.id, "Session started");

        let mut silence_tick = tokio::time::interval(SILENCE_TICK);
        silence_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut guard_tick = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        guard_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_event = event_rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if self.handle_event(event).await == Flow::Stop {
                                break;
                            }
                        }
                        None => {
                            warn!(call_id = %self.context.call_id, "Event channel closed");
                            break;
                        }
                    }
                }

                _ = silence_tick.tick() => {
                    let action = self.arbiter.on_silence(self.last_speech.elapsed());
                    if self.apply_action(action).await == Flow::Stop {
                        break;
                    }
                }

                _ = guard_tick.tick() => {
                    if self.on_guard_tick().await == Flow::Stop {
                        break;
                    }
                }
            }
        }

        self.finalize().await
    }

    async fn handle_event(&mut self, event: SessionEvent) -> Flow {
        match event {
            SessionEvent::Frame(frame) => self.handle_frame(frame).await,
            SessionEvent::TransportClosed => {
                warn!(call_id = %self.context.call_id, "Telephony socket closed unexpectedly");
                Flow::Stop
            }
            SessionEvent::Recognition(event) => self.handle_recognition(event).await,
            SessionEvent::Synthesis { seq, event } => self.handle_synthesis(seq, event).await,
        }
    }

    async fn handle_frame(&mut self, frame: InboundFrame) -> Flow {
        match frame {
            InboundFrame::Media { media, .. } => {
                match decode_media_payload(&media.payload) {
                    Ok(audio) => {
                        self.meter.record_audio_in(audio.len());
                        // Audio flows to recognition even while speaking;
                        // it is the only barge-in source
                        if let Err(e) = self.stt.send_audio(Bytes::from(audio)).await {
                            warn!("Failed to queue audio for recognition: {e}");
                        }
                    }
                    Err(e) => {
                        // Malformed frames are logged and skipped
                        warn!("Dropping malformed media frame: {e}");
                    }
                }
                Flow::Continue
            }
            InboundFrame::Stop { .. } => {
                info!(call_id = %self.context.call_id, "Stream stopped by the telephony bridge");
                Flow::Stop
            }
            InboundFrame::Mark { mark, .. } => {
                debug!(name = %mark.name, "Playback boundary acknowledged");
                Flow::Continue
            }
            InboundFrame::Dtmf { dtmf, .. } => {
                debug!(digit = %dtmf.digit, "DTMF received");
                Flow::Continue
            }
            InboundFrame::Connected { .. } | InboundFrame::Start { .. } => Flow::Continue,
        }
    }

    async fn handle_recognition(&mut self, event: SttStreamEvent) -> Flow {
        match event {
            SttStreamEvent::Connected => {
                debug!("Recognition stream ready");
                Flow::Continue
            }
            SttStreamEvent::Disconnected { reason } => {
                warn!("Recognition stream reconnecting: {reason}");
                Flow::Continue
            }
            SttStreamEvent::Fatal(e) => {
                error!("Recognition stream lost for good: {e}");
                Flow::Stop
            }
            SttStreamEvent::Transcript(transcript) => {
                self.last_speech = Instant::now();
                self.guard.record_speech();
                let action = self.arbiter.on_transcript(&transcript);
                self.apply_action(action).await
            }
        }
    }

    async fn handle_synthesis(&mut self, seq: u64, event: SynthesisEvent) -> Flow {
        let Some(playback) = self.playback.as_mut() else {
            return Flow::Continue;
        };
        if playback.seq != seq {
            // Late event from a cancelled response
            return Flow::Continue;
        }

        match event {
            SynthesisEvent::Audio(audio) => {
                playback.audio_bytes_sent += audio.len() as u64;
                let frame = OutboundFrame::media(&self.context.stream_sid, &audio);
                if self.outbound_tx.send(frame).await.is_err() {
                    warn!("Telephony writer gone while forwarding audio");
                    return Flow::Stop;
                }
                Flow::Continue
            }
            SynthesisEvent::Completed => {
                let finished = self.playback.take();
                if let Some(playback) = finished {
                    self.history.push(Turn::assistant(playback.full_text));
                    let mark =
                        OutboundFrame::mark(&self.context.stream_sid, &format!("response-{seq}"));
                    let _ = self.outbound_tx.send(mark).await;
                }
                self.arbiter.on_playback_exhausted();
                self.speak_pending_warning().await;
                Flow::Continue
            }
            SynthesisEvent::Failed(e) => {
                warn!("Synthesis stream failed mid-response: {e}");
                if let Some(playback) = self.playback.take()
                    && playback.audio_bytes_sent > 0
                {
                    // Part of the response was heard; keep what played
                    let estimate = self.barge_in.estimate(
                        &playback.full_text,
                        &playback.handle.alignment_snapshot(),
                        playback.handle.elapsed_ms(),
                        None,
                        playback.audio_bytes_sent,
                    );
                    let turn = self.barge_in.interrupted_turn(&playback.full_text, estimate);
                    self.history.push(turn);
                }
                self.arbiter.on_playback_exhausted();
                self.speak_pending_warning().await;
                Flow::Continue
            }
        }
    }

    async fn apply_action(&mut self, action: ArbiterAction) -> Flow {
        let mut action = action;
        loop {
            match action {
                ArbiterAction::None => return Flow::Continue,
                ArbiterAction::StartSpeculative { snapshot } => {
                    if let Some(stale) = self.draft.take() {
                        stale.cancel();
                    }
                    self.draft = Some(self.generator.generate_speculative(
                        &self.context.prompt,
                        &self.history.to_chat_messages(),
                        &snapshot,
                        self.limits(),
                    ));
                    return Flow::Continue;
                }
                ArbiterAction::CancelSpeculative => {
                    if let Some(draft) = self.draft.take() {
                        draft.cancel();
                    }
                    return Flow::Continue;
                }
                ArbiterAction::Classify { transcript } => {
                    let decision = self.classifier.classify(&transcript).await;
                    action = self.arbiter.on_classifier_decision(decision);
                }
                ArbiterAction::Respond { transcript } => {
                    self.respond(transcript).await;
                    return Flow::Continue;
                }
                ArbiterAction::BargeIn => {
                    self.handle_barge_in().await;
                    return Flow::Continue;
                }
            }
        }
    }

    /// Generate and speak the reply to a confirmed caller turn.
    async fn respond(&mut self, transcript: String) {
        let history = self.history.to_chat_messages();
        let limits = self.limits();

        let response = match self.draft.take() {
            // The draft is usable only against a byte-identical transcript
            Some(draft) if draft.matches(&transcript) => {
                debug!("Consuming speculative draft");
                match draft.resolve().await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("Speculative draft unusable, generating fresh: {e}");
                        self.generator
                            .generate(&self.context.prompt, &history, &transcript, limits)
                            .await
                    }
                }
            }
            other => {
                if let Some(stale) = other {
                    debug!("Discarding mismatched speculative draft");
                    stale.cancel();
                }
                self.generator
                    .generate(&self.context.prompt, &history, &transcript, limits)
                    .await
            }
        };

        self.history.push(Turn::caller(transcript));
        self.meter.record_tokens(response.usage);
        self.speak(response.text).await;
    }

    /// Start streaming one utterance to the caller.
    async fn speak(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        self.meter.record_synthesis_chars(text.chars().count());

        let seq = self.next_seq;
        self.next_seq += 1;

        // Bridge this response's synthesis events into the session loop
        let (synth_tx, mut synth_rx) = mpsc::channel::<SynthesisEvent>(32);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = synth_rx.recv().await {
                if event_tx
                    .send(SessionEvent::Synthesis { seq, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let handle = self.tts.speak(&text, synth_tx);
        self.playback = Some(ActivePlayback {
            handle,
            full_text: text,
            seq,
            audio_bytes_sent: 0,
        });
        self.arbiter.on_speaking();
    }

    /// Caller spoke over the assistant: cut synthesis, flush queued
    /// audio at the bridge, and record the partial turn.
    async fn handle_barge_in(&mut self) {
        let Some(playback) = self.playback.take() else {
            self.arbiter.resume_listening();
            return;
        };

        playback.handle.cancel();
        let _ = self
            .outbound_tx
            .send(OutboundFrame::clear(&self.context.stream_sid))
            .await;

        let alignment = playback.handle.alignment_snapshot();
        // With full synthesis delivered, total playback length is known
        // from the byte count even without alignment
        let total_ms = playback
            .handle
            .is_completed()
            .then(|| playback.audio_bytes_sent / BYTES_PER_MS)
            .filter(|ms| *ms > 0);
        let estimate = self.barge_in.estimate(
            &playback.full_text,
            &alignment,
            playback.handle.elapsed_ms(),
            total_ms,
            playback.audio_bytes_sent,
        );
        info!(
            heard_fraction = estimate.fraction,
            method = ?estimate.method,
            "Barge-in: response interrupted"
        );
        let turn = self.barge_in.interrupted_turn(&playback.full_text, estimate);
        self.history.push(turn);
        self.arbiter.resume_listening();
    }

    async fn on_guard_tick(&mut self) -> Flow {
        self.pricing.refresh_if_stale().await;

        if !self.stt.is_connected() {
            // The stream supervisor reconnects on its own; fatal loss
            // arrives as a Recognition event
            debug!("Recognition stream down at health check");
        }

        // A warning deferred behind a response that ended in barge-in
        // never sees a Completed event; flush it here
        self.speak_pending_warning().await;

        match self.guard.check() {
            GuardAction::None => Flow::Continue,
            GuardAction::SpeakWarning { text } => {
                if self.playback.is_some() {
                    self.pending_warnings.push(text);
                } else {
                    self.speak(text).await;
                }
                Flow::Continue
            }
            GuardAction::Terminate(reason) => {
                info!(?reason, call_id = %self.context.call_id, "Guard terminated the session");
                Flow::Stop
            }
        }
    }

    async fn speak_pending_warning(&mut self) {
        if self.playback.is_none()
            && !self.pending_warnings.is_empty()
        {
            let text = self.pending_warnings.remove(0);
            self.speak(text).await;
        }
    }

    /// Usage finalize, credit deduction, call-record persistence, and
    /// completion emission. Guarded to run once; ledger and persistence
    /// failures are logged and never abort.
    async fn finalize(&mut self) -> SessionResult<SessionCompletion> {
        if let Some(completion) = &self.finalized {
            return Ok(completion.clone());
        }

        if let Some(playback) = self.playback.take() {
            playback.handle.cancel();
        }
        if let Some(draft) = self.draft.take() {
            draft.cancel();
        }
        self.stt.shutdown().await;

        self.pricing.refresh_if_stale().await;
        let (breakdown, events) = self.meter.finalize(&self.pricing);
        for event in &events {
            info!(
                service = %event.service,
                quantity = event.quantity,
                cost = event.cost,
                "Usage event"
            );
        }

        if breakdown.minutes > 0.0
            && let Err(e) = self
                .collaborators
                .credits
                .deduct(&self.context.user_id, breakdown.minutes)
                .await
        {
            warn!("Credit deduction failed: {e}");
        }

        let completion = SessionCompletion {
            call_id: self.context.call_id.clone(),
            duration_seconds: self.started_at.elapsed().as_secs_f64(),
            cost: breakdown,
            transcript: self.history.transcript_text(),
        };

        if let Err(e) = self
            .collaborators
            .call_records
            .mark_completed(&completion)
            .await
        {
            warn!("Call record persistence failed: {e}");
        }

        info!(
            call_id = %completion.call_id,
            duration_seconds = completion.duration_seconds,
            total_cost = completion.cost.total,
            "Session finalized"
        );
        self.finalized = Some(completion.clone());
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::{ChatClient, LlmConfig, StageDirectionPolicy};
    use crate::core::stt::SttConfig;
    use crate::core::tts::TtsConfig;
    use crate::session::retry::RetryPolicy;

    fn session_for_test(
        event_tx: mpsc::Sender<SessionEvent>,
        outbound_tx: mpsc::Sender<OutboundFrame>,
    ) -> CallSession {
        let stt = TranscriptionStream::spawn(
            SttConfig {
                api_key: "key".to_string(),
                endpoint: "wss://127.0.0.1:1/v1/listen".to_string(),
                ..Default::default()
            },
            RetryPolicy::default(),
            mpsc::channel(8).0,
        )
        .unwrap();
        let tts = SynthesisClient::new(TtsConfig {
            api_key: "key".to_string(),
            voice_id: "river".to_string(),
            endpoint: "wss://127.0.0.1:1/v1/text-to-speech".to_string(),
            ..Default::default()
        })
        .unwrap();
        let chat = ChatClient::new(
            reqwest::Client::new(),
            LlmConfig {
                api_key: "key".to_string(),
                endpoint: "http://127.0.0.1:1/v1/chat/completions".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        let collaborators = Collaborators::in_memory();
        CallSession::new(SessionParams {
            context: CallContext {
                call_id: "CA1".to_string(),
                stream_sid: "MZ1".to_string(),
                user_id: "u-1".to_string(),
                persona: Persona {
                    id: "p-1".to_string(),
                    ..Default::default()
                },
                prompt: PromptContext::default(),
            },
            config: SessionConfig::default(),
            stt,
            tts,
            generator: ResponseGenerator::new(chat.clone(), StageDirectionPolicy::default()),
            classifier: TurnClassifier::new(chat, Duration::from_millis(500)),
            pricing: Arc::new(PricingTable::new(Arc::new(
                crate::collab::StaticPricingSource::default(),
            ))),
            collaborators,
            outbound_tx,
            event_tx,
        })
    }

    #[tokio::test]
    async fn test_stop_frame_finalizes_once() {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (outbound_tx, _outbound_rx) = mpsc::channel(64);
        let session = session_for_test(event_tx.clone(), outbound_tx);

        event_tx
            .send(SessionEvent::Frame(InboundFrame::parse(
                r#"{"event":"stop","streamSid":"MZ1"}"#,
            ).unwrap()))
            .await
            .unwrap();

        let completion = session.run(event_rx).await.unwrap();
        assert_eq!(completion.call_id, "CA1");
        assert_eq!(completion.cost.total, 0.0);
    }

    #[tokio::test]
    async fn test_stale_synthesis_events_are_ignored() {
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(64);
        let mut session = session_for_test(event_tx, outbound_tx);

        // No playback is active, so any synthesis event is stale
        let flow = session
            .handle_synthesis(7, SynthesisEvent::Audio(Bytes::from_static(b"abc")))
            .await;
        assert_eq!(flow, Flow::Continue);
        assert!(outbound_rx.try_recv().is_err());
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deferred_warning_speaks_after_failed_synthesis() {
        let (event_tx, _event_rx) = mpsc::channel(64);
        let (outbound_tx, _outbound_rx) = mpsc::channel(64);
        let mut session = session_for_test(event_tx, outbound_tx);

        session.speak("first response".to_string()).await;
        let seq = session.playback.as_ref().unwrap().seq;
        session
            .pending_warnings
            .push("two minutes remaining".to_string());

        let flow = session
            .handle_synthesis(
                seq,
                SynthesisEvent::Failed(crate::errors::TtsError::NetworkError(
                    "connection reset".to_string(),
                )),
            )
            .await;
        assert_eq!(flow, Flow::Continue);

        // The queued warning became the next playback
        let playback = session.playback.as_ref().unwrap();
        assert_eq!(playback.full_text, "two minutes remaining");
        assert!(session.pending_warnings.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_media_is_skipped() {
        let (event_tx, _event_rx) = mpsc::channel(64);
        let (outbound_tx, _outbound_rx) = mpsc::channel(64);
        let mut session = session_for_test(event_tx, outbound_tx);

        let frame = InboundFrame::parse(
            r#"{"event":"media","streamSid":"MZ1","media":{"payload":"@@@"}}"#,
        )
        .unwrap();
        assert_eq!(session.handle_frame(frame).await, Flow::Continue);
    }
}

//! Telephony media-stream WebSocket handler.
//!
//! The bridge connects, announces itself, and sends a `start` frame
//! carrying call identity and custom parameters. Only then is the full
//! session stack built: provider clients, generator, classifier, and the
//! session loop itself. Frames after `start` are forwarded into the
//! session's event channel; the socket writer drains the session's
//! outbound channel.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::collab::Persona;
use crate::core::llm::{ChatClient, PromptContext, ResponseGenerator, StageDirectionPolicy};
use crate::core::stt::{SttStreamEvent, TranscriptionStream};
use crate::core::transport::{InboundFrame, OutboundFrame, StartMeta};
use crate::errors::{SessionError, SessionResult};
use crate::session::{
    CallContext, CallSession, RetryPolicy, SessionEvent, SessionParams, TurnClassifier,
};
use crate::state::AppState;

/// How long the bridge gets to send its `start` frame.
const START_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 256;

pub async fn call_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    info!("Media-stream connection upgrade requested");
    ws.on_upgrade(move |socket| handle_call_socket(socket, state))
}

async fn handle_call_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, mut receiver) = socket.split();

    let Some((stream_sid, start)) = await_start_frame(&mut receiver).await else {
        warn!("No start frame received, closing socket");
        return;
    };

    let context = match resolve_context(&state, &stream_sid, start).await {
        Ok(context) => context,
        Err(e) => {
            warn!(%stream_sid, "Cannot start session: {e}");
            return;
        }
    };

    let call_id = context.call_id.clone();
    state.register_call(&call_id, &stream_sid, &context.user_id);

    let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_BUFFER);
    let writer_task = tokio::spawn(write_outbound(sender, outbound_rx));

    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(EVENT_BUFFER);

    let session_task = match build_session(&state, context, outbound_tx, event_tx.clone()) {
        Ok(session) => tokio::spawn(session.run(event_rx)),
        Err(e) => {
            error!(call_id, "Session stack construction failed: {e}");
            state.unregister_call(&call_id);
            writer_task.abort();
            return;
        }
    };

    // Reader: socket frames into the session loop until either side ends
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match InboundFrame::parse(&text) {
                Ok(frame) => {
                    if event_tx.send(SessionEvent::Frame(frame)).await.is_err() {
                        // Session loop has exited
                        break;
                    }
                }
                Err(e) => {
                    warn!(call_id, "Dropping unparseable frame: {e}");
                }
            },
            Ok(Message::Close(_)) => {
                let _ = event_tx.send(SessionEvent::TransportClosed).await;
                break;
            }
            Ok(_) => {
                // The bridge only sends text frames; ignore pings and the rest
            }
            Err(e) => {
                warn!(call_id, "Socket error: {e}");
                let _ = event_tx.send(SessionEvent::TransportClosed).await;
                break;
            }
        }
    }
    drop(event_tx);

    match session_task.await {
        Ok(Ok(completion)) => {
            info!(
                call_id,
                total_cost = completion.cost.total,
                "Call completed"
            );
        }
        Ok(Err(e)) => error!(call_id, "Session ended with error: {e}"),
        Err(e) => error!(call_id, "Session task panicked: {e}"),
    }

    state.unregister_call(&call_id);
    writer_task.abort();
}

/// Consume frames until the `start` arrives.
async fn await_start_frame(
    receiver: &mut SplitStream<WebSocket>,
) -> Option<(String, StartMeta)> {
    let deadline = tokio::time::Instant::now() + START_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let message = match timeout(remaining, receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                warn!("Socket error before start frame: {e}");
                return None;
            }
            Ok(None) => return None,
            Err(_elapsed) => {
                warn!("Timed out waiting for start frame");
                return None;
            }
        };

        let Message::Text(text) = message else {
            continue;
        };
        match InboundFrame::parse(&text) {
            Ok(InboundFrame::Connected { protocol, .. }) => {
                debug!(?protocol, "Bridge connected");
            }
            Ok(InboundFrame::Start { stream_sid, start }) => {
                info!(%stream_sid, call_sid = %start.call_sid, "Stream started");
                return Some((stream_sid, start));
            }
            Ok(other) => {
                debug!("Ignoring pre-start frame: {other:?}");
            }
            Err(e) => {
                warn!("Unparseable frame before start: {e}");
            }
        }
    }
}

/// Resolve persona, relationship, and facts into the call context.
async fn resolve_context(
    state: &AppState,
    stream_sid: &str,
    start: StartMeta,
) -> SessionResult<CallContext> {
    let persona_id = start
        .custom_parameters
        .get("personaId")
        .ok_or_else(|| SessionError::Configuration("Missing personaId parameter".to_string()))?;
    let user_id = start
        .custom_parameters
        .get("userId")
        .ok_or_else(|| SessionError::Configuration("Missing userId parameter".to_string()))?;

    let persona: Persona = state
        .collaborators
        .personas
        .get(persona_id)
        .await?
        .ok_or_else(|| SessionError::Configuration(format!("Unknown persona: {persona_id}")))?;

    let relationship = state
        .collaborators
        .relationships
        .get_or_create(user_id, persona_id)
        .await?;
    let facts = state.collaborators.facts.get(user_id, persona_id).await?;

    let prompt = PromptContext {
        persona_instructions: persona.system_prompt.clone(),
        scenario: start.custom_parameters.get("scenario").cloned(),
        relationship: relationship.summary,
        facts,
    };

    let call_id = if start.call_sid.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        start.call_sid.clone()
    };

    Ok(CallContext {
        call_id,
        stream_sid: stream_sid.to_string(),
        user_id: user_id.clone(),
        persona,
        prompt,
    })
}

/// Assemble the provider clients and the session itself.
fn build_session(
    state: &Arc<AppState>,
    context: CallContext,
    outbound_tx: mpsc::Sender<OutboundFrame>,
    event_tx: mpsc::Sender<SessionEvent>,
) -> SessionResult<CallSession> {
    // Recognition events ride the session's own event channel
    let (stt_tx, mut stt_rx) = mpsc::channel::<SttStreamEvent>(64);
    let recognition_tx = event_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = stt_rx.recv().await {
            if recognition_tx
                .send(SessionEvent::Recognition(event))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let stt = TranscriptionStream::spawn(state.config.stt_config(), RetryPolicy::default(), stt_tx)?;
    let tts = crate::core::tts::SynthesisClient::new(state.config.tts_config(&context.persona.voice_id))?;
    let chat = ChatClient::new(state.http.clone(), state.config.llm_config())?;

    let stage_directions = if state.config.stage_direction_patterns.is_empty() {
        StageDirectionPolicy::default()
    } else {
        StageDirectionPolicy::from_patterns(&state.config.stage_direction_patterns)
            .map_err(|e| SessionError::Configuration(format!("Bad stage-direction pattern: {e}")))?
    };

    let session_config = state.config.session_config();
    let classifier_budget = session_config.turn_taking.classifier_timeout;

    Ok(CallSession::new(SessionParams {
        context,
        config: session_config,
        stt,
        tts,
        generator: ResponseGenerator::new(chat.clone(), stage_directions),
        classifier: TurnClassifier::new(chat, classifier_budget),
        pricing: state.pricing.clone(),
        collaborators: state.collaborators.clone(),
        outbound_tx,
        event_tx,
    }))
}

/// Drain session output onto the socket.
async fn write_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let json = match frame.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize outbound frame: {e}");
                continue;
            }
        };
        if let Err(e) = sender.send(Message::Text(json.into())).await {
            warn!("Failed to write to telephony socket: {e}");
            break;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

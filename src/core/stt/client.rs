//! Transcription stream client.
//!
//! Maintains one persistent duplex connection to the recognition provider
//! per call. Audio is forwarded continuously, including while synthetic
//! speech is playing, because this stream is the only source of barge-in
//! detection. Frames that arrive before the connection is established, or
//! while it is down, are buffered in arrival order and flushed FIFO once
//! the socket is (re)established. Reconnects are supervised by a
//! [`RetryPolicy`]; exhausting the attempt budget is fatal for the call.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::messages::{CloseStreamMessage, RecognizerMessage, TranscriptEvent};
use crate::errors::SttError;
use crate::session::retry::RetryPolicy;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handshake budget for the provider socket.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-message idle timeout. Resets after each received message and
/// catches stuck connections that never close.
const WS_MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on frames held while the socket is down. At 20ms frames
/// this is well over a minute of audio, far beyond the reconnect budget.
const MAX_BUFFERED_FRAMES: usize = 4096;

/// Recognition stream configuration.
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub api_key: String,
    /// Base wss endpoint, query-parameterized on connect
    pub endpoint: String,
    pub model: String,
    pub language: String,
    pub sample_rate: u32,
    pub encoding: String,
    /// Whether the configured model emits native turn-lifecycle events
    pub turn_events: bool,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: "wss://api.recognition.example/v1/listen".to_string(),
            model: "flux-general-en".to_string(),
            language: "en-US".to_string(),
            sample_rate: 8000,
            encoding: "mulaw".to_string(),
            turn_events: true,
        }
    }
}

impl SttConfig {
    /// Build the query-parameterized connection URL.
    pub fn build_url(&self) -> Result<url::Url, SttError> {
        let mut url = url::Url::parse(&self.endpoint)
            .map_err(|e| SttError::ConfigurationError(format!("Invalid endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("model", &self.model)
            .append_pair("language", &self.language)
            .append_pair("sample_rate", &self.sample_rate.to_string())
            .append_pair("encoding", &self.encoding)
            .append_pair("channels", "1")
            .append_pair("interim_results", "true");
        Ok(url)
    }
}

/// Lifecycle and transcript events surfaced to the session loop.
#[derive(Debug)]
pub enum SttStreamEvent {
    Connected,
    Transcript(TranscriptEvent),
    /// Connection dropped; a supervised reconnect is in progress
    Disconnected { reason: String },
    /// Unrecoverable; the session must finalize
    Fatal(SttError),
}

/// Handle to the per-call transcription stream.
pub struct TranscriptionStream {
    audio_tx: mpsc::Sender<Bytes>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    is_connected: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl TranscriptionStream {
    /// Spawn the stream supervisor. Audio may be sent immediately; frames
    /// are buffered until the provider socket is up.
    pub fn spawn(
        config: SttConfig,
        retry: RetryPolicy,
        event_tx: mpsc::Sender<SttStreamEvent>,
    ) -> Result<Self, SttError> {
        if config.api_key.is_empty() {
            return Err(SttError::AuthenticationFailed(
                "API key is required for the recognition stream".to_string(),
            ));
        }
        // Validated here so the supervisor task cannot fail on a bad URL
        let url = config.build_url()?;

        let (audio_tx, audio_rx) = mpsc::channel::<Bytes>(64);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let is_connected = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_supervisor(
            config,
            url,
            retry,
            audio_rx,
            shutdown_rx,
            event_tx,
            is_connected.clone(),
        ));

        Ok(Self {
            audio_tx,
            shutdown_tx: Some(shutdown_tx),
            is_connected,
            task: Some(task),
        })
    }

    /// Queue one companded audio frame for the provider.
    pub async fn send_audio(&self, frame: Bytes) -> Result<(), SttError> {
        self.audio_tx
            .send(frame)
            .await
            .map_err(|_| SttError::NetworkError("Recognition stream task is gone".to_string()))
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    /// Close the stream gracefully.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = timeout(Duration::from_secs(5), task).await;
        }
    }
}

impl Drop for TranscriptionStream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// =============================================================================
// Supervisor task
// =============================================================================

enum ConnectionOutcome {
    Shutdown,
    Dropped(String),
    Failed(SttError),
}

async fn run_supervisor(
    config: SttConfig,
    url: url::Url,
    retry: RetryPolicy,
    mut audio_rx: mpsc::Receiver<Bytes>,
    mut shutdown_rx: oneshot::Receiver<()>,
    event_tx: mpsc::Sender<SttStreamEvent>,
    is_connected: Arc<AtomicBool>,
) {
    // Frames held while no socket is up; flushed FIFO on (re)connect
    let mut pending: VecDeque<Bytes> = VecDeque::new();

    loop {
        let ws = match dial_with_retry(
            &config,
            &url,
            &retry,
            &mut pending,
            &mut audio_rx,
            &mut shutdown_rx,
        )
        .await
        {
            Ok(Some(ws)) => ws,
            Ok(None) => return, // shutdown while dialing
            Err(e) => {
                error!("Recognition stream giving up: {e}");
                let _ = event_tx.send(SttStreamEvent::Fatal(e)).await;
                return;
            }
        };

        info!("Recognition stream connected ({} buffered frames)", pending.len());
        is_connected.store(true, Ordering::Release);
        let _ = event_tx.send(SttStreamEvent::Connected).await;

        let outcome = run_connection(
            ws,
            &mut pending,
            &mut audio_rx,
            &mut shutdown_rx,
            &event_tx,
        )
        .await;

        is_connected.store(false, Ordering::Release);
        match outcome {
            ConnectionOutcome::Shutdown => {
                info!("Recognition stream closed");
                return;
            }
            ConnectionOutcome::Dropped(reason) => {
                warn!("Recognition stream dropped: {reason}; reconnecting");
                let _ = event_tx
                    .send(SttStreamEvent::Disconnected { reason })
                    .await;
                // loop continues into dial_with_retry
            }
            ConnectionOutcome::Failed(e) => {
                error!("Recognition stream failed: {e}");
                let _ = event_tx.send(SttStreamEvent::Fatal(e)).await;
                return;
            }
        }
    }
}

/// Dial the provider with bounded linear backoff, buffering any audio that
/// arrives while no socket is up. Returns `Ok(None)` on shutdown.
async fn dial_with_retry(
    config: &SttConfig,
    url: &url::Url,
    retry: &RetryPolicy,
    pending: &mut VecDeque<Bytes>,
    audio_rx: &mut mpsc::Receiver<Bytes>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> Result<Option<WsStream>, SttError> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        debug!("Recognition dial attempt {attempt}/{}", retry.max_attempts);

        let dial = async {
            let request = build_request(config, url)?;
            match timeout(HANDSHAKE_TIMEOUT, connect_async(request)).await {
                Ok(Ok((ws, _response))) => Ok(ws),
                Ok(Err(e)) => Err(SttError::ConnectFailed(e.to_string())),
                Err(_) => Err(SttError::ConnectFailed(format!(
                    "Handshake timed out after {}s",
                    HANDSHAKE_TIMEOUT.as_secs()
                ))),
            }
        };
        tokio::pin!(dial);

        let dial_result = loop {
            tokio::select! {
                result = &mut dial => break result,
                Some(frame) = audio_rx.recv() => buffer_frame(pending, frame),
                _ = &mut *shutdown_rx => return Ok(None),
            }
        };

        match dial_result {
            Ok(ws) => return Ok(Some(ws)),
            Err(e) => {
                warn!("Recognition dial attempt {attempt} failed: {e}");
                let Some(delay) = retry.delay_for(attempt) else {
                    return Err(SttError::ReconnectExhausted { attempts: attempt });
                };
                if attempt >= retry.max_attempts {
                    return Err(SttError::ReconnectExhausted { attempts: attempt });
                }
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        Some(frame) = audio_rx.recv() => buffer_frame(pending, frame),
                        _ = &mut *shutdown_rx => return Ok(None),
                    }
                }
            }
        }
    }
}

fn buffer_frame(pending: &mut VecDeque<Bytes>, frame: Bytes) {
    if pending.len() >= MAX_BUFFERED_FRAMES {
        // Outage outlived the buffer; keep the most recent audio
        warn!("Recognition frame buffer full, dropping oldest frame");
        pending.pop_front();
    }
    pending.push_back(frame);
}

fn build_request(
    config: &SttConfig,
    url: &url::Url,
) -> Result<tokio_tungstenite::tungstenite::http::Request<()>, SttError> {
    let host = url
        .host_str()
        .ok_or_else(|| SttError::ConfigurationError("Endpoint has no host".to_string()))?;

    tokio_tungstenite::tungstenite::http::Request::builder()
        .method("GET")
        .uri(url.as_str())
        .header("Host", host)
        .header("Upgrade", "websocket")
        .header("Connection", "upgrade")
        .header("Sec-WebSocket-Key", generate_key())
        .header("Sec-WebSocket-Version", "13")
        .header("Authorization", format!("Token {}", config.api_key))
        .body(())
        .map_err(|e| SttError::ConnectFailed(format!("Failed to build request: {e}")))
}

async fn run_connection(
    ws: WsStream,
    pending: &mut VecDeque<Bytes>,
    audio_rx: &mut mpsc::Receiver<Bytes>,
    shutdown_rx: &mut oneshot::Receiver<()>,
    event_tx: &mpsc::Sender<SttStreamEvent>,
) -> ConnectionOutcome {
    let (mut sink, mut stream) = ws.split();

    // Flush the outage buffer in original arrival order before live audio
    while let Some(frame) = pending.pop_front() {
        if let Err(e) = sink.send(Message::Binary(frame)).await {
            return ConnectionOutcome::Dropped(format!("flush failed: {e}"));
        }
    }

    loop {
        tokio::select! {
            Some(frame) = audio_rx.recv() => {
                if let Err(e) = sink.send(Message::Binary(frame)).await {
                    return ConnectionOutcome::Dropped(format!("send failed: {e}"));
                }
            }

            message = timeout(WS_MESSAGE_TIMEOUT, stream.next()) => {
                match message {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        match handle_provider_message(&text, event_tx).await {
                            Ok(()) => {}
                            Err(e) => return classify_provider_error(e),
                        }
                    }
                    Ok(Some(Ok(Message::Close(frame)))) => {
                        return ConnectionOutcome::Dropped(format!("provider close: {frame:?}"));
                    }
                    Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
                    Ok(Some(Ok(Message::Binary(_)))) => {
                        debug!("Unexpected binary message from recognition provider");
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        return ConnectionOutcome::Dropped(format!("socket error: {e}"));
                    }
                    Ok(None) => {
                        return ConnectionOutcome::Dropped("stream ended".to_string());
                    }
                    Err(_elapsed) => {
                        return ConnectionOutcome::Dropped(format!(
                            "idle for {}s",
                            WS_MESSAGE_TIMEOUT.as_secs()
                        ));
                    }
                }
            }

            _ = &mut *shutdown_rx => {
                if let Ok(json) = serde_json::to_string(&CloseStreamMessage::default()) {
                    let _ = sink.send(Message::Text(json.into())).await;
                }
                let _ = sink.send(Message::Close(None)).await;
                return ConnectionOutcome::Shutdown;
            }
        }
    }
}

async fn handle_provider_message(
    text: &str,
    event_tx: &mpsc::Sender<SttStreamEvent>,
) -> Result<(), SttError> {
    match RecognizerMessage::parse(text) {
        Ok(RecognizerMessage::Error(err)) => {
            let description = err.description.clone();
            match err.code.as_deref() {
                Some("invalid_auth") | Some("authentication_failed") => {
                    Err(SttError::AuthenticationFailed(description))
                }
                _ => Err(SttError::NetworkError(description)),
            }
        }
        Ok(message) => {
            if let Some(event) = message.normalize() {
                if event_tx
                    .send(SttStreamEvent::Transcript(event))
                    .await
                    .is_err()
                {
                    return Err(SttError::NetworkError("session channel closed".to_string()));
                }
            }
            Ok(())
        }
        Err(e) => {
            // A single unparseable message is logged and skipped
            warn!("Skipping unparseable recognition message: {e}");
            Ok(())
        }
    }
}

fn classify_provider_error(e: SttError) -> ConnectionOutcome {
    match e {
        SttError::AuthenticationFailed(_) => ConnectionOutcome::Failed(e),
        other => ConnectionOutcome::Dropped(other.to_string()),
    }
}

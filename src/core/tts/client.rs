//! Synthesis stream client.
//!
//! Opens a WebSocket per outgoing response, streams the response text,
//! and forwards audio chunks as they arrive. Per-character alignment
//! metadata is accumulated into an [`AlignmentTrace`] shared with the
//! barge-in handler. Cancellation is immediate: a cancelled stream stops
//! emitting audio without waiting for a graceful end-of-stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::alignment::AlignmentTrace;
use super::messages::{SynthesisMessage, TextFrame, VoiceSettings};
use crate::core::transport::encode_pcm16le;
use crate::errors::TtsError;

/// Handshake budget for the provider socket.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-message receive timeout once the stream is live.
const WS_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Synthesis stream configuration.
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub api_key: String,
    /// Base wss endpoint; voice id is appended as a path segment
    pub endpoint: String,
    pub voice_id: String,
    pub model_id: String,
    /// Negotiated output format; `ulaw_8000` feeds the telephony leg
    /// without transcoding
    pub output_format: String,
    pub voice_settings: VoiceSettings,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: "wss://api.synthesis.example/v1/text-to-speech".to_string(),
            voice_id: String::new(),
            model_id: "turbo-v2.5".to_string(),
            output_format: "ulaw_8000".to_string(),
            voice_settings: VoiceSettings::default(),
        }
    }
}

impl TtsConfig {
    pub fn build_url(&self) -> Result<url::Url, TtsError> {
        let raw = format!(
            "{}/{}/stream-input",
            self.endpoint.trim_end_matches('/'),
            self.voice_id
        );
        let mut url = url::Url::parse(&raw)
            .map_err(|e| TtsError::ConfigurationError(format!("Invalid endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("model_id", &self.model_id)
            .append_pair("output_format", &self.output_format);
        Ok(url)
    }

    /// Whether the provider emits linear PCM that must be companded
    /// before it can go out on the telephony leg.
    fn needs_companding(&self) -> bool {
        self.output_format.starts_with("pcm")
    }
}

/// Events surfaced to the session loop for one response stream.
#[derive(Debug)]
pub enum SynthesisEvent {
    /// One audio chunk in the negotiated output format
    Audio(Bytes),
    /// Provider reported end-of-generation; playback is exhausted once
    /// the transport drains what was already forwarded
    Completed,
    Failed(TtsError),
}

/// Handle to one in-flight synthesized response.
pub struct SynthesisHandle {
    cancel: CancellationToken,
    alignment: Arc<parking_lot::Mutex<AlignmentTrace>>,
    completed: Arc<AtomicBool>,
    started_at: Instant,
    task: tokio::task::JoinHandle<()>,
}

impl SynthesisHandle {
    /// Stop the stream immediately. No further audio events are emitted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the provider reported end-of-generation.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Alignment accumulated so far.
    pub fn alignment_snapshot(&self) -> AlignmentTrace {
        self.alignment.lock().clone()
    }

    /// Milliseconds since the response stream started.
    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Per-call synthesis client; one stream per outgoing response.
pub struct SynthesisClient {
    config: TtsConfig,
}

impl SynthesisClient {
    pub fn new(config: TtsConfig) -> Result<Self, TtsError> {
        if config.api_key.is_empty() {
            return Err(TtsError::ConfigurationError(
                "API key is required for the synthesis stream".to_string(),
            ));
        }
        if config.voice_id.is_empty() {
            return Err(TtsError::ConfigurationError(
                "A voice id is required for the synthesis stream".to_string(),
            ));
        }
        config.build_url()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TtsConfig {
        &self.config
    }

    /// Start streaming one response. Text is sent immediately followed by
    /// a flush and the end-of-stream marker; audio and alignment flow back
    /// through `event_tx` until `Completed`, `Failed`, or cancellation.
    pub fn speak(&self, text: &str, event_tx: mpsc::Sender<SynthesisEvent>) -> SynthesisHandle {
        let cancel = CancellationToken::new();
        let alignment = Arc::new(parking_lot::Mutex::new(AlignmentTrace::new()));
        let completed = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_stream(
            self.config.clone(),
            text.to_string(),
            event_tx,
            cancel.clone(),
            alignment.clone(),
            completed.clone(),
        ));

        SynthesisHandle {
            cancel,
            alignment,
            completed,
            started_at: Instant::now(),
            task,
        }
    }
}

async fn run_stream(
    config: TtsConfig,
    text: String,
    event_tx: mpsc::Sender<SynthesisEvent>,
    cancel: CancellationToken,
    alignment: Arc<parking_lot::Mutex<AlignmentTrace>>,
    completed: Arc<AtomicBool>,
) {
    let result = stream_response(&config, &text, &event_tx, &cancel, &alignment, &completed).await;
    match result {
        Ok(()) => {}
        Err(TtsError::Cancelled) => {
            debug!("Synthesis stream cancelled");
        }
        Err(e) => {
            warn!("Synthesis stream failed: {e}");
            let _ = event_tx.send(SynthesisEvent::Failed(e)).await;
        }
    }
}

async fn stream_response(
    config: &TtsConfig,
    text: &str,
    event_tx: &mpsc::Sender<SynthesisEvent>,
    cancel: &CancellationToken,
    alignment: &Arc<parking_lot::Mutex<AlignmentTrace>>,
    completed: &Arc<AtomicBool>,
) -> Result<(), TtsError> {
    let url = config.build_url()?;
    let host = url
        .host_str()
        .ok_or_else(|| TtsError::ConfigurationError("Endpoint has no host".to_string()))?
        .to_string();

    let request = tokio_tungstenite::tungstenite::http::Request::builder()
        .method("GET")
        .uri(url.as_str())
        .header("Host", host)
        .header("Upgrade", "websocket")
        .header("Connection", "upgrade")
        .header("Sec-WebSocket-Key", generate_key())
        .header("Sec-WebSocket-Version", "13")
        .header("xi-api-key", &config.api_key)
        .body(())
        .map_err(|e| TtsError::ConnectFailed(format!("Failed to build request: {e}")))?;

    let connect = timeout(HANDSHAKE_TIMEOUT, connect_async(request));
    let (ws, _response) = tokio::select! {
        result = connect => match result {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(TtsError::ConnectFailed(e.to_string())),
            Err(_) => {
                return Err(TtsError::ConnectFailed(format!(
                    "Handshake timed out after {}s",
                    HANDSHAKE_TIMEOUT.as_secs()
                )));
            }
        },
        _ = cancel.cancelled() => return Err(TtsError::Cancelled),
    };

    info!(voice = %config.voice_id, "Synthesis stream connected");
    let (mut sink, mut stream) = ws.split();

    for frame in [
        TextFrame::begin(config.voice_settings.clone()),
        TextFrame::text(text),
        TextFrame::flush(),
        TextFrame::end(),
    ] {
        let json = frame.to_json()?;
        sink.send(Message::Text(json.into()))
            .await
            .map_err(|e| TtsError::NetworkError(format!("send failed: {e}")))?;
    }

    loop {
        tokio::select! {
            // Barge-in path: stop emitting without a graceful close
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Err(TtsError::Cancelled);
            }

            message = timeout(WS_MESSAGE_TIMEOUT, stream.next()) => {
                match message {
                    Ok(Some(Ok(Message::Text(payload)))) => {
                        let msg = SynthesisMessage::parse(&payload)?;

                        if let Some(error) = msg.error {
                            return Err(TtsError::NetworkError(error));
                        }

                        if let Some(wire) = msg.alignment {
                            alignment.lock().extend_from_wire(
                                &wire.chars,
                                &wire.char_start_times_ms,
                                &wire.char_durations_ms,
                            );
                        }

                        if let Some(audio_b64) = msg.audio {
                            use base64::Engine as _;
                            let mut audio = base64::engine::general_purpose::STANDARD
                                .decode(audio_b64)
                                .map_err(|e| TtsError::ProtocolError(e.to_string()))?;
                            if config.needs_companding() {
                                audio = encode_pcm16le(&audio);
                            }
                            if event_tx
                                .send(SynthesisEvent::Audio(Bytes::from(audio)))
                                .await
                                .is_err()
                            {
                                return Err(TtsError::Cancelled);
                            }
                        }

                        if msg.is_final == Some(true) {
                            completed.store(true, Ordering::Release);
                            let _ = event_tx.send(SynthesisEvent::Completed).await;
                            let _ = sink.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        // Provider closed without the final marker; treat
                        // what we received as the complete response
                        completed.store(true, Ordering::Release);
                        let _ = event_tx.send(SynthesisEvent::Completed).await;
                        return Ok(());
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        return Err(TtsError::NetworkError(format!("socket error: {e}")));
                    }
                    Err(_elapsed) => {
                        return Err(TtsError::NetworkError(format!(
                            "idle for {}s mid-response",
                            WS_MESSAGE_TIMEOUT.as_secs()
                        )));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_shape() {
        let config = TtsConfig {
            api_key: "key".to_string(),
            voice_id: "river".to_string(),
            ..Default::default()
        };
        let url = config.build_url().unwrap();
        assert!(url.path().ends_with("/river/stream-input"));
        let query = url.query().unwrap();
        assert!(query.contains("model_id=turbo-v2.5"));
        assert!(query.contains("output_format=ulaw_8000"));
    }

    #[test]
    fn test_pcm_formats_require_companding() {
        let mut config = TtsConfig::default();
        assert!(!config.needs_companding());
        config.output_format = "pcm_16000".to_string();
        assert!(config.needs_companding());
    }

    #[test]
    fn test_new_validates_config() {
        assert!(matches!(
            SynthesisClient::new(TtsConfig::default()),
            Err(TtsError::ConfigurationError(_))
        ));

        let no_voice = TtsConfig {
            api_key: "key".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            SynthesisClient::new(no_voice),
            Err(TtsError::ConfigurationError(_))
        ));

        let ok = TtsConfig {
            api_key: "key".to_string(),
            voice_id: "river".to_string(),
            ..Default::default()
        };
        assert!(SynthesisClient::new(ok).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_is_visible_on_handle() {
        let client = SynthesisClient::new(TtsConfig {
            api_key: "key".to_string(),
            voice_id: "river".to_string(),
            // Unroutable endpoint; the handle is cancelled before any dial matters
            endpoint: "wss://127.0.0.1:1/v1/text-to-speech".to_string(),
            ..Default::default()
        })
        .unwrap();

        let (event_tx, _event_rx) = mpsc::channel(8);
        let handle = client.speak("hello", event_tx);
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
        handle.join().await;
    }
}

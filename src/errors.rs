//! Error taxonomy for the orchestrator.
//!
//! Each subsystem carries its own error enum; `SessionError` is the
//! umbrella the call session surfaces. Policy lives with the call site:
//! transient stream failures trigger buffered reconnects, inference
//! failures degrade to a fixed spoken apology, ledger and persistence
//! failures are logged and never abort an in-progress call.

use thiserror::Error;

/// Errors raised by the telephony media-stream adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A frame that could not be parsed as a media-stream message
    #[error("Malformed media-stream frame: {0}")]
    MalformedFrame(String),

    /// The telephony socket closed without a `stop` frame
    #[error("Unexpected media-stream close: {0}")]
    UnexpectedClose(String),

    /// Failed to write an outbound frame
    #[error("Failed to send media-stream frame: {0}")]
    SendFailed(String),

    /// Audio payload was not valid base64
    #[error("Invalid audio payload: {0}")]
    InvalidPayload(String),
}

/// Errors raised by the transcription stream client.
#[derive(Debug, Error)]
pub enum SttError {
    /// WebSocket handshake failed or timed out
    #[error("Recognition connect failed: {0}")]
    ConnectFailed(String),

    /// Provider rejected the configured credentials
    #[error("Recognition authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Provider sent a message we could not parse
    #[error("Recognition protocol error: {0}")]
    ProtocolError(String),

    /// Send or receive on an established connection failed
    #[error("Recognition network error: {0}")]
    NetworkError(String),

    /// Bounded reconnect attempts were exhausted
    #[error("Recognition reconnect exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Invalid client configuration
    #[error("Recognition configuration error: {0}")]
    ConfigurationError(String),
}

/// Errors raised by the synthesis stream client.
#[derive(Debug, Error)]
pub enum TtsError {
    /// WebSocket handshake failed or timed out
    #[error("Synthesis connect failed: {0}")]
    ConnectFailed(String),

    /// Provider sent a message we could not parse
    #[error("Synthesis protocol error: {0}")]
    ProtocolError(String),

    /// Send or receive on an established connection failed
    #[error("Synthesis network error: {0}")]
    NetworkError(String),

    /// The stream was cancelled mid-response (barge-in)
    #[error("Synthesis cancelled")]
    Cancelled,

    /// Invalid client configuration
    #[error("Synthesis configuration error: {0}")]
    ConfigurationError(String),
}

/// Errors raised by the response generator.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The inference provider did not answer within the budget
    #[error("Generation timed out after {0}ms")]
    Timeout(u64),

    /// The inference provider returned an error
    #[error("Generation failed: {0}")]
    Failed(String),

    /// The completion payload was missing expected fields
    #[error("Invalid completion payload: {0}")]
    InvalidResponse(String),

    /// The speculative job was cancelled before completion
    #[error("Generation cancelled")]
    Cancelled,
}

/// Umbrella error for a call session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Stt(#[from] SttError),

    #[error(transparent)]
    Tts(#[from] TtsError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    /// Writing usage events to the credit ledger failed
    #[error("Ledger write failed: {0}")]
    LedgerWrite(String),

    /// Persisting the call record failed
    #[error("Call record persistence failed: {0}")]
    Persistence(String),

    /// Session-level configuration problem
    #[error("Session configuration error: {0}")]
    Configuration(String),
}

/// Result alias used throughout the session code.
pub type SessionResult<T> = Result<T, SessionError>;

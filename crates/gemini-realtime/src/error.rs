use thiserror::Error;

/// Errors surfaced by the live session engine.
///
/// Tool failures and declined confirmations never appear here; they are
/// answered to the model. Session expiry is handled by silent renewal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LiveError {
    #[error("failed to connect to the live endpoint: {0}")]
    Connection(String),
    #[error("session setup rejected (code {code}): {reason}")]
    HandshakeRejected { code: u16, reason: String },
    #[error("live connection lost: {0}")]
    FatalTransport(String),
    #[error("malformed frame: {0}")]
    Protocol(String),
    #[error("audio device error: {0}")]
    Audio(String),
    #[error("session is closed")]
    Closed,
}

/// Errors from capture and playback devices or the resampler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("audio device unavailable: {0}")]
    Device(String),
    #[error("resampler error: {0}")]
    Resampler(String),
}

impl From<AudioError> for LiveError {
    fn from(e: AudioError) -> Self {
        LiveError::Audio(e.to_string())
    }
}

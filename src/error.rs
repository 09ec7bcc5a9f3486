use std::time::Duration;
use thiserror::Error;

/// Failure modes of the platform capability boundary. The engine branches
/// on these exhaustively: everything except `AuthRejected` is retryable.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transient network failure: {0}")]
    Transient(String),
    /// The platform refused our credential. Never retried automatically:
    /// hammering with a dead token risks a lockout.
    #[error("authorization rejected by the platform")]
    AuthRejected,
    #[error("malformed platform response: {0}")]
    BadResponse(String),
}

impl PlatformError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PlatformError::AuthRejected)
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PlatformError::Timeout(Duration::from_secs(0))
        } else if err.status().map(|s| s.as_u16() == 401).unwrap_or(false) {
            PlatformError::AuthRejected
        } else if err.is_decode() {
            PlatformError::BadResponse(err.to_string())
        } else {
            PlatformError::Transient(err.to_string())
        }
    }
}

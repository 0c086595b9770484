/*
[INPUT]:  Error sources (transport, authorization, correlation, venue replies)
[OUTPUT]: Structured error types with retry/fatality hints
[POS]:    Error handling layer - unified error types for entire crate
[UPDATE]: When adding new error sources or improving error messages
*/

use std::time::Duration;

use thiserror::Error;

/// Main error type for the Deriv adapter
#[derive(Error, Debug)]
pub enum DerivError {
    /// Transport could not be established (DNS, TLS or WebSocket handshake)
    #[error("connection failed: {0}")]
    Connect(String),

    /// Operation attempted without an open session
    #[error("not connected")]
    NotConnected,

    /// The venue rejected the authorize handshake. Fatal: credentials must
    /// be fixed and the session reopened manually.
    #[error("authorization rejected (code {code}): {message}")]
    AuthRejected { code: String, message: String },

    /// The venue requires authorization for this request
    #[error("request requires authorization")]
    AuthRequired,

    /// No reply arrived before the deadline. The outcome is ambiguous: the
    /// venue may still have processed the request.
    #[error("no reply within {after:?} (outcome ambiguous)")]
    Timeout { after: Duration },

    /// The session died while the request was in flight
    #[error("connection lost while the request was in flight")]
    ConnectionLost,

    /// The reconnect budget is exhausted; the session must be reopened
    /// explicitly.
    #[error("connection unavailable after {attempts} reconnect attempts")]
    ConnectionUnavailable { attempts: u32 },

    /// Malformed or unexpected frame. Never fatal to the session.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Structured venue-level error echoed on a reply. Request-scoped.
    #[error("venue error (code {code}): {message}")]
    Upstream { code: String, message: String },

    /// Serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Endpoint URL parsing failed
    #[error("invalid endpoint: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl DerivError {
    /// Check if the error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DerivError::Connect(_)
                | DerivError::NotConnected
                | DerivError::Timeout { .. }
                | DerivError::ConnectionLost
        )
    }

    /// Check if the error requires manual intervention before the session
    /// can be used again
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DerivError::AuthRejected { .. } | DerivError::ConnectionUnavailable { .. }
        )
    }
}

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, DerivError>;

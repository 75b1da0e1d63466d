//! Negotiation engine error types.
//!
//! # Error Classification
//!
//! | Variant              | Raised when                                         | Handling                        |
//! |----------------------|-----------------------------------------------------|---------------------------------|
//! | `ProtocolViolation`  | malformed or out-of-order action                    | logged, message ignored         |
//! | `UnsupportedNamespace` | no codec/provider registered for a namespace      | content fails, peer informed    |
//! | `Transport`          | candidate/proxy establishment failed                | blacklist + retry, or terminal  |
//! | `StateConflict`      | action for a terminated session, illegal transition | ignored, never resurrects       |
//! | `Timeout`            | pending action never acknowledged                   | treated per action kind         |
//!
//! Nothing reachable from attacker-controlled input panics; every malformed
//! path ends in one of these variants.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::transport::TransportFailure;

/// Negotiation engine errors.
#[derive(Error, Debug)]
pub enum JingleError {
    /// Malformed or out-of-order action from the peer or the application.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// No codec, provider or key transport registered for a namespace.
    #[error("Unsupported namespace: {0}")]
    UnsupportedNamespace(String),

    /// Transport establishment failed.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportFailure),

    /// Action not legal in the session's current state.
    #[error("State conflict: {0}")]
    StateConflict(String),

    /// A pending action was never acknowledged.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// No session with this id on the connection.
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// No content with this name in the session.
    #[error("Unknown content: {0}")]
    UnknownContent(String),

    /// Invalid peer address.
    #[error("Invalid address: {0}")]
    InvalidJid(String),

    /// Stanza could not be handed to the connection.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Cryptographic operation failed.
    ///
    /// Preserves the full chain via `#[source]`.
    #[error("Crypto error: {0}")]
    Crypto(#[source] CryptoError),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for negotiation operations
pub type Result<T> = std::result::Result<T, JingleError>;

impl From<CryptoError> for JingleError {
    fn from(err: CryptoError) -> Self {
        JingleError::Crypto(err)
    }
}

impl From<toml::de::Error> for JingleError {
    fn from(err: toml::de::Error) -> Self {
        JingleError::Config(err.to_string())
    }
}

impl From<base64::DecodeError> for JingleError {
    fn from(err: base64::DecodeError) -> Self {
        JingleError::ProtocolViolation(format!("Base64 decode error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_error_keeps_source() {
        use std::error::Error;

        let err: JingleError = CryptoError::WrongMode("encrypt on a decrypt unit").into();
        assert!(matches!(err, JingleError::Crypto(_)));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_transport_failure_conversion() {
        let err: JingleError = TransportFailure::CandidateError("all refused".to_string()).into();
        assert!(err.to_string().contains("all refused"));
    }
}

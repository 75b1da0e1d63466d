//! Unified cryptographic error type.
//!
//! Two families:
//!
//! - **Invalid input**: wrong key length, tampered frame, unknown cipher or
//!   key transport. The peer (or caller) handed us something we cannot use;
//!   retrying without new input is pointless.
//! - **Environment**: the system RNG failed. Rare, but fatal for key
//!   generation.

use thiserror::Error;

/// Errors from keyring operations
#[derive(Debug, Error)]
pub enum KeyringError {
    /// No master secret registered for the peer
    #[error("No key for peer: {0}")]
    KeyNotFound(String),

    /// Invalid key material
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    DerivationFailed(String),
}

/// Unified error type for all cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key or IV has the wrong shape.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Operation not allowed in the unit's fixed mode.
    #[error("Wrong cipher mode: {0}")]
    WrongMode(&'static str),

    /// Sealing failed.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Opening failed (tag mismatch or corrupted data).
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Frame longer than the protocol allows.
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Frame counter would wrap and reuse a nonce.
    #[error("Nonce space exhausted")]
    NonceExhausted,

    /// Cipher namespace not supported.
    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(String),

    /// Key-transport namespace not registered.
    #[error("Unsupported key transport: {0}")]
    UnsupportedKeyTransport(String),

    /// Key-transport payload could not be parsed.
    #[error("Malformed key transport payload: {0}")]
    MalformedKeyTransport(String),

    /// Keyring lookup or derivation failed.
    #[error("Keyring: {0}")]
    Keyring(#[source] KeyringError),

    /// System RNG failure.
    #[error("RNG failure: {0}")]
    Rng(String),
}

impl From<KeyringError> for CryptoError {
    fn from(err: KeyringError) -> Self {
        CryptoError::Keyring(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyring_error_conversion() {
        use std::error::Error;

        let err: CryptoError = KeyringError::KeyNotFound("juliet@capulet.lit".to_string()).into();
        assert!(matches!(err, CryptoError::Keyring(_)));
        assert!(err
            .source()
            .map(|s| s.to_string().contains("juliet"))
            .unwrap_or(false));
    }
}

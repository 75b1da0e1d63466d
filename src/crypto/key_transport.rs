//! Key-transport codecs: how `key || iv` travels inside a Security element.
//!
//! The Security element names a key-transport namespace; the receiver looks
//! it up here. An unknown namespace is an error, never a reason to fall back
//! to plaintext.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{json, Value};

use super::error::CryptoError;
use super::keyring::{KeyMaterial, Keyring};
use super::{IV_SIZE, NS_JET_PSK, TAG_SIZE};
use crate::jid::Jid;

/// Encodes and decodes transported cipher keys for one namespace.
pub trait KeyTransport: Send + Sync {
    /// Namespace this codec handles
    fn namespace(&self) -> &str;

    /// Wrap `key_and_iv` for delivery from `ours` to `peer`
    fn encode(&self, key_and_iv: &KeyMaterial, ours: &Jid, peer: &Jid) -> Result<Value, CryptoError>;

    /// Unwrap a payload sent to `ours` by `peer`
    fn decode(&self, payload: &Value, ours: &Jid, peer: &Jid) -> Result<KeyMaterial, CryptoError>;
}

/// Namespace → key-transport codec, immutable once handed to the engine
#[derive(Clone, Default)]
pub struct KeyTransportRegistry {
    codecs: HashMap<String, Arc<dyn KeyTransport>>,
}

impl KeyTransportRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec under its own namespace
    pub fn with(mut self, codec: Arc<dyn KeyTransport>) -> Self {
        self.codecs.insert(codec.namespace().to_string(), codec);
        self
    }

    /// Look up a codec
    pub fn get(&self, namespace: &str) -> Result<&Arc<dyn KeyTransport>, CryptoError> {
        self.codecs
            .get(namespace)
            .ok_or_else(|| CryptoError::UnsupportedKeyTransport(namespace.to_string()))
    }

    /// Check whether a namespace is registered
    pub fn supports(&self, namespace: &str) -> bool {
        self.codecs.contains_key(namespace)
    }

    /// Registered namespaces
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.codecs.keys().map(String::as_str)
    }
}

impl fmt::Debug for KeyTransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.codecs.keys()).finish()
    }
}

/// Seals `key || iv` under a wrapping key derived from a secret shared
/// out-of-band with the peer.
///
/// Payload: `{ "sealed": base64(nonce || ciphertext || tag) }`, with the
/// namespace bound in as associated data.
#[derive(Debug, Clone)]
pub struct PskKeyTransport {
    keyring: Keyring,
}

impl PskKeyTransport {
    /// Create a codec over the given keyring
    pub fn new(keyring: Keyring) -> Self {
        Self { keyring }
    }

    fn cipher(&self, ours: &Jid, peer: &Jid) -> Result<ChaCha20Poly1305, CryptoError> {
        let wrapping = self.keyring.wrapping_key(ours, peer)?;
        ChaCha20Poly1305::new_from_slice(wrapping.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }
}

impl KeyTransport for PskKeyTransport {
    fn namespace(&self) -> &str {
        NS_JET_PSK
    }

    fn encode(&self, key_and_iv: &KeyMaterial, ours: &Jid, peer: &Jid) -> Result<Value, CryptoError> {
        let cipher = self.cipher(ours, peer)?;

        let mut nonce = [0u8; IV_SIZE];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| CryptoError::Rng(e.to_string()))?;

        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: key_and_iv.as_bytes(),
                    aad: NS_JET_PSK.as_bytes(),
                },
            )
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut wire = Vec::with_capacity(IV_SIZE + sealed.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&sealed);

        Ok(json!({ "sealed": BASE64.encode(wire) }))
    }

    fn decode(&self, payload: &Value, ours: &Jid, peer: &Jid) -> Result<KeyMaterial, CryptoError> {
        let encoded = payload
            .get("sealed")
            .and_then(Value::as_str)
            .ok_or_else(|| CryptoError::MalformedKeyTransport("missing 'sealed'".to_string()))?;
        let wire = BASE64
            .decode(encoded)
            .map_err(|e| CryptoError::MalformedKeyTransport(e.to_string()))?;
        if wire.len() < IV_SIZE + TAG_SIZE {
            return Err(CryptoError::MalformedKeyTransport("payload too short".to_string()));
        }

        let cipher = self.cipher(ours, peer)?;
        let (nonce, sealed) = wire.split_at(IV_SIZE);
        let opened = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: NS_JET_PSK.as_bytes(),
                },
            )
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        Ok(KeyMaterial::new(opened))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherKind, CipherUnit};

    fn romeo() -> Jid {
        Jid::parse("romeo@montague.lit/orchard").unwrap()
    }

    fn juliet() -> Jid {
        Jid::parse("juliet@capulet.lit/balcony").unwrap()
    }

    fn codecs(secret: u8) -> (PskKeyTransport, PskKeyTransport) {
        let shared = KeyMaterial::new(vec![secret; 32]);
        (
            PskKeyTransport::new(Keyring::new().with_peer(&juliet(), shared.clone())),
            PskKeyTransport::new(Keyring::new().with_peer(&romeo(), shared)),
        )
    }

    #[test]
    fn test_transported_key_rebuilds_cipher() {
        let (romeo_codec, juliet_codec) = codecs(9);
        let mut enc = CipherUnit::generate(CipherKind::default()).unwrap();

        let payload = romeo_codec.encode(&enc.key_and_iv(), &romeo(), &juliet()).unwrap();
        let key_and_iv = juliet_codec.decode(&payload, &juliet(), &romeo()).unwrap();
        let mut dec = CipherUnit::from_key_and_iv(CipherKind::default(), &key_and_iv).unwrap();

        let ct = enc.encrypt(b"balcony").unwrap();
        assert_eq!(dec.decrypt(&ct).unwrap(), b"balcony");
    }

    #[test]
    fn test_wrong_secret_fails() {
        let (romeo_codec, _) = codecs(1);
        let (_, juliet_codec) = codecs(2);
        let key = KeyMaterial::new(vec![5u8; 44]);

        let payload = romeo_codec.encode(&key, &romeo(), &juliet()).unwrap();
        assert!(juliet_codec.decode(&payload, &juliet(), &romeo()).is_err());
    }

    #[test]
    fn test_malformed_payloads() {
        let (_, juliet_codec) = codecs(3);
        for payload in [json!({}), json!({"sealed": 7}), json!({"sealed": "!!"}), json!({"sealed": "AAAA"})] {
            assert!(juliet_codec.decode(&payload, &juliet(), &romeo()).is_err());
        }
    }

    #[test]
    fn test_registry_lookup() {
        let (codec, _) = codecs(4);
        let registry = KeyTransportRegistry::new().with(Arc::new(codec));
        assert!(registry.supports(NS_JET_PSK));
        assert!(registry.get(NS_JET_PSK).is_ok());
        assert!(matches!(
            registry.get("urn:example:unknown"),
            Err(CryptoError::UnsupportedKeyTransport(_))
        ));
    }
}

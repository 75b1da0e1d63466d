//! Pre-shared secrets and key derivation for key transport.
//!
//! Uses HKDF-SHA256 to derive a per-pair wrapping key from the master secret
//! both peers hold.

use std::collections::HashMap;
use std::fmt;

use zeroize::Zeroize;

use super::error::KeyringError;
use crate::jid::Jid;

/// Secret bytes, zeroized on drop and redacted in debug output
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    bytes: Vec<u8>,
}

impl KeyMaterial {
    /// Create new key material from bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the key length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the key is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Derive a new key using HKDF-SHA256
    pub fn derive(&self, info: &[u8], output_len: usize) -> Result<KeyMaterial, KeyringError> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        if self.bytes.is_empty() {
            return Err(KeyringError::InvalidKey("empty master secret".to_string()));
        }

        let hk = Hkdf::<Sha256>::new(None, &self.bytes);
        let mut okm = vec![0u8; output_len];

        hk.expand(info, &mut okm)
            .map_err(|e| KeyringError::DerivationFailed(format!("HKDF expand failed: {}", e)))?;

        Ok(KeyMaterial::new(okm))
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial([REDACTED, {} bytes])", self.bytes.len())
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Master secrets shared with individual peers, keyed by bare address
#[derive(Debug, Default, Clone)]
pub struct Keyring {
    secrets: HashMap<String, KeyMaterial>,
}

impl Keyring {
    /// Create a new empty keyring
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the master secret shared with `peer`
    pub fn add_peer(&mut self, peer: &Jid, secret: KeyMaterial) {
        self.secrets.insert(peer.bare().to_string(), secret);
    }

    /// Builder form of [`Keyring::add_peer`]
    pub fn with_peer(mut self, peer: &Jid, secret: KeyMaterial) -> Self {
        self.add_peer(peer, secret);
        self
    }

    /// Forget the secret shared with `peer`
    pub fn remove_peer(&mut self, peer: &Jid) -> Option<KeyMaterial> {
        self.secrets.remove(peer.bare())
    }

    /// Check if the keyring is empty
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Get the number of peers
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Derive the key that wraps transported cipher keys between `ours` and
    /// `peer`. Both sides derive the same key: the info string orders the
    /// two bare addresses.
    pub fn wrapping_key(&self, ours: &Jid, peer: &Jid) -> Result<KeyMaterial, KeyringError> {
        let master = self
            .secrets
            .get(peer.bare())
            .ok_or_else(|| KeyringError::KeyNotFound(peer.bare().to_string()))?;

        let (lo, hi) = if ours.bare() <= peer.bare() {
            (ours.bare(), peer.bare())
        } else {
            (peer.bare(), ours.bare())
        };
        let info = format!("jet-psk/v1|{}|{}", lo, hi);
        master.derive(info.as_bytes(), super::KEY_SIZE)
    }
}

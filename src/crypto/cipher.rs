//! The cipher unit: one key, one IV, one direction.

use std::fmt;

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;

use super::error::CryptoError;
use super::keyring::KeyMaterial;
use super::{IV_SIZE, KEY_SIZE};

/// Supported AEAD ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CipherKind {
    /// ChaCha20-Poly1305 (default)
    #[default]
    ChaCha20Poly1305,
    /// AES-256 in GCM mode
    Aes256Gcm,
}

impl CipherKind {
    /// Wire namespace of this cipher
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::ChaCha20Poly1305 => "urn:xmpp:ciphers:chacha20-poly1305",
            Self::Aes256Gcm => "urn:xmpp:ciphers:aes-256-gcm-nopadding:0",
        }
    }

    /// Resolve a wire namespace
    pub fn from_namespace(ns: &str) -> Result<Self, CryptoError> {
        match ns {
            "urn:xmpp:ciphers:chacha20-poly1305" => Ok(Self::ChaCha20Poly1305),
            "urn:xmpp:ciphers:aes-256-gcm-nopadding:0" => Ok(Self::Aes256Gcm),
            other => Err(CryptoError::UnsupportedCipher(other.to_string())),
        }
    }
}

impl std::str::FromStr for CipherKind {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chacha20-poly1305" | "chacha20poly1305" | "chacha" => Ok(Self::ChaCha20Poly1305),
            "aes-256-gcm" | "aes256gcm" | "aes" => Ok(Self::Aes256Gcm),
            _ => Self::from_namespace(s),
        }
    }
}

/// Direction a unit was built for. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// Freshly generated key; seals outgoing frames
    Encrypt,
    /// Key supplied by the peer; opens incoming frames
    Decrypt,
}

enum Aead256 {
    ChaCha(ChaCha20Poly1305),
    Aes(Box<Aes256Gcm>),
}

/// Symmetric AEAD state for one content channel.
///
/// Build with [`CipherUnit::generate`] on the sending side and
/// [`CipherUnit::from_key_and_iv`] on the receiving side. There is no way
/// to change mode or rotate the key afterwards.
pub struct CipherUnit {
    kind: CipherKind,
    mode: CipherMode,
    key: KeyMaterial,
    iv: [u8; IV_SIZE],
    aead: Aead256,
    counter: u64,
}

impl CipherUnit {
    /// Generate a fresh key and IV from the OS RNG (encrypt direction)
    pub fn generate(kind: CipherKind) -> Result<Self, CryptoError> {
        let mut key = vec![0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];
        OsRng
            .try_fill_bytes(&mut key)
            .map_err(|e| CryptoError::Rng(e.to_string()))?;
        OsRng
            .try_fill_bytes(&mut iv)
            .map_err(|e| CryptoError::Rng(e.to_string()))?;

        Self::build(kind, CipherMode::Encrypt, KeyMaterial::new(key), iv)
    }

    /// Rebuild the peer's unit from transported `key || iv` (decrypt direction)
    pub fn from_key_and_iv(kind: CipherKind, key_and_iv: &KeyMaterial) -> Result<Self, CryptoError> {
        let bytes = key_and_iv.as_bytes();
        if bytes.len() != KEY_SIZE + IV_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "key and iv must be {} bytes, got {}",
                KEY_SIZE + IV_SIZE,
                bytes.len()
            )));
        }

        let key = KeyMaterial::new(bytes[..KEY_SIZE].to_vec());
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&bytes[KEY_SIZE..]);

        Self::build(kind, CipherMode::Decrypt, key, iv)
    }

    fn build(
        kind: CipherKind,
        mode: CipherMode,
        key: KeyMaterial,
        iv: [u8; IV_SIZE],
    ) -> Result<Self, CryptoError> {
        let aead = match kind {
            CipherKind::ChaCha20Poly1305 => Aead256::ChaCha(
                ChaCha20Poly1305::new_from_slice(key.as_bytes())
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
            ),
            CipherKind::Aes256Gcm => Aead256::Aes(Box::new(
                Aes256Gcm::new_from_slice(key.as_bytes())
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
            )),
        };

        Ok(Self {
            kind,
            mode,
            key,
            iv,
            aead,
            counter: 0,
        })
    }

    /// Cipher in use
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Fixed direction
    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    /// Key length in bits
    pub fn length(&self) -> usize {
        self.key.len() * 8
    }

    /// The symmetric key
    pub fn key(&self) -> &KeyMaterial {
        &self.key
    }

    /// The base IV
    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// `key || iv`, the payload handed to the key transport
    pub fn key_and_iv(&self) -> KeyMaterial {
        let mut bytes = Vec::with_capacity(KEY_SIZE + IV_SIZE);
        bytes.extend_from_slice(self.key.as_bytes());
        bytes.extend_from_slice(&self.iv);
        KeyMaterial::new(bytes)
    }

    /// Frames processed so far
    pub fn frames(&self) -> u64 {
        self.counter
    }

    fn next_nonce(&mut self) -> Result<[u8; IV_SIZE], CryptoError> {
        let counter = self.counter;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::NonceExhausted)?;

        let mut nonce = self.iv;
        for (slot, byte) in nonce[IV_SIZE - 8..].iter_mut().zip(counter.to_be_bytes()) {
            *slot ^= byte;
        }
        Ok(nonce)
    }

    /// Seal the next frame. Only valid in [`CipherMode::Encrypt`].
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.mode != CipherMode::Encrypt {
            return Err(CryptoError::WrongMode("encrypt on a decrypt unit"));
        }
        let nonce = self.next_nonce()?;

        match &self.aead {
            Aead256::ChaCha(cipher) => cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
                .map_err(|e| CryptoError::EncryptionFailed(e.to_string())),
            Aead256::Aes(cipher) => cipher
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
                .map_err(|e| CryptoError::EncryptionFailed(e.to_string())),
        }
    }

    /// Open the next frame. Only valid in [`CipherMode::Decrypt`].
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.mode != CipherMode::Decrypt {
            return Err(CryptoError::WrongMode("decrypt on an encrypt unit"));
        }
        if ciphertext.len() < super::TAG_SIZE {
            return Err(CryptoError::DecryptionFailed("frame shorter than tag".to_string()));
        }
        let nonce = self.next_nonce()?;

        match &self.aead {
            Aead256::ChaCha(cipher) => cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(&nonce), ciphertext)
                .map_err(|e| CryptoError::DecryptionFailed(e.to_string())),
            Aead256::Aes(cipher) => cipher
                .decrypt(aes_gcm::Nonce::from_slice(&nonce), ciphertext)
                .map_err(|e| CryptoError::DecryptionFailed(e.to_string())),
        }
    }
}

impl fmt::Debug for CipherUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherUnit")
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("key", &self.key)
            .field("frames", &self.counter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pair(kind: CipherKind) -> (CipherUnit, CipherUnit) {
        let enc = CipherUnit::generate(kind).unwrap();
        let dec = CipherUnit::from_key_and_iv(kind, &enc.key_and_iv()).unwrap();
        (enc, dec)
    }

    #[test]
    fn test_roundtrip_both_ciphers() {
        for kind in [CipherKind::ChaCha20Poly1305, CipherKind::Aes256Gcm] {
            let (mut enc, mut dec) = pair(kind);
            for frame in [&b"first"[..], b"", b"third frame"] {
                let ct = enc.encrypt(frame).unwrap();
                assert_eq!(dec.decrypt(&ct).unwrap(), frame);
            }
            assert_eq!(enc.frames(), 3);
            assert_eq!(dec.frames(), 3);
        }
    }

    #[test]
    fn test_fresh_units_are_distinct() {
        let a = CipherUnit::generate(CipherKind::default()).unwrap();
        let b = CipherUnit::generate(CipherKind::default()).unwrap();
        assert_ne!(a.key_and_iv().as_bytes(), b.key_and_iv().as_bytes());

        let (mut a, _) = pair(CipherKind::default());
        let (mut b, _) = pair(CipherKind::default());
        assert_ne!(a.encrypt(b"same").unwrap(), b.encrypt(b"same").unwrap());
    }

    #[test]
    fn test_mode_is_fixed() {
        let (mut enc, mut dec) = pair(CipherKind::default());
        assert_eq!(enc.mode(), CipherMode::Encrypt);
        assert_eq!(dec.mode(), CipherMode::Decrypt);
        assert!(matches!(enc.decrypt(&[0u8; 32]), Err(CryptoError::WrongMode(_))));
        assert!(matches!(dec.encrypt(b"x"), Err(CryptoError::WrongMode(_))));
    }

    #[test]
    fn test_tamper_detection() {
        let (mut enc, mut dec) = pair(CipherKind::default());
        let mut ct = enc.encrypt(b"Hello, World!").unwrap();
        ct[1] ^= 0xFF;
        assert!(dec.decrypt(&ct).is_err());
    }

    #[test]
    fn test_out_of_order_frames_fail() {
        let (mut enc, mut dec) = pair(CipherKind::default());
        let _first = enc.encrypt(b"one").unwrap();
        let second = enc.encrypt(b"two").unwrap();
        assert!(dec.decrypt(&second).is_err());
    }

    #[test]
    fn test_key_length_and_layout() {
        let enc = CipherUnit::generate(CipherKind::Aes256Gcm).unwrap();
        assert_eq!(enc.length(), 256);
        let key_and_iv = enc.key_and_iv();
        assert_eq!(key_and_iv.len(), KEY_SIZE + IV_SIZE);
        assert_eq!(&key_and_iv.as_bytes()[..KEY_SIZE], enc.key().as_bytes());
        assert_eq!(&key_and_iv.as_bytes()[KEY_SIZE..], enc.iv());
    }

    #[test]
    fn test_rejects_short_key() {
        let result = CipherUnit::from_key_and_iv(CipherKind::default(), &KeyMaterial::new(vec![0; 16]));
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_cipher_namespaces() {
        for kind in [CipherKind::ChaCha20Poly1305, CipherKind::Aes256Gcm] {
            assert_eq!(CipherKind::from_namespace(kind.namespace()).unwrap(), kind);
        }
        assert!(CipherKind::from_namespace("urn:example:rot13").is_err());
        assert_eq!("aes".parse::<CipherKind>().unwrap(), CipherKind::Aes256Gcm);
    }

    proptest! {
        #[test]
        fn prop_decrypt_inverts_encrypt(
            frames in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..512), 1..8),
            aes in any::<bool>(),
        ) {
            let kind = if aes { CipherKind::Aes256Gcm } else { CipherKind::ChaCha20Poly1305 };
            let (mut enc, mut dec) = pair(kind);
            for frame in &frames {
                let ct = enc.encrypt(frame).unwrap();
                prop_assert_eq!(&dec.decrypt(&ct).unwrap(), frame);
            }
        }
    }
}

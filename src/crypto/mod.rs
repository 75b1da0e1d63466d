//! Encrypted transports for negotiated contents.
//!
//! A content that carries a Security element never hands its raw byte
//! channel to the application. The data sender generates a fresh
//! [`CipherUnit`], ships `key || iv` to the peer through a key-transport
//! codec, and seals every frame it writes; the receiver rebuilds the unit
//! from the transported key and opens every frame it reads.
//!
//! ```text
//! Sender                                             Receiver
//!   CipherUnit::generate()                             |
//!   key_and_iv ──[KeyTransport::encode]──> security ──>[KeyTransport::decode]
//!   |                                                  CipherUnit::from_key_and_iv()
//!   SecureChannel::send ══ len | seal(frame_i) ══════> SecureChannel::recv
//! ```
//!
//! # Ciphers
//!
//! | Cipher             | Namespace                                   |
//! |--------------------|---------------------------------------------|
//! | ChaCha20-Poly1305  | `urn:xmpp:ciphers:chacha20-poly1305`        |
//! | AES-256-GCM        | `urn:xmpp:ciphers:aes-256-gcm-nopadding:0`  |
//!
//! # Nonces
//!
//! Frame `i` is sealed under `iv XOR be64(i)` (folded into the last eight
//! IV bytes). A unit is used for exactly one direction of one channel, so
//! the counter never repeats under one key.

mod cipher;
mod error;
mod key_transport;
mod keyring;
mod stream;

pub use cipher::{CipherKind, CipherMode, CipherUnit};
pub use error::{CryptoError, KeyringError};
pub use key_transport::{KeyTransport, KeyTransportRegistry, PskKeyTransport};
pub use keyring::{KeyMaterial, Keyring};
pub use stream::SecureChannel;

/// Key size for both supported ciphers (256 bits)
pub const KEY_SIZE: usize = 32;

/// IV / nonce size (96 bits)
pub const IV_SIZE: usize = 12;

/// Authentication tag size (128 bits)
pub const TAG_SIZE: usize = 16;

/// Largest plaintext sealed into one frame
pub const MAX_FRAME_PLAINTEXT: usize = 16 * 1024;

/// Namespace of the pre-shared-key key transport
pub const NS_JET_PSK: &str = "urn:xmpp:jingle:jet-psk:0";

//! AEAD framing over a raw byte channel.
//!
//! Wire format:
//!
//! ```text
//! +----------------+-------------------------------+
//! | len: u32 (BE)  | seal(frame_i) (len bytes)     |   data frames, never empty
//! +----------------+-------------------------------+
//! | len: u32 (BE)  | seal(empty)                   |   end of stream
//! +----------------+-------------------------------+
//! ```
//!
//! The end-of-stream frame is sealed under the next frame counter like any
//! other, so a stream cut short on the wire fails to open instead of
//! reading as a complete transfer.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::cipher::{CipherMode, CipherUnit};
use super::error::CryptoError;
use super::{MAX_FRAME_PLAINTEXT, TAG_SIZE};
use crate::error::{JingleError, Result};
use crate::transport::Channel;

/// One direction of an encrypted content channel.
///
/// Built in encrypt mode it only writes; in decrypt mode it only reads. The
/// unit inside never changes.
pub struct SecureChannel {
    inner: Channel,
    cipher: CipherUnit,
    finished: bool,
}

impl SecureChannel {
    /// Wrap a raw channel with a cipher unit
    pub fn new(inner: Channel, cipher: CipherUnit) -> Self {
        Self {
            inner,
            cipher,
            finished: false,
        }
    }

    /// Direction of this channel
    pub fn mode(&self) -> CipherMode {
        self.cipher.mode()
    }

    /// Seal and write `data`, split into frames of at most
    /// [`MAX_FRAME_PLAINTEXT`] bytes.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.finished {
            return Err(JingleError::StateConflict("send after shutdown".to_string()));
        }
        for chunk in data.chunks(MAX_FRAME_PLAINTEXT) {
            self.write_frame(chunk).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    async fn write_frame(&mut self, plaintext: &[u8]) -> Result<()> {
        let sealed = self.cipher.encrypt(plaintext)?;
        let len = u32::try_from(sealed.len()).map_err(|_| CryptoError::FrameTooLarge(sealed.len()))?;
        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(&sealed).await?;
        Ok(())
    }

    /// Read and open the next frame. `None` once the sender's end-of-stream
    /// frame has been opened; a stream that ends before it is an error.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.cipher.mode() != CipherMode::Decrypt {
            return Err(CryptoError::WrongMode("recv on an encrypting channel").into());
        }
        if self.finished {
            return Ok(None);
        }

        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                JingleError::ProtocolViolation("encrypted stream truncated".to_string())
            } else {
                e.into()
            }
        })?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_PLAINTEXT + TAG_SIZE {
            return Err(CryptoError::FrameTooLarge(len).into());
        }

        let mut sealed = vec![0u8; len];
        self.inner.read_exact(&mut sealed).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                JingleError::ProtocolViolation("stream ended inside a frame".to_string())
            } else {
                e.into()
            }
        })?;

        let frame = self.cipher.decrypt(&sealed)?;
        if frame.is_empty() {
            self.finished = true;
            return Ok(None);
        }
        Ok(Some(frame))
    }

    /// Seal the end-of-stream frame (encrypting side) and close the write
    /// side
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.cipher.mode() == CipherMode::Encrypt && !self.finished {
            self.write_frame(&[]).await?;
            self.finished = true;
        }
        self.inner.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherKind;

    fn pair() -> (SecureChannel, SecureChannel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let enc = CipherUnit::generate(CipherKind::default()).unwrap();
        let dec = CipherUnit::from_key_and_iv(CipherKind::default(), &enc.key_and_iv()).unwrap();
        (SecureChannel::new(Box::new(a), enc), SecureChannel::new(Box::new(b), dec))
    }

    #[tokio::test]
    async fn test_secure_channel_roundtrip() {
        let (mut tx, mut rx) = pair();
        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();

        let writer = tokio::spawn(async move {
            tx.send(&payload).await.unwrap();
            tx.shutdown().await.unwrap();
            payload
        });

        let mut received = Vec::new();
        while let Some(frame) = rx.recv().await.unwrap() {
            assert!(frame.len() <= MAX_FRAME_PLAINTEXT);
            received.extend_from_slice(&frame);
        }

        assert_eq!(received, writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_direction_enforced() {
        let (mut tx, mut rx) = pair();
        assert!(tx.recv().await.is_err());
        assert!(rx.send(b"nope").await.is_err());
    }

    /// Everything the sender puts on the wire for `payload`
    async fn sealed_wire(enc: CipherUnit, payload: &[u8]) -> Vec<u8> {
        let (a, mut b) = tokio::io::duplex(256 * 1024);
        let mut tx = SecureChannel::new(Box::new(a), enc);
        tx.send(payload).await.unwrap();
        tx.shutdown().await.unwrap();
        drop(tx);
        let mut wire = Vec::new();
        b.read_to_end(&mut wire).await.unwrap();
        wire
    }

    async fn receive(dec: CipherUnit, wire: &[u8]) -> Result<Vec<u8>> {
        let (mut a, b) = tokio::io::duplex(256 * 1024);
        a.write_all(wire).await.unwrap();
        drop(a);
        let mut rx = SecureChannel::new(Box::new(b), dec);
        let mut out = Vec::new();
        while let Some(frame) = rx.recv().await? {
            out.extend_from_slice(&frame);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_truncated_stream_is_not_a_clean_end() {
        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let enc = CipherUnit::generate(CipherKind::default()).unwrap();
        let key = enc.key_and_iv();
        let wire = sealed_wire(enc, &payload).await;
        let dec = || CipherUnit::from_key_and_iv(CipherKind::default(), &key).unwrap();

        assert_eq!(receive(dec(), &wire).await.unwrap(), payload);

        let first_frame = 4 + MAX_FRAME_PLAINTEXT + TAG_SIZE;
        let end_frame = 4 + TAG_SIZE;
        for keep in [first_frame, first_frame + 2, wire.len() - end_frame, 3] {
            let err = receive(dec(), &wire[..keep]).await.unwrap_err();
            assert!(matches!(err, JingleError::ProtocolViolation(_)), "cut at {keep}: {err:?}");
        }
    }

    #[tokio::test]
    async fn test_empty_transfer_ends_cleanly() {
        let enc = CipherUnit::generate(CipherKind::default()).unwrap();
        let key = enc.key_and_iv();
        let wire = sealed_wire(enc, &[]).await;
        assert_eq!(wire.len(), 4 + TAG_SIZE);
        let dec = CipherUnit::from_key_and_iv(CipherKind::default(), &key).unwrap();
        assert!(receive(dec, &wire).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (a, mut b) = tokio::io::duplex(1024);
        let enc = CipherUnit::generate(CipherKind::default()).unwrap();
        let dec = CipherUnit::from_key_and_iv(CipherKind::default(), &enc.key_and_iv()).unwrap();
        let mut rx = SecureChannel::new(Box::new(a), dec);

        b.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err = rx.recv().await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}

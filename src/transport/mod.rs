//! Transport channel providers.
//!
//! A provider turns a negotiated Transport descriptor into a live, ordered,
//! bidirectional byte [`Channel`]:
//!
//! - **In-band relay** ([`InBandProvider`]): bytes travel as base64 data
//!   packets over the signaling connection itself. Slow, always available.
//! - **Candidate socket** ([`SocketProvider`]): the offerer listens, the
//!   other side dials the advertised candidates in priority order.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            Negotiation Engine             │
//! │   (transport-agnostic: namespace only)    │
//! └──────────────────┬───────────────────────┘
//!                    │ ProviderRegistry::get(ns)
//!          ┌────────┴─────────┐
//!          ▼                  ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │ InBandProvider  │ │ SocketProvider  │
//! │ (data packets)  │ │ (TCP candidates)│
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! Establishment never runs on the dispatch path: the engine spawns the
//! future returned by [`ChannelProvider::open`] and aborts it when the
//! transport is replaced or the session ends. Reserved listeners are
//! dropped by [`ChannelProvider::release`]; streams a provider keeps running
//! on its own (the in-band pumps) are torn down by
//! [`ChannelProvider::close`] when the content leaves the session.

mod ibb;
mod socket;

pub use ibb::{InBandProvider, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_BLOCK_SIZE, ROUTE_CAPACITY};
pub use socket::{dst_hash, SocketProvider};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::Transport;
use crate::crypto::SecureChannel;
use crate::error::{JingleError, Result};
use crate::jid::Jid;
use crate::protocol::{DataPacket, Role};

/// Anything usable as a raw content channel.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// A raw, ordered, bidirectional byte channel
pub type Channel = Box<dyn ByteStream>;

/// Boxed establishment future
pub type OpenFuture = Pin<Box<dyn Future<Output = std::result::Result<Channel, TransportFailure>> + Send>>;

/// Why a transport could not be established.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportFailure {
    /// Only proxy candidates were reachable and proxy activation failed.
    #[error("Proxy error: {0}")]
    ProxyError(String),

    /// No candidate could be used.
    #[error("Candidate error: {0}")]
    CandidateError(String),

    /// The descriptor does not belong to this provider.
    #[error("Descriptor mismatch: {0}")]
    Mismatch(String),

    /// The stream failed after establishment.
    #[error("Stream error: {0}")]
    Stream(String),
}

/// Everything a provider needs to know about the content it serves.
#[derive(Debug, Clone)]
pub struct OpenContext {
    /// Session id
    pub sid: String,
    /// Content name
    pub content: String,
    /// Our role in the session
    pub role: Role,
    /// Whether we offered the current transport descriptor
    pub offerer: bool,
    /// Session initiator
    pub initiator: Jid,
    /// Session responder
    pub responder: Jid,
}

impl OpenContext {
    /// Our own address
    pub fn ours(&self) -> &Jid {
        match self.role {
            Role::Initiator => &self.initiator,
            Role::Responder => &self.responder,
        }
    }

    /// The peer's address
    pub fn peer(&self) -> &Jid {
        match self.role {
            Role::Initiator => &self.responder,
            Role::Responder => &self.initiator,
        }
    }
}

/// Strategy for one transport namespace.
pub trait ChannelProvider: Send + Sync {
    /// Namespace of the descriptors this provider understands
    fn namespace(&self) -> &'static str;

    /// Build a fresh local descriptor to offer to the peer.
    ///
    /// Providers that need local resources (listeners) reserve them here;
    /// they are released when [`open`](Self::open) completes or when
    /// [`release`](Self::release) is called.
    fn prepare(&self, ctx: &OpenContext) -> Result<Transport>;

    /// Establish the channel described by `transport`.
    ///
    /// Bookkeeping that must be in place before the peer's first packet
    /// arrives happens synchronously inside this call; the returned future
    /// does the waiting.
    fn open(&self, transport: &Transport, ctx: &OpenContext) -> OpenFuture;

    /// Drop anything reserved by [`prepare`](Self::prepare) for this content
    fn release(&self, _ctx: &OpenContext) {}

    /// The content is gone: release reservations and tear down any stream
    /// this provider still runs for it.
    fn close(&self, ctx: &OpenContext) {
        self.release(ctx);
    }

    /// Accept an in-band data packet. Returns `false` if the packet was not
    /// for this provider.
    fn deliver(&self, _packet: DataPacket) -> bool {
        false
    }
}

/// Namespace → provider, in preference order. Immutable once the engine is
/// built.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ChannelProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a provider; earlier registrations are preferred
    pub fn with(mut self, provider: Arc<dyn ChannelProvider>) -> Self {
        self.providers.retain(|p| p.namespace() != provider.namespace());
        self.providers.push(provider);
        self
    }

    /// Look up a provider by namespace
    pub fn get(&self, namespace: &str) -> Option<&Arc<dyn ChannelProvider>> {
        self.providers.iter().find(|p| p.namespace() == namespace)
    }

    /// Check whether a namespace is registered
    pub fn supports(&self, namespace: &str) -> bool {
        self.get(namespace).is_some()
    }

    /// Providers in preference order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ChannelProvider>> {
        self.providers.iter()
    }

    /// Namespaces in preference order
    pub fn namespaces(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.namespace()).collect()
    }

    /// First namespace, in preference order, accepted by `allowed`
    pub fn next_untried(&self, allowed: impl Fn(&str) -> bool) -> Option<&Arc<dyn ChannelProvider>> {
        self.providers.iter().find(|p| allowed(p.namespace()))
    }

    /// Hand an in-band data packet to whichever provider claims it
    pub fn deliver(&self, packet: DataPacket) -> bool {
        match self.get(&packet.namespace) {
            Some(provider) => provider.deliver(packet),
            None => false,
        }
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.namespaces()).finish()
    }
}

/// The channel handed to the application: raw, or wrapped in a cipher unit
/// when the content carries security.
pub enum ContentChannel {
    /// Unencrypted content
    Plain(Channel),
    /// Content with an encrypted transport
    Secure(SecureChannel),
}

impl ContentChannel {
    /// Whether reads/writes pass through a cipher unit
    pub fn is_secure(&self) -> bool {
        matches!(self, Self::Secure(_))
    }

    /// Write all of `data`
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(channel) => {
                channel.write_all(data).await?;
                channel.flush().await?;
                Ok(())
            },
            Self::Secure(channel) => channel.send(data).await,
        }
    }

    /// Read the next chunk. `None` at end of stream.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Plain(channel) => {
                let mut buf = vec![0u8; 16 * 1024];
                let n = channel.read(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(buf))
            },
            Self::Secure(channel) => channel.recv().await,
        }
    }

    /// Read until end of stream
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.recv().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Close our write side
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Self::Plain(channel) => channel.shutdown().await.map_err(JingleError::from),
            Self::Secure(channel) => channel.shutdown().await,
        }
    }
}

impl fmt::Debug for ContentChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("ContentChannel::Plain"),
            Self::Secure(channel) => write!(f, "ContentChannel::Secure({:?})", channel.mode()),
        }
    }
}

//! Candidate socket transport.
//!
//! The side that offered the descriptor binds a TCP listener when the
//! descriptor is prepared and advertises it (plus any configured proxies) as
//! candidates. The other side dials the candidates in descending priority
//! order, one connect per candidate, first success wins.
//!
//! Every connection starts with a handshake binding it to the stream:
//!
//! ```text
//! dialer                                 listener
//!   |--- SHA-256(sid || initiator || responder) (32 bytes) -->|
//!   |<------------------------ 0x00 --------------------------|
//! ```
//!
//! Proxy candidates are reached through SOCKS5 `CONNECT` with the hex
//! digest as destination host; the proxy pairs both parties by that host
//! and the handshake then runs over the relayed stream.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, info, warn};

use super::{Channel, ChannelProvider, OpenContext, OpenFuture, TransportFailure};
use crate::codec::{Candidate, CandidateKind, SocketTransport, Transport};
use crate::config::SocketConfig;
use crate::error::{JingleError, Result};
use crate::protocol::{random_token, NS_S5B};

/// Digest length of the connection handshake
pub const HANDSHAKE_LEN: usize = 32;

/// How long an accepted connection may take to present its digest
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type Reservations = Mutex<HashMap<(String, String), StdTcpListener>>;
type Attempt = Pin<Box<dyn Future<Output = std::result::Result<TcpStream, String>> + Send>>;

/// Direct/proxied TCP candidate provider.
pub struct SocketProvider {
    config: SocketConfig,
    listeners: Arc<Reservations>,
}

impl SocketProvider {
    /// Create a provider
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config,
            listeners: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of listeners reserved but not yet opened
    pub fn reserved(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn candidates(&self, local: SocketAddr) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        if self.config.advertise.is_empty() {
            let addr = if local.ip().is_unspecified() {
                SocketAddr::from(([127, 0, 0, 1], local.port()))
            } else {
                local
            };
            candidates.push(Candidate::for_addr(random_token(8), addr, CandidateKind::Direct, u16::MAX));
        }
        for (i, addr) in self.config.advertise.iter().enumerate() {
            let pref = u16::MAX.saturating_sub(u16::try_from(i).unwrap_or(u16::MAX));
            candidates.push(Candidate::for_addr(random_token(8), *addr, CandidateKind::Direct, pref));
        }
        for (i, addr) in self.config.proxies.iter().enumerate() {
            let pref = u16::MAX.saturating_sub(u16::try_from(i).unwrap_or(u16::MAX));
            candidates.push(Candidate::for_addr(random_token(8), *addr, CandidateKind::Proxy, pref));
        }
        candidates
    }
}

impl ChannelProvider for SocketProvider {
    fn namespace(&self) -> &'static str {
        NS_S5B
    }

    fn prepare(&self, ctx: &OpenContext) -> Result<Transport> {
        let listener = StdTcpListener::bind(self.config.bind)
            .map_err(|e| JingleError::Transport(TransportFailure::CandidateError(format!(
                "cannot bind {}: {}",
                self.config.bind, e
            ))))?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;

        let sid = random_token(16);
        let digest = dst_hash(&sid, ctx);
        let transport = SocketTransport {
            candidates: self.candidates(local),
            dst_hash: Some(BASE64.encode(digest)),
            sid,
        };
        debug!(session = %ctx.sid, content = %ctx.content, %local, candidates = transport.candidates.len(), "Socket listener reserved");

        lock(&self.listeners).insert((ctx.sid.clone(), ctx.content.clone()), listener);
        Ok(Transport::Socket(transport))
    }

    fn open(&self, transport: &Transport, ctx: &OpenContext) -> OpenFuture {
        let Transport::Socket(descriptor) = transport else {
            let ns = transport.namespace();
            return Box::pin(async move { Err(TransportFailure::Mismatch(ns.to_string())) });
        };
        let digest = dst_hash(&descriptor.sid, ctx);

        if ctx.offerer {
            let reserved = lock(&self.listeners).remove(&(ctx.sid.clone(), ctx.content.clone()));
            let Some(listener) = reserved else {
                return Box::pin(async { Err(TransportFailure::CandidateError("no reserved listener".to_string())) });
            };
            let proxies: Vec<Candidate> = descriptor
                .candidates
                .iter()
                .filter(|c| c.kind == CandidateKind::Proxy)
                .cloned()
                .collect();
            let accept_timeout = self.config.accept_timeout();
            Box::pin(async move { offer(listener, proxies, digest, accept_timeout).await })
        } else {
            let candidates: Vec<Candidate> = descriptor.candidates_by_priority().into_iter().cloned().collect();
            let connect_timeout = self.config.connect_timeout();
            Box::pin(async move { dial(candidates, digest, connect_timeout).await })
        }
    }

    fn release(&self, ctx: &OpenContext) {
        if lock(&self.listeners)
            .remove(&(ctx.sid.clone(), ctx.content.clone()))
            .is_some()
        {
            debug!(session = %ctx.sid, content = %ctx.content, "Socket listener released");
        }
    }
}

impl std::fmt::Debug for SocketProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketProvider")
            .field("config", &self.config)
            .field("reserved", &self.reserved())
            .finish()
    }
}

fn lock(listeners: &Reservations) -> MutexGuard<'_, HashMap<(String, String), StdTcpListener>> {
    listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `SHA-256(sid || initiator || responder)`
pub fn dst_hash(sid: &str, ctx: &OpenContext) -> [u8; HANDSHAKE_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(sid.as_bytes());
    hasher.update(ctx.initiator.as_str().as_bytes());
    hasher.update(ctx.responder.as_str().as_bytes());
    hasher.finalize().into()
}

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Listener side: the first connection that presents the right digest wins.
async fn offer(
    listener: StdTcpListener,
    proxies: Vec<Candidate>,
    digest: [u8; HANDSHAKE_LEN],
    accept_timeout: Duration,
) -> std::result::Result<Channel, TransportFailure> {
    let listener = TcpListener::from_std(listener).map_err(|e| TransportFailure::CandidateError(e.to_string()))?;

    let mut attempts: Vec<Attempt> = vec![Box::pin(accept_loop(listener, digest))];
    for proxy in proxies {
        attempts.push(Box::pin(async move {
            let mut stream = socks5_connect(&proxy.address(), &digest)
                .await
                .map_err(|e| format!("proxy {}: {}", proxy.cid, e))?;
            expect_digest(&mut stream, &digest)
                .await
                .map_err(|e| format!("proxy {}: {}", proxy.cid, e))?;
            Ok(stream)
        }));
    }

    match timeout(accept_timeout, futures::future::select_ok(attempts)).await {
        Ok(Ok((stream, _))) => {
            info!(peer = ?stream.peer_addr().ok(), "Socket transport connected (listener)");
            Ok(Box::new(stream))
        },
        Ok(Err(e)) => Err(TransportFailure::CandidateError(e)),
        Err(_) => Err(TransportFailure::CandidateError(format!(
            "no peer connection within {:?}",
            accept_timeout
        ))),
    }
}

async fn accept_loop(listener: TcpListener, digest: [u8; HANDSHAKE_LEN]) -> std::result::Result<TcpStream, String> {
    loop {
        let (mut stream, peer) = listener.accept().await.map_err(|e| e.to_string())?;
        match timeout(HANDSHAKE_TIMEOUT, expect_digest(&mut stream, &digest)).await {
            Ok(Ok(())) => return Ok(stream),
            Ok(Err(e)) => warn!(%peer, "Rejected socket connection: {}", e),
            Err(_) => warn!(%peer, "Socket connection sent no digest"),
        }
    }
}

/// Dialer side: candidates in the given order, first success wins.
async fn dial(
    candidates: Vec<Candidate>,
    digest: [u8; HANDSHAKE_LEN],
    connect_timeout: Duration,
) -> std::result::Result<Channel, TransportFailure> {
    if candidates.is_empty() {
        return Err(TransportFailure::CandidateError("no candidates offered".to_string()));
    }

    let mut errors = Vec::new();
    let mut proxy_failed = false;
    let mut reached_direct = false;
    for candidate in candidates {
        let is_proxy = candidate.kind == CandidateKind::Proxy;
        let addr = candidate.address();
        debug!(cid = %candidate.cid, %addr, priority = candidate.priority, "Dialing candidate");

        let connected = if is_proxy {
            match timeout(connect_timeout, socks5_connect(&addr, &digest)).await {
                Ok(Ok(stream)) => Ok(stream),
                // Proxy unreachable: an ordinary candidate failure
                Ok(Err(e @ (tokio_socks::Error::Io(_) | tokio_socks::Error::ProxyServerUnreachable))) => Err(e.to_string()),
                Ok(Err(e)) => {
                    proxy_failed = true;
                    Err(format!("proxy activation: {e}"))
                },
                Err(_) => {
                    proxy_failed = true;
                    Err("proxy activation timed out".to_string())
                },
            }
        } else {
            match timeout(connect_timeout, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(stream)) => {
                    reached_direct = true;
                    Ok(stream)
                },
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("connect timed out".to_string()),
            }
        };
        let mut stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                errors.push(format!("{}: {}", candidate.cid, e));
                continue;
            },
        };

        match timeout(connect_timeout, present_digest(&mut stream, &digest)).await {
            Ok(Ok(())) => {
                info!(cid = %candidate.cid, %addr, "Socket transport connected (dialer)");
                return Ok(Box::new(stream));
            },
            Ok(Err(e)) => errors.push(format!("{}: handshake: {}", candidate.cid, e)),
            Err(_) => errors.push(format!("{}: handshake timed out", candidate.cid)),
        }
    }

    let detail = errors.join("; ");
    if proxy_failed && !reached_direct {
        Err(TransportFailure::ProxyError(detail))
    } else {
        Err(TransportFailure::CandidateError(detail))
    }
}

async fn present_digest(stream: &mut TcpStream, digest: &[u8; HANDSHAKE_LEN]) -> io::Result<()> {
    stream.write_all(digest).await?;
    stream.flush().await?;
    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack).await?;
    if ack[0] != 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "listener refused stream"));
    }
    Ok(())
}

async fn expect_digest(stream: &mut TcpStream, digest: &[u8; HANDSHAKE_LEN]) -> io::Result<()> {
    let mut presented = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut presented).await?;
    if &presented != digest {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "digest mismatch"));
    }
    stream.write_all(&[0]).await?;
    stream.flush().await
}

/// SOCKS5 `CONNECT` to the hex digest; the mediator pairs both parties by
/// that destination.
async fn socks5_connect(proxy: &str, digest: &[u8; HANDSHAKE_LEN]) -> std::result::Result<TcpStream, tokio_socks::Error> {
    let target = hex(digest);
    let stream = Socks5Stream::connect(proxy, (target.as_str(), 0)).await?;
    Ok(stream.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jid::Jid;
    use crate::protocol::Role;

    fn ctx(role: Role) -> OpenContext {
        OpenContext {
            sid: "s1".to_string(),
            content: "file".to_string(),
            role,
            offerer: role == Role::Initiator,
            initiator: "romeo@montague.lit/orchard".parse::<Jid>().unwrap(),
            responder: "juliet@capulet.lit/balcony".parse::<Jid>().unwrap(),
        }
    }

    fn fast() -> SocketConfig {
        SocketConfig {
            connect_timeout_ms: 500,
            accept_timeout_ms: 1000,
            ..SocketConfig::default()
        }
    }

    #[tokio::test]
    async fn test_direct_connection() {
        let offerer = SocketProvider::new(fast());
        let dialer = SocketProvider::new(fast());

        let transport = offerer.prepare(&ctx(Role::Initiator)).unwrap();
        assert_eq!(offerer.reserved(), 1);

        let listen = offerer.open(&transport, &ctx(Role::Initiator));
        let connect = dialer.open(&transport, &ctx(Role::Responder));
        let (a, b) = tokio::join!(listen, connect);
        let (mut a, mut b) = (a.unwrap(), b.unwrap());
        assert_eq!(offerer.reserved(), 0);

        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_unreachable_candidates() {
        let config = SocketConfig {
            advertise: vec!["127.0.0.1:1".parse().unwrap()],
            ..fast()
        };
        let offerer = SocketProvider::new(config);
        let transport = offerer.prepare(&ctx(Role::Initiator)).unwrap();
        offerer.release(&ctx(Role::Initiator));
        assert_eq!(offerer.reserved(), 0);

        let dialer = SocketProvider::new(fast());
        let err = dialer.open(&transport, &ctx(Role::Responder)).await.err().unwrap();
        assert!(matches!(err, TransportFailure::CandidateError(_)));
    }

    #[tokio::test]
    async fn test_wrong_digest_rejected() {
        let offerer = SocketProvider::new(fast());
        let transport = offerer.prepare(&ctx(Role::Initiator)).unwrap();
        let listen = offerer.open(&transport, &ctx(Role::Initiator));

        let mut impostor = ctx(Role::Responder);
        impostor.responder = "mallory@evil.lit/x".parse().unwrap();
        let dialer = SocketProvider::new(fast());
        let (a, b) = tokio::join!(listen, dialer.open(&transport, &impostor));
        assert!(a.is_err());
        assert!(matches!(b, Err(TransportFailure::CandidateError(_))));
    }

    #[tokio::test]
    async fn test_failed_proxy_activation_is_proxy_error() {
        // A "proxy" that refuses every authentication method
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = proxy.accept().await {
                let mut greeting = [0u8; 3];
                let _ = s.read_exact(&mut greeting).await;
                let _ = s.write_all(&[5, 0xff]).await;
            }
        });

        let transport = Transport::Socket(SocketTransport {
            sid: "p".to_string(),
            dst_hash: None,
            candidates: vec![
                Candidate::for_addr("d".to_string(), "127.0.0.1:1".parse().unwrap(), CandidateKind::Direct, 0),
                Candidate::for_addr("p".to_string(), proxy_addr, CandidateKind::Proxy, 0),
            ],
        });
        let dialer = SocketProvider::new(fast());
        let err = dialer.open(&transport, &ctx(Role::Responder)).await.err().unwrap();
        assert!(matches!(err, TransportFailure::ProxyError(_)), "{err:?}");
    }

    /// Pairs two SOCKS5 clients that CONNECT to the same host name
    async fn mediator() -> SocketAddr {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = proxy.local_addr().unwrap();
        tokio::spawn(async move {
            let mut waiting: HashMap<Vec<u8>, TcpStream> = HashMap::new();
            while let Ok((mut s, _)) = proxy.accept().await {
                let mut greeting = [0u8; 3];
                s.read_exact(&mut greeting).await.unwrap();
                s.write_all(&[5, 0]).await.unwrap();
                let mut head = [0u8; 5];
                s.read_exact(&mut head).await.unwrap();
                let mut host = vec![0u8; usize::from(head[4])];
                s.read_exact(&mut host).await.unwrap();
                let mut port = [0u8; 2];
                s.read_exact(&mut port).await.unwrap();
                let mut reply = vec![5, 0, 0, 3, head[4]];
                reply.extend_from_slice(&host);
                reply.extend_from_slice(&[0, 0]);
                s.write_all(&reply).await.unwrap();

                if let Some(mut other) = waiting.remove(&host) {
                    tokio::spawn(async move {
                        let _ = tokio::io::copy_bidirectional(&mut s, &mut other).await;
                    });
                } else {
                    waiting.insert(host, s);
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_connection_through_proxy() {
        let proxy = mediator().await;
        let config = SocketConfig {
            advertise: vec!["127.0.0.1:1".parse().unwrap()],
            proxies: vec![proxy],
            ..fast()
        };
        let offerer = SocketProvider::new(config);
        let transport = offerer.prepare(&ctx(Role::Initiator)).unwrap();
        let Transport::Socket(descriptor) = &transport else {
            unreachable!()
        };
        assert_eq!(descriptor.candidates_by_priority()[0].kind, CandidateKind::Direct);
        assert_eq!(descriptor.candidates_by_priority()[1].kind, CandidateKind::Proxy);

        let dialer = SocketProvider::new(fast());
        let (a, b) = tokio::join!(
            offerer.open(&transport, &ctx(Role::Initiator)),
            dialer.open(&transport, &ctx(Role::Responder))
        );
        let (mut a, mut b) = (a.unwrap(), b.unwrap());
        b.write_all(b"via proxy").await.unwrap();
        let mut buf = [0u8; 9];
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"via proxy");
    }

    #[test]
    fn test_dst_hash_binds_both_parties() {
        let a = dst_hash("sid", &ctx(Role::Initiator));
        let b = dst_hash("sid", &ctx(Role::Responder));
        assert_eq!(a, b);
        assert_ne!(a, dst_hash("other", &ctx(Role::Initiator)));
        assert_eq!(hex(&a).len(), 64);
    }
}

//! In-band relay: content bytes travel as base64 data packets over the
//! signaling connection.
//!
//! Each opened stream gets a route keyed by its stream id. Inbound packets
//! are handed to the route by [`ChannelProvider::deliver`]; two pump tasks
//! move bytes between the route and one half of an in-memory duplex pipe
//! whose other half is the application's [`Channel`].
//!
//! A route's inbound queue is bounded: a peer that outruns a reader which
//! stopped reading overruns it, and the stream is closed. Routes belong to
//! a `(session, content)` pair and are torn down by
//! [`ChannelProvider::close`] when that content leaves the session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::{Channel, ChannelProvider, OpenContext, OpenFuture, TransportFailure};
use crate::codec::{InBandTransport, Transport};
use crate::error::Result;
use crate::jid::Jid;
use crate::protocol::{random_token, DataKind, DataPacket, Stanza, StanzaSink, NS_IBB};

/// Default advertised block size
pub const DEFAULT_BLOCK_SIZE: u16 = 4096;

/// Default largest block we accept
pub const DEFAULT_MAX_BLOCK_SIZE: u16 = 8192;

/// Inbound packets buffered per stream before the stream counts as overrun
pub const ROUTE_CAPACITY: usize = 256;

type Routes = Arc<Mutex<HashMap<String, Route>>>;

/// One open stream, keyed by stream id in [`Routes`]
struct Route {
    id: u64,
    sid: String,
    content: String,
    tx: mpsc::Sender<DataPacket>,
    pumps: [AbortHandle; 2],
}

impl Route {
    fn abort(&self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// In-band relay provider.
pub struct InBandProvider {
    sink: Arc<dyn StanzaSink>,
    routes: Routes,
    next_route: AtomicU64,
    block_size: u16,
    max_block_size: u16,
}

impl InBandProvider {
    /// Create a provider that sends packets through `sink`
    pub fn new(sink: Arc<dyn StanzaSink>) -> Self {
        Self {
            sink,
            routes: Arc::new(Mutex::new(HashMap::new())),
            next_route: AtomicU64::new(1),
            block_size: DEFAULT_BLOCK_SIZE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
        }
    }

    /// Set the advertised and maximum block sizes
    pub fn with_block_sizes(mut self, block_size: u16, max_block_size: u16) -> Self {
        self.max_block_size = max_block_size.max(1);
        self.block_size = block_size.clamp(1, self.max_block_size);
        self
    }

    /// Number of open streams
    pub fn open_streams(&self) -> usize {
        lock(&self.routes).len()
    }
}

impl ChannelProvider for InBandProvider {
    fn namespace(&self) -> &'static str {
        NS_IBB
    }

    fn prepare(&self, _ctx: &OpenContext) -> Result<Transport> {
        Ok(Transport::InBand(InBandTransport::new(&random_token(16), self.block_size)))
    }

    fn open(&self, transport: &Transport, ctx: &OpenContext) -> OpenFuture {
        let Transport::InBand(descriptor) = transport else {
            let ns = transport.namespace();
            return Box::pin(async move { Err(TransportFailure::Mismatch(ns.to_string())) });
        };

        let block = usize::from(descriptor.block_size.min(self.max_block_size).max(1));
        let sid = descriptor.sid.clone();
        let mut routes = lock(&self.routes);
        if routes.contains_key(&sid) {
            return Box::pin(async move { Err(TransportFailure::Stream(format!("stream {sid} already open"))) });
        }

        let id = self.next_route.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(ROUTE_CAPACITY);
        let guard = RouteGuard {
            routes: Arc::clone(&self.routes),
            sid: sid.clone(),
            id,
        };

        let (app, relay) = tokio::io::duplex(block * 4);
        let (relay_read, relay_write) = tokio::io::split(relay);
        let stream = StreamInfo {
            sid: sid.clone(),
            ours: ctx.ours().clone(),
            peer: ctx.peer().clone(),
            block,
        };
        debug!(sid = %stream.sid, session = %ctx.sid, content = %ctx.content, block, "In-band stream open");

        let inbound = tokio::spawn(pump_inbound(rx, relay_write, stream.clone(), guard));
        let outbound = tokio::spawn(pump_outbound(relay_read, Arc::clone(&self.sink), stream));
        routes.insert(
            sid,
            Route {
                id,
                sid: ctx.sid.clone(),
                content: ctx.content.clone(),
                tx,
                pumps: [inbound.abort_handle(), outbound.abort_handle()],
            },
        );

        Box::pin(async move { Ok(Box::new(app) as Channel) })
    }

    fn close(&self, ctx: &OpenContext) {
        let mut routes = lock(&self.routes);
        routes.retain(|stream, route| {
            if route.sid != ctx.sid || route.content != ctx.content {
                return true;
            }
            debug!(%stream, session = %ctx.sid, content = %ctx.content, "In-band stream closed locally");
            route.abort();
            false
        });
    }

    fn deliver(&self, packet: DataPacket) -> bool {
        let mut routes = lock(&self.routes);
        let Some(route) = routes.get(&packet.sid) else {
            return false;
        };
        match route.tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(packet)) => {
                warn!(sid = %packet.sid, "In-band stream overrun; closing");
                if let Some(route) = routes.remove(&packet.sid) {
                    route.abort();
                }
                false
            },
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl std::fmt::Debug for InBandProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InBandProvider")
            .field("block_size", &self.block_size)
            .field("max_block_size", &self.max_block_size)
            .field("open_streams", &self.open_streams())
            .finish()
    }
}

#[derive(Clone)]
struct StreamInfo {
    sid: String,
    ours: Jid,
    peer: Jid,
    block: usize,
}

/// Removes the route when the inbound pump ends, unless a newer stream took
/// the same id
struct RouteGuard {
    routes: Routes,
    sid: String,
    id: u64,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        let mut routes = lock(&self.routes);
        if routes.get(&self.sid).is_some_and(|route| route.id == self.id) {
            routes.remove(&self.sid);
        }
    }
}

fn lock(routes: &Routes) -> MutexGuard<'_, HashMap<String, Route>> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Peer packets → application. A sequence gap, an oversized block or bad
/// base64 closes the stream.
async fn pump_inbound(
    mut rx: mpsc::Receiver<DataPacket>,
    mut out: WriteHalf<DuplexStream>,
    stream: StreamInfo,
    _guard: RouteGuard,
) {
    let mut expected: u16 = 0;
    while let Some(packet) = rx.recv().await {
        if packet.from != stream.peer {
            warn!(sid = %stream.sid, from = %packet.from, "Data packet from a third party; dropped");
            continue;
        }
        match packet.kind {
            DataKind::Data { seq, data } => {
                if seq != expected {
                    warn!(sid = %stream.sid, seq, expected, "Sequence gap; closing stream");
                    break;
                }
                expected = expected.wrapping_add(1);
                let bytes = match BASE64.decode(data.as_bytes()) {
                    Ok(bytes) if bytes.len() <= stream.block => bytes,
                    Ok(bytes) => {
                        warn!(sid = %stream.sid, len = bytes.len(), "Block larger than negotiated; closing stream");
                        break;
                    },
                    Err(e) => {
                        warn!(sid = %stream.sid, "Bad base64 in data packet: {}", e);
                        break;
                    },
                };
                if out.write_all(&bytes).await.is_err() {
                    break;
                }
            },
            DataKind::Close => {
                debug!(sid = %stream.sid, "Peer closed in-band stream");
                break;
            },
        }
    }
    let _ = out.shutdown().await;
}

/// Application → peer packets; EOF becomes a Close packet.
async fn pump_outbound(mut input: ReadHalf<DuplexStream>, sink: Arc<dyn StanzaSink>, stream: StreamInfo) {
    let mut seq: u16 = 0;
    let mut buf = vec![0u8; stream.block];
    loop {
        let kind = match input.read(&mut buf).await {
            Ok(0) | Err(_) => DataKind::Close,
            Ok(n) => {
                let kind = DataKind::Data {
                    seq,
                    data: BASE64.encode(&buf[..n]),
                };
                seq = seq.wrapping_add(1);
                kind
            },
        };
        let done = kind == DataKind::Close;
        let packet = DataPacket {
            namespace: NS_IBB.to_string(),
            from: stream.ours.clone(),
            to: stream.peer.clone(),
            sid: stream.sid.clone(),
            kind,
        };
        if let Err(e) = sink.send(Stanza::Data(packet)) {
            warn!(sid = %stream.sid, "In-band stream lost its connection: {}", e);
            return;
        }
        if done {
            return;
        }
    }
}

//! Session registry and effect execution.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::listener::{IncomingSession, OfferedContent, SessionListener};
use crate::codec::Transport;
use crate::config::Config;
use crate::crypto::{KeyTransportRegistry, Keyring, PskKeyTransport, SecureChannel};
use crate::error::{JingleError, Result};
use crate::jid::Jid;
use crate::protocol::{
    Action, ContentOffer, DataPacket, Effect, ErrorCondition, ErrorReply, JingleMessage, NegotiationContext, Reason,
    ReasonCondition, Session, SessionSnapshot, Stanza, StanzaSink, NS_IBB, NS_S5B,
};
use crate::transport::{
    ContentChannel, InBandProvider, OpenContext, OpenFuture, ProviderRegistry, SocketProvider, TransportFailure,
};

type SessionEntry = Arc<Mutex<Session>>;

/// Every session of one connection.
///
/// Cheap to clone; clones share state. Inbound stanzas are expected one at a
/// time, in arrival order ([`run`](Self::run) does this); local operations
/// may be called concurrently from any task.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    our_jid: Jid,
    ctx: NegotiationContext,
    sink: Arc<dyn StanzaSink>,
    listener: Arc<dyn SessionListener>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    tombstones: StdMutex<Tombstones>,
    tasks: StdMutex<Tasks>,
    next_attempt: AtomicU64,
}

/// Bounded memory of terminated sids
struct Tombstones {
    capacity: usize,
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    fn insert(&mut self, sid: &str) {
        if self.capacity == 0 || !self.set.insert(sid.to_string()) {
            return;
        }
        self.order.push_back(sid.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn contains(&self, sid: &str) -> bool {
        self.set.contains(sid)
    }
}

/// Spawned work, keyed so it can be aborted
#[derive(Default)]
struct Tasks {
    /// (sid, content) → (attempt id, establishment task)
    attempts: HashMap<(String, String), (u64, JoinHandle<()>)>,
    /// (sid, pending id) → timer task
    timers: HashMap<(String, u64), JoinHandle<()>>,
}

impl SessionRegistry {
    /// Create a registry for the connection of `our_jid`
    pub fn new(
        our_jid: Jid,
        ctx: NegotiationContext,
        sink: Arc<dyn StanzaSink>,
        listener: Arc<dyn SessionListener>,
    ) -> Self {
        let tombstones = Tombstones::new(ctx.tombstone_capacity);
        Self {
            inner: Arc::new(Inner {
                our_jid,
                ctx,
                sink,
                listener,
                sessions: RwLock::new(HashMap::new()),
                tombstones: StdMutex::new(tombstones),
                tasks: StdMutex::new(Tasks::default()),
                next_attempt: AtomicU64::new(1),
            }),
        }
    }

    /// Build providers, key transports and policy from configuration
    pub fn from_config(
        our_jid: Jid,
        config: &Config,
        keyring: Keyring,
        sink: Arc<dyn StanzaSink>,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Self> {
        config.validate()?;

        let mut providers = ProviderRegistry::new();
        for namespace in &config.negotiation.transports {
            providers = match namespace.as_str() {
                NS_IBB => providers.with(Arc::new(
                    InBandProvider::new(Arc::clone(&sink))
                        .with_block_sizes(config.in_band.block_size, config.in_band.max_block_size),
                )),
                NS_S5B => providers.with(Arc::new(SocketProvider::new(config.socket.clone()))),
                other => return Err(JingleError::Config(format!("unknown transport {other}"))),
            };
        }
        let key_transports = KeyTransportRegistry::new().with(Arc::new(PskKeyTransport::new(keyring)));

        let ctx = NegotiationContext::new(providers, key_transports)
            .with_cipher(config.security.cipher_kind()?)
            .with_pending_timeout(config.negotiation.pending_timeout())
            .with_auto_accept_content_add(config.negotiation.auto_accept_content_add)
            .with_tombstone_capacity(config.negotiation.tombstone_capacity);

        info!(jid = %our_jid, transports = ?ctx.providers.namespaces(), "Session registry ready");
        Ok(Self::new(our_jid, ctx, sink, listener))
    }

    /// Our own address
    pub fn our_jid(&self) -> &Jid {
        &self.inner.our_jid
    }

    /// Shared negotiation context
    pub fn context(&self) -> &NegotiationContext {
        &self.inner.ctx
    }

    /// Start a session with `peer`; returns the new sid
    pub async fn create_outbound_session(&self, peer: Jid, offers: Vec<ContentOffer>) -> Result<String> {
        let sid = uuid::Uuid::new_v4().to_string();
        let (session, effects) = Session::outbound(&sid, self.inner.our_jid.clone(), peer, offers, &self.inner.ctx)?;

        let entry = Arc::new(Mutex::new(session));
        let session = Arc::clone(&entry).lock_owned().await;
        self.inner.sessions.write().await.insert(sid.clone(), entry);
        self.inner.finish(&sid, session, effects).await;
        Ok(sid)
    }

    /// Dispatch one inbound stanza
    pub async fn handle_inbound(&self, stanza: Stanza) {
        match stanza {
            Stanza::Jingle(msg) => self.on_jingle(msg).await,
            Stanza::Data(packet) => self.on_data(packet),
            Stanza::Error(reply) => {
                warn!(sid = %reply.sid, from = %reply.from, condition = ?reply.condition, action = ?reply.action, "Peer reported an error");
            },
        }
    }

    /// Feed inbound stanzas until the connection closes
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<Stanza>) {
        while let Some(stanza) = rx.recv().await {
            self.handle_inbound(stanza).await;
        }
        debug!(jid = %self.inner.our_jid, "Inbound stream closed");
    }

    /// Read-only view of a session
    pub async fn get(&self, sid: &str) -> Option<SessionSnapshot> {
        let entry = self.inner.session(sid).await?;
        let session = entry.lock().await;
        Some(session.snapshot())
    }

    /// Number of live sessions
    pub async fn count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Whether `sid` belonged to a session that has terminated
    pub fn is_terminated(&self, sid: &str) -> bool {
        self.inner.tombstones().contains(sid)
    }

    /// Accept an incoming session
    pub async fn accept(&self, sid: &str) -> Result<()> {
        self.with_session(sid, |session, _| session.accept()).await
    }

    /// Decline an incoming session
    pub async fn decline(&self, sid: &str) -> Result<()> {
        self.with_session(sid, |session, _| session.decline()).await
    }

    /// End a session
    pub async fn terminate(&self, sid: &str, reason: Reason) -> Result<()> {
        self.with_session(sid, |session, _| session.terminate(reason)).await
    }

    /// Add a content to an active session
    pub async fn add_content(&self, sid: &str, offer: ContentOffer) -> Result<()> {
        self.with_session(sid, |session, ctx| session.add_content(offer, ctx))
            .await
    }

    /// Remove a content
    pub async fn remove_content(&self, sid: &str, name: &str) -> Result<()> {
        self.with_session(sid, |session, _| session.remove_content(name))
            .await
    }

    /// Propose another transport for a content
    pub async fn replace_transport(&self, sid: &str, name: &str, namespace: &str) -> Result<()> {
        self.with_session(sid, |session, ctx| session.replace_transport(name, namespace, ctx))
            .await
    }

    /// Encrypt a content of a pending session
    pub async fn secure_content(&self, sid: &str, name: &str, key_transport: &str) -> Result<()> {
        self.with_session(sid, |session, ctx| session.secure_content(name, key_transport, ctx))
            .await
    }

    /// Send an application-level notice for a content
    pub async fn send_description_info(&self, sid: &str, name: &str, info: Value) -> Result<()> {
        self.with_session(sid, |session, _| session.send_description_info(name, info))
            .await
    }

    /// Terminate every session and stop all engine tasks
    pub async fn shutdown(&self) {
        let entries: Vec<(String, SessionEntry)> = self.inner.sessions.write().await.drain().collect();
        for (sid, entry) in entries {
            let mut session = entry.lock().await;
            if let Ok(effects) = session.terminate(Reason::new(ReasonCondition::Gone)) {
                self.inner.execute(&session, effects);
            }
            self.inner.tombstones().insert(&sid);
        }

        let mut tasks = self.inner.tasks();
        for (_, (_, handle)) in tasks.attempts.drain() {
            handle.abort();
        }
        for (_, handle) in tasks.timers.drain() {
            handle.abort();
        }
        info!(jid = %self.inner.our_jid, "Session registry shut down");
    }

    async fn with_session<F>(&self, sid: &str, op: F) -> Result<()>
    where
        F: FnOnce(&mut Session, &NegotiationContext) -> Result<Vec<Effect>>,
    {
        let entry = self
            .inner
            .session(sid)
            .await
            .ok_or_else(|| JingleError::UnknownSession(sid.to_string()))?;
        let mut session = entry.lock_owned().await;
        let effects = op(&mut *session, &self.inner.ctx)?;
        self.inner.finish(sid, session, effects).await;
        Ok(())
    }

    async fn on_jingle(&self, msg: JingleMessage) {
        if msg.to != self.inner.our_jid {
            warn!(sid = %msg.sid, to = %msg.to, "Dropping stanza addressed to someone else");
            return;
        }
        if msg.action == Action::SessionInitiate {
            self.on_initiate(msg).await;
            return;
        }

        let Some(entry) = self.inner.session(&msg.sid).await else {
            if self.is_terminated(&msg.sid) && msg.action == Action::SessionTerminate {
                debug!(sid = %msg.sid, "Ignoring session-terminate for a finished session");
                return;
            }
            warn!(sid = %msg.sid, action = %msg.action, "Action for unknown session");
            self.inner.reply(&msg, ErrorCondition::UnknownSession);
            return;
        };

        let mut session = entry.lock_owned().await;
        if msg.from != *session.peer() {
            warn!(sid = %msg.sid, from = %msg.from, "Action from a stranger");
            self.inner.reply(&msg, ErrorCondition::UnknownSession);
            return;
        }

        match session.apply(&msg, &self.inner.ctx) {
            Ok(effects) => self.inner.finish(&msg.sid, session, effects).await,
            Err(e) => {
                warn!(sid = %msg.sid, action = %msg.action, "Refused: {}", e);
                self.inner.reply(&msg, error_condition(&e));
            },
        }
    }

    async fn on_initiate(&self, msg: JingleMessage) {
        if self.is_terminated(&msg.sid) || self.inner.session(&msg.sid).await.is_some() {
            warn!(sid = %msg.sid, from = %msg.from, "Duplicate session-initiate");
            self.inner.reply(&msg, ErrorCondition::Conflict);
            return;
        }

        let (session, rejection) = match Session::from_initiate(&msg, &self.inner.ctx) {
            Ok(built) => built,
            Err(e) => {
                warn!(sid = %msg.sid, "Malformed session-initiate: {}", e);
                self.inner.reply(&msg, ErrorCondition::BadRequest);
                return;
            },
        };
        if session.is_terminated() {
            self.inner.execute(&session, rejection);
            self.inner.tombstones().insert(&msg.sid);
            return;
        }

        let incoming = IncomingSession {
            sid: msg.sid.clone(),
            peer: session.peer().clone(),
            contents: session
                .contents()
                .map(|c| OfferedContent {
                    snapshot: c.snapshot(),
                    description: c.description().clone(),
                })
                .collect(),
            registry: self.clone(),
        };

        {
            let mut sessions = self.inner.sessions.write().await;
            if sessions.contains_key(&msg.sid) {
                drop(sessions);
                self.inner.reply(&msg, ErrorCondition::Conflict);
                return;
            }
            sessions.insert(msg.sid.clone(), Arc::new(Mutex::new(session)));
        }
        self.inner.listener.on_incoming_session(incoming);
    }

    fn on_data(&self, packet: DataPacket) {
        let (from, to, sid) = (packet.from.clone(), packet.to.clone(), packet.sid.clone());
        if !self.inner.ctx.providers.deliver(packet) {
            debug!(stream = %sid, %from, "Data for no open stream");
            let reply = ErrorReply {
                from: to,
                to: from,
                sid,
                action: None,
                condition: ErrorCondition::UnknownSession,
            };
            self.inner.send(Stanza::Error(reply));
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("our_jid", &self.inner.our_jid)
            .field("ctx", &self.inner.ctx)
            .finish_non_exhaustive()
    }
}

fn error_condition(err: &JingleError) -> ErrorCondition {
    match err {
        JingleError::StateConflict(_) => ErrorCondition::OutOfOrder,
        JingleError::UnknownSession(_) => ErrorCondition::UnknownSession,
        _ => ErrorCondition::BadRequest,
    }
}

impl Inner {
    async fn session(&self, sid: &str) -> Option<SessionEntry> {
        self.sessions.read().await.get(sid).cloned()
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tombstones(&self) -> MutexGuard<'_, Tombstones> {
        self.tombstones.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, stanza: Stanza) {
        if let Err(e) = self.sink.send(stanza) {
            warn!("Stanza not sent: {}", e);
        }
    }

    fn reply(&self, msg: &JingleMessage, condition: ErrorCondition) {
        self.send(Stanza::Error(ErrorReply {
            from: self.our_jid.clone(),
            to: msg.from.clone(),
            sid: msg.sid.clone(),
            action: Some(msg.action),
            condition,
        }));
    }

    /// Execute effects under the session lock, then retire the session if
    /// it terminated.
    async fn finish(
        self: &Arc<Self>,
        sid: &str,
        session: tokio::sync::OwnedMutexGuard<Session>,
        effects: Vec<Effect>,
    ) {
        let terminated = self.execute(&session, effects);
        drop(session);
        if terminated {
            self.retire(sid).await;
        }
    }

    /// Run one batch of effects for a locked session. Local effects run
    /// first, in order, so routes and listeners exist before the peer hears
    /// about them; stanzas go out next; application callbacks last.
    ///
    /// Returns whether the session terminated.
    fn execute(self: &Arc<Self>, session: &Session, effects: Vec<Effect>) -> bool {
        let sid = session.sid();
        let mut outbound = Vec::new();
        let mut notices = Vec::new();

        for effect in effects {
            match effect {
                Effect::Send(stanza) => outbound.push(stanza),
                Effect::Establish { content, transport, ctx } => self.start_attempt(content, transport, ctx),
                Effect::Abort { content } => self.abort_attempt(sid, &content),
                Effect::Release { content } => {
                    self.abort_attempt(sid, &content);
                    let ctx = session.open_ctx(&content, true);
                    for provider in self.ctx.providers.iter() {
                        provider.release(&ctx);
                    }
                },
                Effect::Close { content } => {
                    self.abort_attempt(sid, &content);
                    let ctx = session.open_ctx(&content, true);
                    for provider in self.ctx.providers.iter() {
                        provider.close(&ctx);
                    }
                },
                Effect::Arm { id, timeout } => self.arm(sid, id, timeout),
                Effect::Disarm { id } => {
                    if let Some(handle) = self.tasks().timers.remove(&(sid.to_string(), id)) {
                        handle.abort();
                    }
                },
                notice => notices.push(notice),
            }
        }

        for stanza in outbound {
            self.send(stanza);
        }

        let mut terminated = false;
        for notice in notices {
            match notice {
                Effect::ContentRemoved { content, reason } if reason.is_failure() => {
                    self.listener.on_channel_failed(sid, &content, reason);
                },
                Effect::ContentRemoved { content, reason } => self.listener.on_content_removed(sid, &content, reason),
                Effect::DescriptionInfo { content, info } => self.listener.on_description_info(sid, &content, info),
                Effect::Terminated { reason } => {
                    terminated = true;
                    self.listener.on_session_terminated(sid, reason);
                },
                _ => {},
            }
        }
        terminated
    }

    async fn retire(&self, sid: &str) {
        self.sessions.write().await.remove(sid);
        self.tombstones().insert(sid);

        let mut tasks = self.tasks();
        tasks.attempts.retain(|(s, _), (_, handle)| {
            if s == sid {
                handle.abort();
            }
            s != sid
        });
        tasks.timers.retain(|(s, _), handle| {
            if s == sid {
                handle.abort();
            }
            s != sid
        });
        debug!(%sid, "Session retired");
    }

    fn start_attempt(self: &Arc<Self>, content: String, transport: Transport, ctx: OpenContext) {
        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let namespace = transport.namespace();
        let open: OpenFuture = match self.ctx.providers.get(namespace) {
            Some(provider) => provider.open(&transport, &ctx),
            None => Box::pin(async move { Err(TransportFailure::Mismatch(namespace.to_string())) }),
        };
        debug!(sid = %ctx.sid, %content, transport = namespace, attempt, offerer = ctx.offerer, "Establishing");

        let key = (ctx.sid.clone(), content.clone());
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let outcome = open.await;
            inner.finish_attempt(&ctx.sid, &content, attempt, outcome).await;
        });
        if let Some((_, previous)) = self.tasks().attempts.insert(key, (attempt, handle)) {
            previous.abort();
        }
    }

    fn abort_attempt(&self, sid: &str, content: &str) {
        if let Some((attempt, handle)) = self.tasks().attempts.remove(&(sid.to_string(), content.to_string())) {
            debug!(%sid, %content, attempt, "Establishment aborted");
            handle.abort();
        }
    }

    async fn finish_attempt(
        self: &Arc<Self>,
        sid: &str,
        content: &str,
        attempt: u64,
        outcome: std::result::Result<crate::transport::Channel, TransportFailure>,
    ) {
        let Some(entry) = self.session(sid).await else {
            return;
        };
        let mut session = entry.lock_owned().await;
        {
            let key = (sid.to_string(), content.to_string());
            let mut tasks = self.tasks();
            match tasks.attempts.get(&key) {
                Some((current, _)) if *current == attempt => {
                    tasks.attempts.remove(&key);
                },
                _ => {
                    debug!(%sid, %content, attempt, "Dropping stale establishment");
                    return;
                },
            }
        }

        match outcome {
            Ok(channel) => {
                if !session.channel_ready(content) {
                    return;
                }
                let channel = match session.take_cipher(content) {
                    Some(unit) => ContentChannel::Secure(SecureChannel::new(channel, unit)),
                    None => ContentChannel::Plain(channel),
                };
                drop(session);
                self.listener.on_channel_ready(sid, content, channel);
            },
            Err(failure) => {
                let effects = session.transport_failed(content, &failure, &self.ctx);
                self.finish(sid, session, effects).await;
            },
        }
    }

    fn arm(self: &Arc<Self>, sid: &str, id: u64, timeout: Duration) {
        let inner = Arc::clone(self);
        let owned = sid.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            inner.expire(&owned, id).await;
        });
        if let Some(previous) = self.tasks().timers.insert((sid.to_string(), id), handle) {
            previous.abort();
        }
    }

    async fn expire(self: &Arc<Self>, sid: &str, id: u64) {
        let Some(entry) = self.session(sid).await else {
            return;
        };
        let mut session = entry.lock_owned().await;
        if self.tasks().timers.remove(&(sid.to_string(), id)).is_none() {
            return;
        }
        let effects = session.expire_pending(id, &self.ctx);
        self.finish(sid, session, effects).await;
    }
}

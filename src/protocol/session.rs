//! Session state machine.
//!
//! Handles one session's lifecycle: initiation, acceptance, content
//! add/remove, transport replacement with fallback, security key exchange
//! and termination. All I/O is expressed as returned [`Effect`]s.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::content::{Content, ContentOffer, ContentSnapshot, ContentState};
use super::message::{
    Action, ContentElement, ErrorCondition, ErrorReply, JingleMessage, Reason, ReasonCondition, Stanza,
};
use super::pending::{PendingKind, PendingLedger};
use super::Role;
use crate::codec::{CodecRegistry, JetSecurity, Payload, Security, Transport};
use crate::crypto::{CipherKind, CipherUnit, KeyTransportRegistry};
use crate::error::{JingleError, Result};
use crate::jid::Jid;
use crate::transport::{ChannelProvider, OpenContext, ProviderRegistry, TransportFailure};

/// Default time a local action waits for the peer's answer
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of terminated sids an engine remembers
pub const DEFAULT_TOMBSTONE_CAPACITY: usize = 1024;

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Initiated, not yet accepted
    Pending,
    /// Accepted
    Active,
    /// Ended; terminal
    Terminated,
}

/// Registries and policy shared by every session of an engine.
///
/// Built once, then shared read-only.
pub struct NegotiationContext {
    /// Payload decoders
    pub codecs: CodecRegistry,
    /// Transport providers, in preference order
    pub providers: ProviderRegistry,
    /// Key-transport codecs
    pub key_transports: KeyTransportRegistry,
    /// Cipher used when we encrypt a content
    pub cipher: CipherKind,
    /// How long transport-replace and content-add wait for an answer
    pub pending_timeout: Duration,
    /// Accept inbound content-add without asking the application
    pub auto_accept_content_add: bool,
    /// How many terminated sids the engine remembers
    pub tombstone_capacity: usize,
}

impl NegotiationContext {
    /// Context with default codecs and policy
    pub fn new(providers: ProviderRegistry, key_transports: KeyTransportRegistry) -> Self {
        Self {
            codecs: CodecRegistry::default(),
            providers,
            key_transports,
            cipher: CipherKind::default(),
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            auto_accept_content_add: true,
            tombstone_capacity: DEFAULT_TOMBSTONE_CAPACITY,
        }
    }

    /// Replace the codec registry
    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Set the cipher for contents we encrypt
    pub fn with_cipher(mut self, cipher: CipherKind) -> Self {
        self.cipher = cipher;
        self
    }

    /// Set the pending-action timeout
    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    /// Set the content-add policy
    pub fn with_auto_accept_content_add(mut self, auto: bool) -> Self {
        self.auto_accept_content_add = auto;
        self
    }

    /// Set how many terminated sids are remembered
    pub fn with_tombstone_capacity(mut self, capacity: usize) -> Self {
        self.tombstone_capacity = capacity;
        self
    }
}

impl std::fmt::Debug for NegotiationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationContext")
            .field("providers", &self.providers)
            .field("key_transports", &self.key_transports)
            .field("cipher", &self.cipher)
            .field("pending_timeout", &self.pending_timeout)
            .finish_non_exhaustive()
    }
}

/// Work the engine carries out on behalf of a session.
#[derive(Debug)]
pub enum Effect {
    /// Hand a stanza to the connection
    Send(Stanza),
    /// Start establishing a content's transport, replacing any attempt in flight
    Establish {
        /// Content name
        content: String,
        /// Final descriptor
        transport: Transport,
        /// Provider context
        ctx: OpenContext,
    },
    /// Abort the content's in-flight establishment
    Abort {
        /// Content name
        content: String,
    },
    /// Abort establishment and drop everything providers reserved for the content
    Release {
        /// Content name
        content: String,
    },
    /// Like `Release`, and also tear down any stream already open for the
    /// content. Used when the content leaves the session.
    Close {
        /// Content name
        content: String,
    },
    /// Start the timer for a pending action
    Arm {
        /// Pending action id
        id: u64,
        /// Time until expiry
        timeout: Duration,
    },
    /// Stop the timer for a pending action
    Disarm {
        /// Pending action id
        id: u64,
    },
    /// A content left the session before or instead of delivering a channel
    ContentRemoved {
        /// Content name
        content: String,
        /// Why
        reason: ReasonCondition,
    },
    /// Application-level notice for a content
    DescriptionInfo {
        /// Content name
        content: String,
        /// Payload
        info: Value,
    },
    /// The session ended
    Terminated {
        /// Why
        reason: ReasonCondition,
    },
}

/// One negotiation session
#[derive(Debug)]
pub struct Session {
    sid: String,
    role: Role,
    state: SessionState,
    initiator: Jid,
    responder: Jid,
    contents: IndexMap<String, Content>,
    pending: PendingLedger,
}

impl Session {
    fn new(sid: String, role: Role, initiator: Jid, responder: Jid) -> Self {
        Self {
            sid,
            role,
            state: SessionState::Pending,
            initiator,
            responder,
            contents: IndexMap::new(),
            pending: PendingLedger::new(),
        }
    }

    /// Start a session as initiator; the returned effects carry the
    /// session-initiate.
    pub fn outbound(
        sid: &str,
        initiator: Jid,
        responder: Jid,
        offers: Vec<ContentOffer>,
        ctx: &NegotiationContext,
    ) -> Result<(Self, Vec<Effect>)> {
        if offers.is_empty() {
            return Err(JingleError::ProtocolViolation("session without contents".to_string()));
        }

        let mut session = Self::new(sid.to_string(), Role::Initiator, initiator, responder);
        for offer in offers {
            let name = offer.content_name();
            let built = if session.contents.contains_key(&name) {
                Err(JingleError::ProtocolViolation(format!("duplicate content name {name}")))
            } else {
                session.build_content(&name, offer, ContentState::Negotiating, ctx)
            };
            match built {
                Ok(content) => {
                    session.contents.insert(name, content);
                },
                Err(e) => {
                    session.release_reservations(ctx, Some(&name));
                    return Err(e);
                },
            }
        }

        let mut msg = session.message(Action::SessionInitiate);
        msg.initiator = Some(session.initiator.clone());
        for content in session.contents.values() {
            msg.contents.push(content.to_element(true)?);
        }

        info!(sid = %session.sid, peer = %session.responder, contents = session.contents.len(), "Session initiated");
        Ok((session, vec![Effect::Send(Stanza::Jingle(msg))]))
    }

    /// Build a session from an inbound session-initiate.
    ///
    /// Undecodable contents do not produce an error: the session comes back
    /// already terminated, with the session-terminate to send. Errors are
    /// reserved for structurally invalid requests.
    pub fn from_initiate(msg: &JingleMessage, ctx: &NegotiationContext) -> Result<(Self, Vec<Effect>)> {
        if msg.action != Action::SessionInitiate {
            return Err(JingleError::ProtocolViolation(format!(
                "expected session-initiate, got {}",
                msg.action
            )));
        }
        if msg.sid.is_empty() || msg.contents.is_empty() {
            return Err(JingleError::ProtocolViolation("session-initiate without sid or contents".to_string()));
        }
        let initiator = msg.initiator.clone().unwrap_or_else(|| msg.from.clone());
        if initiator != msg.from {
            return Err(JingleError::ProtocolViolation("initiator is not the sender".to_string()));
        }

        let mut session = Self::new(msg.sid.clone(), Role::Responder, initiator, msg.to.clone());
        for element in &msg.contents {
            if element.name.is_empty() || session.contents.contains_key(&element.name) {
                return Err(JingleError::ProtocolViolation(format!(
                    "bad or duplicate content name {:?}",
                    element.name
                )));
            }
            match session.decode_content(element, ContentState::Negotiating, ctx) {
                Ok(content) => {
                    session.contents.insert(element.name.clone(), content);
                },
                Err((condition, text)) => {
                    warn!(sid = %session.sid, content = %element.name, %condition, "Rejecting session: {}", text);
                    let effects = session.terminate_effects(Reason::with_text(condition, text), true);
                    return Ok((session, effects));
                },
            }
        }

        info!(sid = %session.sid, peer = %session.initiator, contents = session.contents.len(), "Incoming session");
        Ok((session, Vec::new()))
    }

    // --- accessors -------------------------------------------------------

    /// Session id
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Our role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Check if the session has ended
    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    /// Session initiator
    pub fn initiator(&self) -> &Jid {
        &self.initiator
    }

    /// Session responder
    pub fn responder(&self) -> &Jid {
        &self.responder
    }

    /// Our address
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

    /// Look up a content
    pub fn content(&self, name: &str) -> Option<&Content> {
        self.contents.get(name)
    }

    /// Contents in negotiation order
    pub fn contents(&self) -> impl Iterator<Item = &Content> {
        self.contents.values()
    }

    /// The single content of the session.
    ///
    /// `Ok(None)` when there are none, a state error when there are several.
    pub fn sole_content(&self) -> Result<Option<&Content>> {
        match self.contents.len() {
            0 => Ok(None),
            1 => Ok(self.contents.values().next()),
            n => Err(JingleError::StateConflict(format!("session has {n} contents"))),
        }
    }

    /// Number of outstanding local actions
    pub fn pending_actions(&self) -> usize {
        self.pending.len()
    }

    /// Read-only view
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            sid: self.sid.clone(),
            role: self.role,
            state: self.state,
            initiator: self.initiator.clone(),
            responder: self.responder.clone(),
            contents: self.contents.values().map(Content::snapshot).collect(),
            pending_actions: self.pending.len(),
        }
    }

    // --- local operations ------------------------------------------------

    /// Accept an incoming session
    pub fn accept(&mut self) -> Result<Vec<Effect>> {
        if self.role != Role::Responder || self.state != SessionState::Pending {
            return Err(JingleError::StateConflict(format!(
                "cannot accept as {:?} in state {:?}",
                self.role, self.state
            )));
        }
        self.state = SessionState::Active;

        let mut msg = self.message(Action::SessionAccept);
        msg.responder = Some(self.responder.clone());
        for content in self.contents.values() {
            msg.contents.push(content.to_element(false)?);
        }

        let mut effects = vec![Effect::Send(Stanza::Jingle(msg))];
        let names: Vec<String> = self.contents.keys().cloned().collect();
        for name in names {
            self.establish(&name, &mut effects);
        }
        info!(sid = %self.sid, "Session accepted");
        Ok(effects)
    }

    /// Decline an incoming session
    pub fn decline(&mut self) -> Result<Vec<Effect>> {
        if self.role != Role::Responder || self.state != SessionState::Pending {
            return Err(JingleError::StateConflict("only a pending incoming session can be declined".to_string()));
        }
        Ok(self.terminate_effects(Reason::new(ReasonCondition::Decline), true))
    }

    /// End the session
    pub fn terminate(&mut self, reason: Reason) -> Result<Vec<Effect>> {
        self.ensure_live()?;
        Ok(self.terminate_effects(reason, true))
    }

    /// Add a content to an active session
    pub fn add_content(&mut self, offer: ContentOffer, ctx: &NegotiationContext) -> Result<Vec<Effect>> {
        self.ensure_live()?;
        if self.state != SessionState::Active {
            return Err(JingleError::StateConflict("content-add needs an active session".to_string()));
        }
        let name = offer.content_name();
        if self.contents.contains_key(&name) {
            return Err(JingleError::StateConflict(format!("content {name} already exists")));
        }

        let content = match self.build_content(&name, offer, ContentState::Proposed, ctx) {
            Ok(content) => content,
            Err(e) => {
                self.release_reservations(ctx, Some(&name));
                return Err(e);
            },
        };
        let element = content.to_element(true)?;
        self.contents.insert(name.clone(), content);

        let id = self
            .pending
            .insert(PendingKind::ContentAdd, &name, None, ctx.pending_timeout);
        let msg = self.message(Action::ContentAdd).with_content(element);
        debug!(sid = %self.sid, content = %name, "Content added");
        Ok(vec![
            Effect::Send(Stanza::Jingle(msg)),
            Effect::Arm {
                id,
                timeout: ctx.pending_timeout,
            },
        ])
    }

    /// Remove a content; removing the last one ends the session
    pub fn remove_content(&mut self, name: &str) -> Result<Vec<Effect>> {
        self.ensure_live()?;
        let creator = self
            .contents
            .get(name)
            .map(Content::creator)
            .ok_or_else(|| JingleError::UnknownContent(name.to_string()))?;
        if self.contents.len() == 1 {
            return Ok(self.terminate_effects(Reason::new(ReasonCondition::Cancel), true));
        }

        let mut effects = self.drop_content(name, ReasonCondition::Cancel);
        let msg = self
            .message(Action::ContentRemove)
            .with_content(ContentElement::named(name, creator))
            .with_reason(Reason::new(ReasonCondition::Cancel));
        effects.insert(0, Effect::Send(Stanza::Jingle(msg)));
        Ok(effects)
    }

    /// Propose a different transport namespace for a content
    pub fn replace_transport(&mut self, name: &str, namespace: &str, ctx: &NegotiationContext) -> Result<Vec<Effect>> {
        self.ensure_live()?;
        let content = self
            .contents
            .get(name)
            .ok_or_else(|| JingleError::UnknownContent(name.to_string()))?;
        if content.transport().namespace() == namespace {
            return Err(JingleError::StateConflict(format!("{name} already uses {namespace}")));
        }
        if content.is_blacklisted(namespace) {
            return Err(JingleError::StateConflict(format!("{namespace} already failed for {name}")));
        }
        if self.pending.find(name, PendingKind::TransportReplace).is_some() {
            return Err(JingleError::StateConflict(format!("transport-replace already pending for {name}")));
        }
        let provider = ctx
            .providers
            .get(namespace)
            .cloned()
            .ok_or_else(|| JingleError::UnsupportedNamespace(namespace.to_string()))?;
        self.propose_transport(name, &provider, ctx)
    }

    /// Encrypt a content of a pending session; sends security-info
    pub fn secure_content(&mut self, name: &str, key_transport: &str, ctx: &NegotiationContext) -> Result<Vec<Effect>> {
        self.ensure_live()?;
        if self.state != SessionState::Pending {
            return Err(JingleError::StateConflict("security can only be set up before acceptance".to_string()));
        }
        let (role, ours, peer) = (self.role, self.ours().clone(), self.peer().clone());
        let content = self
            .contents
            .get_mut(name)
            .ok_or_else(|| JingleError::UnknownContent(name.to_string()))?;
        if content.security.is_some() {
            return Err(JingleError::StateConflict(format!("{name} is already secured")));
        }
        seal_content(content, role, &ours, &peer, key_transport, ctx)?;

        let mut element = ContentElement::named(name, content.creator());
        element.security = content.security().map(Security::to_payload).transpose()?;
        let msg = self.message(Action::SecurityInfo).with_content(element);
        debug!(sid = %self.sid, content = %name, "Content secured");
        Ok(vec![Effect::Send(Stanza::Jingle(msg))])
    }

    /// Send an application-level notice for a content
    pub fn send_description_info(&self, name: &str, info: Value) -> Result<Vec<Effect>> {
        self.ensure_live()?;
        let content = self
            .contents
            .get(name)
            .ok_or_else(|| JingleError::UnknownContent(name.to_string()))?;
        let msg = self
            .message(Action::DescriptionInfo)
            .with_content(ContentElement::named(name, content.creator()))
            .with_info(info);
        Ok(vec![Effect::Send(Stanza::Jingle(msg))])
    }

    // --- establishment outcomes ------------------------------------------

    /// Record a successful establishment. Returns `false` for a stale
    /// completion (content gone or no longer establishing).
    pub fn channel_ready(&mut self, name: &str) -> bool {
        if self.is_terminated() {
            return false;
        }
        match self.contents.get_mut(name) {
            Some(content) if content.state == ContentState::Establishing => {
                content.state = ContentState::Established;
                info!(sid = %self.sid, content = %name, transport = content.transport().namespace(), "Channel established");
                true
            },
            _ => false,
        }
    }

    /// Hand over the content's cipher unit, if it has one
    pub fn take_cipher(&mut self, name: &str) -> Option<CipherUnit> {
        self.contents.get_mut(name).and_then(|c| c.cipher.take())
    }

    /// Establishment failed: blacklist the namespace and fall back
    pub fn transport_failed(&mut self, name: &str, failure: &TransportFailure, ctx: &NegotiationContext) -> Vec<Effect> {
        if self.is_terminated() {
            return Vec::new();
        }
        let Some(content) = self.contents.get_mut(name) else {
            return Vec::new();
        };
        if content.state != ContentState::Establishing {
            return Vec::new();
        }

        let namespace = content.transport().namespace();
        warn!(sid = %self.sid, content = %name, transport = namespace, "Transport failed: {}", failure);
        content.blacklist_namespace(namespace);

        if self.pending.find(name, PendingKind::TransportReplace).is_some() {
            return Vec::new();
        }
        self.fall_back(name, ctx)
    }

    /// A pending action's timer fired
    pub fn expire_pending(&mut self, id: u64, ctx: &NegotiationContext) -> Vec<Effect> {
        if self.is_terminated() {
            return Vec::new();
        }
        let Some(action) = self.pending.take_id(id) else {
            return Vec::new();
        };
        warn!(sid = %self.sid, content = %action.content, kind = ?action.kind, "Pending action timed out");

        match action.kind {
            PendingKind::TransportReplace => {
                let mut effects = vec![Effect::Release {
                    content: action.content.clone(),
                }];
                if self.reject_proposal(&action.content, action.proposed.as_ref()) {
                    effects.extend(self.fall_back(&action.content, ctx));
                }
                effects
            },
            PendingKind::ContentAdd => self.fail_content(&action.content, ReasonCondition::Timeout),
        }
    }

    // --- inbound ---------------------------------------------------------

    /// Apply an inbound action.
    ///
    /// Errors mean the action was refused; the engine turns them into an
    /// error reply. Actions that are merely stale come back as no effects.
    pub fn apply(&mut self, msg: &JingleMessage, ctx: &NegotiationContext) -> Result<Vec<Effect>> {
        self.ensure_live()?;
        debug!(sid = %self.sid, action = %msg.action, "Applying inbound action");

        match msg.action {
            Action::SessionInitiate => Err(JingleError::StateConflict(format!("session {} already exists", self.sid))),
            Action::SessionAccept => Ok(self.on_session_accept()),
            Action::SessionTerminate => {
                let reason = msg.reason.clone().unwrap_or(Reason::new(ReasonCondition::Success));
                Ok(self.terminate_effects(reason, false))
            },
            Action::SessionInfo => Ok(Vec::new()),
            Action::ContentAdd => self.on_content_add(msg, ctx),
            Action::ContentAccept => Ok(self.on_content_accept(msg)),
            Action::ContentReject => Ok(self.on_content_reject(msg)),
            Action::ContentRemove => Ok(self.on_content_remove(msg)),
            Action::TransportReplace => Ok(self.on_transport_replace(msg, ctx)),
            Action::TransportAccept => Ok(self.on_transport_accept(msg)),
            Action::TransportReject => Ok(self.on_transport_reject(msg, ctx)),
            Action::TransportInfo => {
                for element in &msg.contents {
                    info!(sid = %self.sid, content = %element.name, info = ?msg.info, "Transport info");
                }
                Ok(Vec::new())
            },
            Action::SecurityInfo => self.on_security_info(msg, ctx),
            Action::DescriptionInfo => Ok(self.on_description_info(msg)),
        }
    }

    fn on_session_accept(&mut self) -> Vec<Effect> {
        if self.role != Role::Initiator || self.state != SessionState::Pending {
            warn!(sid = %self.sid, state = ?self.state, "Ignoring session-accept");
            return Vec::new();
        }
        self.state = SessionState::Active;
        info!(sid = %self.sid, "Session accepted by peer");

        let mut effects = Vec::new();
        let names: Vec<String> = self.contents.keys().cloned().collect();
        for name in names {
            self.establish(&name, &mut effects);
        }
        effects
    }

    fn on_content_add(&mut self, msg: &JingleMessage, ctx: &NegotiationContext) -> Result<Vec<Effect>> {
        if self.state != SessionState::Active {
            return Err(JingleError::StateConflict("content-add before session-accept".to_string()));
        }

        let mut effects = Vec::new();
        for element in &msg.contents {
            let refusal = if self.contents.contains_key(&element.name) || element.name.is_empty() {
                Some(Reason::with_text(ReasonCondition::GeneralError, "content name in use"))
            } else if !ctx.auto_accept_content_add {
                Some(Reason::new(ReasonCondition::Decline))
            } else {
                match self.decode_content(element, ContentState::Negotiating, ctx) {
                    Ok(content) => {
                        self.contents.insert(element.name.clone(), content);
                        None
                    },
                    Err((condition, text)) => Some(Reason::with_text(condition, text)),
                }
            };

            let reply = ContentElement::named(&element.name, element.creator);
            match refusal {
                Some(reason) => {
                    debug!(sid = %self.sid, content = %element.name, condition = %reason.condition, "Rejecting content-add");
                    let msg = self.message(Action::ContentReject).with_content(reply).with_reason(reason);
                    effects.push(Effect::Send(Stanza::Jingle(msg)));
                },
                None => {
                    let msg = self.message(Action::ContentAccept).with_content(reply);
                    effects.push(Effect::Send(Stanza::Jingle(msg)));
                    self.establish(&element.name, &mut effects);
                },
            }
        }
        Ok(effects)
    }

    fn on_content_accept(&mut self, msg: &JingleMessage) -> Vec<Effect> {
        let mut effects = Vec::new();
        for element in &msg.contents {
            match self.pending.take(&element.name, PendingKind::ContentAdd) {
                Some(action) => {
                    effects.push(Effect::Disarm { id: action.id });
                    self.establish(&element.name, &mut effects);
                },
                None => debug!(sid = %self.sid, content = %element.name, "Stale content-accept"),
            }
        }
        effects
    }

    fn on_content_reject(&mut self, msg: &JingleMessage) -> Vec<Effect> {
        let reason = msg
            .reason
            .as_ref()
            .map_or(ReasonCondition::Decline, |r| r.condition);
        let mut effects = Vec::new();
        for element in &msg.contents {
            if self.pending.find(&element.name, PendingKind::ContentAdd).is_none() {
                debug!(sid = %self.sid, content = %element.name, "Stale content-reject");
                continue;
            }
            effects.extend(self.drop_content(&element.name, reason));
        }
        if self.contents.is_empty() {
            effects.extend(self.terminate_effects(Reason::new(ReasonCondition::Success), true));
        }
        effects
    }

    fn on_content_remove(&mut self, msg: &JingleMessage) -> Vec<Effect> {
        let reason = msg
            .reason
            .as_ref()
            .map_or(ReasonCondition::Cancel, |r| r.condition);
        let mut effects = Vec::new();
        for element in &msg.contents {
            if self.contents.contains_key(&element.name) {
                effects.extend(self.drop_content(&element.name, reason));
            } else {
                debug!(sid = %self.sid, content = %element.name, "content-remove for unknown content");
            }
        }
        if self.contents.is_empty() {
            effects.extend(self.terminate_effects(Reason::new(ReasonCondition::Success), true));
        }
        effects
    }

    fn on_transport_replace(&mut self, msg: &JingleMessage, ctx: &NegotiationContext) -> Vec<Effect> {
        let mut effects = Vec::new();
        for element in &msg.contents {
            let Some(content) = self.contents.get(&element.name) else {
                effects.push(self.error_reply(Action::TransportReplace, ErrorCondition::BadRequest));
                continue;
            };

            let proposed = element
                .transport
                .as_ref()
                .and_then(|p| ctx.codecs.decode_transport(p).ok())
                .filter(|t| ctx.providers.supports(t.namespace()));
            let proposed = match proposed {
                Some(t) if !content.is_blacklisted(t.namespace()) => t,
                _ => {
                    debug!(sid = %self.sid, content = %element.name, "Rejecting unusable transport-replace");
                    effects.push(self.transport_reject(element));
                    continue;
                },
            };

            if let Some(ours) = self.pending.find(&element.name, PendingKind::TransportReplace) {
                if self.role == Role::Initiator {
                    debug!(sid = %self.sid, content = %element.name, "Concurrent transport-replace; keeping ours");
                    effects.push(self.transport_reject(element));
                    continue;
                }
                let id = ours.id;
                self.pending.take_id(id);
                debug!(sid = %self.sid, content = %element.name, "Concurrent transport-replace; yielding to initiator");
                effects.push(Effect::Disarm { id });
                effects.push(Effect::Release {
                    content: element.name.clone(),
                });
            }

            let peer_role = self.role.opposite();
            let active = self.state == SessionState::Active;
            let payload = element.transport.clone();
            if let Some(content) = self.contents.get_mut(&element.name) {
                let old = content.transport().namespace();
                if old != proposed.namespace() {
                    content.blacklist_namespace(old);
                }
                debug!(sid = %self.sid, content = %element.name, from = old, to = proposed.namespace(), "Accepting transport-replace");
                content.transport = proposed;
                content.transport_offerer = peer_role;
            }

            let mut reply = ContentElement::named(&element.name, element.creator);
            reply.transport = payload;
            let msg = self.message(Action::TransportAccept).with_content(reply);
            effects.push(Effect::Send(Stanza::Jingle(msg)));
            if active {
                effects.push(Effect::Abort {
                    content: element.name.clone(),
                });
                self.establish(&element.name, &mut effects);
            }
        }
        effects
    }

    fn on_transport_accept(&mut self, msg: &JingleMessage) -> Vec<Effect> {
        let mut effects = Vec::new();
        for element in &msg.contents {
            let Some(action) = self.pending.take(&element.name, PendingKind::TransportReplace) else {
                debug!(sid = %self.sid, content = %element.name, "transport-accept without pending replace; ignoring");
                continue;
            };
            effects.push(Effect::Disarm { id: action.id });

            let (Some(proposed), Some(content)) = (action.proposed, self.contents.get_mut(&element.name)) else {
                continue;
            };
            let old = content.transport().namespace();
            if old != proposed.namespace() {
                content.blacklist_namespace(old);
            }
            content.transport = proposed;
            content.transport_offerer = self.role;

            if self.state == SessionState::Active {
                effects.push(Effect::Abort {
                    content: element.name.clone(),
                });
                self.establish(&element.name, &mut effects);
            }
        }
        effects
    }

    fn on_transport_reject(&mut self, msg: &JingleMessage, ctx: &NegotiationContext) -> Vec<Effect> {
        let mut effects = Vec::new();
        for element in &msg.contents {
            let Some(action) = self.pending.take(&element.name, PendingKind::TransportReplace) else {
                debug!(sid = %self.sid, content = %element.name, "transport-reject without pending replace; ignoring");
                continue;
            };
            effects.push(Effect::Disarm { id: action.id });
            effects.push(Effect::Release {
                content: element.name.clone(),
            });

            debug!(sid = %self.sid, content = %element.name, "transport-replace rejected");
            if !self.reject_proposal(&element.name, action.proposed.as_ref()) {
                continue;
            }
            effects.extend(self.fall_back(&element.name, ctx));
            if self.is_terminated() {
                break;
            }
        }
        effects
    }

    fn on_security_info(&mut self, msg: &JingleMessage, ctx: &NegotiationContext) -> Result<Vec<Effect>> {
        if self.state != SessionState::Pending {
            return Err(JingleError::StateConflict("security-info after session-accept".to_string()));
        }

        let mut effects = Vec::new();
        for element in &msg.contents {
            let (role, ours, peer) = (self.role, self.ours().clone(), self.peer().clone());
            let Some(content) = self.contents.get_mut(&element.name) else {
                debug!(sid = %self.sid, content = %element.name, "security-info for unknown content");
                continue;
            };
            if content.security.is_some() {
                warn!(sid = %self.sid, content = %element.name, "Second security-info for a secured content");
                effects.push(self.error_reply(Action::SecurityInfo, ErrorCondition::BadRequest));
                continue;
            }
            let Some(payload) = &element.security else {
                effects.push(self.error_reply(Action::SecurityInfo, ErrorCondition::BadRequest));
                continue;
            };

            if let Err(e) = open_security(content, payload, role, &ours, &peer, ctx) {
                warn!(sid = %self.sid, content = %element.name, "Security setup failed: {}", e);
                effects.extend(self.fail_content(&element.name, ReasonCondition::SecurityError));
                if self.is_terminated() {
                    break;
                }
            }
        }
        Ok(effects)
    }

    fn on_description_info(&self, msg: &JingleMessage) -> Vec<Effect> {
        msg.contents
            .iter()
            .filter(|element| self.contents.contains_key(&element.name))
            .map(|element| Effect::DescriptionInfo {
                content: element.name.clone(),
                info: msg.info.clone().unwrap_or(Value::Null),
            })
            .collect()
    }

    // --- helpers ---------------------------------------------------------

    fn ensure_live(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(JingleError::StateConflict(format!("session {} is terminated", self.sid)));
        }
        Ok(())
    }

    fn message(&self, action: Action) -> JingleMessage {
        JingleMessage::new(action, &self.sid, self.ours(), self.peer())
    }

    fn error_reply(&self, action: Action, condition: ErrorCondition) -> Effect {
        Effect::Send(Stanza::Error(ErrorReply {
            from: self.ours().clone(),
            to: self.peer().clone(),
            sid: self.sid.clone(),
            action: Some(action),
            condition,
        }))
    }

    fn transport_reject(&self, element: &ContentElement) -> Effect {
        let mut reply = ContentElement::named(&element.name, element.creator);
        reply.transport = element.transport.clone();
        Effect::Send(Stanza::Jingle(self.message(Action::TransportReject).with_content(reply)))
    }

    pub(crate) fn open_ctx(&self, name: &str, offerer: bool) -> OpenContext {
        OpenContext {
            sid: self.sid.clone(),
            content: name.to_string(),
            role: self.role,
            offerer,
            initiator: self.initiator.clone(),
            responder: self.responder.clone(),
        }
    }

    fn establish(&mut self, name: &str, effects: &mut Vec<Effect>) {
        let Some(offerer) = self.contents.get(name).map(|c| c.transport_offerer == self.role) else {
            return;
        };
        let ctx = self.open_ctx(name, offerer);
        if let Some(content) = self.contents.get_mut(name) {
            content.state = ContentState::Establishing;
            effects.push(Effect::Establish {
                content: name.to_string(),
                transport: content.transport.clone(),
                ctx,
            });
        }
    }

    fn build_content(
        &self,
        name: &str,
        offer: ContentOffer,
        state: ContentState,
        ctx: &NegotiationContext,
    ) -> Result<Content> {
        let provider = match &offer.transport {
            Some(namespace) => ctx
                .providers
                .get(namespace)
                .ok_or_else(|| JingleError::UnsupportedNamespace(namespace.clone()))?,
            None => ctx
                .providers
                .next_untried(|_| true)
                .ok_or_else(|| JingleError::UnsupportedNamespace("no transport providers".to_string()))?,
        };
        let transport = provider.prepare(&self.open_ctx(name, true))?;

        let mut content = Content::new(
            name.to_string(),
            self.role,
            offer.senders,
            offer.description,
            transport,
            state,
        );
        if let Some(key_transport) = &offer.key_transport {
            seal_content(&mut content, self.role, self.ours(), self.peer(), key_transport, ctx)?;
        }
        Ok(content)
    }

    fn decode_content(
        &self,
        element: &ContentElement,
        state: ContentState,
        ctx: &NegotiationContext,
    ) -> std::result::Result<Content, (ReasonCondition, String)> {
        let description = element
            .description
            .as_ref()
            .ok_or_else(|| "missing description".to_string())
            .and_then(|p| ctx.codecs.decode_description(p).map_err(|e| e.to_string()))
            .map_err(|text| (ReasonCondition::UnsupportedApplications, text))?;

        let transport = element
            .transport
            .as_ref()
            .ok_or_else(|| "missing transport".to_string())
            .and_then(|p| ctx.codecs.decode_transport(p).map_err(|e| e.to_string()))
            .and_then(|t| {
                if ctx.providers.supports(t.namespace()) {
                    Ok(t)
                } else {
                    Err(format!("no provider for {}", t.namespace()))
                }
            })
            .map_err(|text| (ReasonCondition::UnsupportedTransports, text))?;

        let mut content = Content::new(
            element.name.clone(),
            element.creator,
            element.senders,
            description,
            transport,
            state,
        );
        content.transport_offerer = self.role.opposite();

        if let Some(payload) = &element.security {
            open_security(&mut content, payload, self.role, self.ours(), self.peer(), ctx)
                .map_err(|e| (ReasonCondition::SecurityError, e.to_string()))?;
        }
        Ok(content)
    }

    fn propose_transport(
        &mut self,
        name: &str,
        provider: &Arc<dyn ChannelProvider>,
        ctx: &NegotiationContext,
    ) -> Result<Vec<Effect>> {
        let creator = self
            .contents
            .get(name)
            .map(Content::creator)
            .ok_or_else(|| JingleError::UnknownContent(name.to_string()))?;
        let transport = provider.prepare(&self.open_ctx(name, true))?;
        let element = ContentElement::named(name, creator).with_transport(transport.to_payload()?);

        debug!(sid = %self.sid, content = %name, transport = transport.namespace(), "Proposing transport-replace");
        let id = self
            .pending
            .insert(PendingKind::TransportReplace, name, Some(transport), ctx.pending_timeout);
        let msg = self.message(Action::TransportReplace).with_content(element);
        Ok(vec![
            Effect::Send(Stanza::Jingle(msg)),
            Effect::Arm {
                id,
                timeout: ctx.pending_timeout,
            },
        ])
    }

    /// Blacklist a refused or unanswered proposal. Returns whether the
    /// content still needs a new transport, i.e. its current one failed.
    fn reject_proposal(&mut self, name: &str, proposed: Option<&Transport>) -> bool {
        let Some(content) = self.contents.get_mut(name) else {
            return false;
        };
        if let Some(proposed) = proposed {
            content.blacklist_namespace(proposed.namespace());
        }
        content.is_blacklisted(content.transport().namespace())
    }

    /// Offer the next usable namespace, or give up on the content.
    fn fall_back(&mut self, name: &str, ctx: &NegotiationContext) -> Vec<Effect> {
        loop {
            let Some(content) = self.contents.get(name) else {
                return Vec::new();
            };
            let current = content.transport().namespace();
            let next = ctx
                .providers
                .next_untried(|ns| ns != current && !content.is_blacklisted(ns) && ctx.codecs.supports_transport(ns))
                .cloned();

            let Some(provider) = next else {
                warn!(sid = %self.sid, content = %name, "No transport left to try");
                return self.fail_content(name, ReasonCondition::FailedTransport);
            };
            match self.propose_transport(name, &provider, ctx) {
                Ok(effects) => return effects,
                Err(e) => {
                    warn!(sid = %self.sid, content = %name, transport = provider.namespace(), "Cannot prepare fallback: {}", e);
                    if let Some(content) = self.contents.get_mut(name) {
                        content.blacklist_namespace(provider.namespace());
                    }
                },
            }
        }
    }

    /// Give up on a content; the session ends if it was the only one.
    fn fail_content(&mut self, name: &str, reason: ReasonCondition) -> Vec<Effect> {
        let Some(creator) = self.contents.get(name).map(Content::creator) else {
            return Vec::new();
        };
        if self.contents.len() <= 1 {
            return self.terminate_effects(Reason::new(reason), true);
        }

        let msg = self
            .message(Action::ContentRemove)
            .with_content(ContentElement::named(name, creator))
            .with_reason(Reason::new(reason));
        let mut effects = vec![Effect::Send(Stanza::Jingle(msg))];
        effects.extend(self.drop_content(name, reason));
        effects
    }

    fn drop_content(&mut self, name: &str, reason: ReasonCondition) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.contents.shift_remove(name).is_none() {
            return effects;
        }
        for id in self.pending.remove_content(name) {
            effects.push(Effect::Disarm { id });
        }
        effects.push(Effect::Close {
            content: name.to_string(),
        });
        effects.push(Effect::ContentRemoved {
            content: name.to_string(),
            reason,
        });
        debug!(sid = %self.sid, content = %name, %reason, "Content removed");
        effects
    }

    fn terminate_effects(&mut self, reason: Reason, notify_peer: bool) -> Vec<Effect> {
        self.state = SessionState::Terminated;
        let mut effects = Vec::new();
        if notify_peer {
            let msg = self.message(Action::SessionTerminate).with_reason(reason.clone());
            effects.push(Effect::Send(Stanza::Jingle(msg)));
        }
        for id in self.pending.clear() {
            effects.push(Effect::Disarm { id });
        }
        for (name, content) in &mut self.contents {
            content.cipher = None;
            effects.push(Effect::Close { content: name.clone() });
        }
        effects.push(Effect::Terminated {
            reason: reason.condition,
        });
        info!(sid = %self.sid, reason = %reason.condition, "Session terminated");
        effects
    }

    fn release_reservations(&self, ctx: &NegotiationContext, extra: Option<&str>) {
        let names = self.contents.keys().map(String::as_str).chain(extra);
        for name in names {
            let open = self.open_ctx(name, true);
            for provider in ctx.providers.iter() {
                provider.release(&open);
            }
        }
    }
}

/// Generate a cipher unit for a content we send, and its Security element
fn seal_content(
    content: &mut Content,
    role: Role,
    ours: &Jid,
    peer: &Jid,
    key_transport: &str,
    ctx: &NegotiationContext,
) -> Result<()> {
    if !content.sends_data(role) {
        return Err(JingleError::StateConflict(format!(
            "only the sending side encrypts {}",
            content.name()
        )));
    }
    let codec = ctx.key_transports.get(key_transport)?;
    let unit = CipherUnit::generate(ctx.cipher)?;
    let body = codec.encode(&unit.key_and_iv(), ours, peer)?;

    content.security = Some(Security::Jet(JetSecurity {
        cipher: ctx.cipher.namespace().to_string(),
        key_transport: Payload::new(key_transport, body),
    }));
    content.cipher = Some(unit);
    Ok(())
}

/// Rebuild the peer's cipher unit from a Security element
fn open_security(
    content: &mut Content,
    payload: &Payload,
    role: Role,
    ours: &Jid,
    peer: &Jid,
    ctx: &NegotiationContext,
) -> Result<()> {
    if content.sends_data(role) {
        return Err(JingleError::ProtocolViolation(format!(
            "peer sent a key for {}, which we send",
            content.name()
        )));
    }
    let security = ctx.codecs.decode_security(payload)?;
    let jet = security.as_jet();
    let kind = jet.cipher_kind()?;
    let codec = ctx.key_transports.get(&jet.key_transport.namespace)?;
    let key_and_iv = codec.decode(&jet.key_transport.body, ours, peer)?;
    let unit = CipherUnit::from_key_and_iv(kind, &key_and_iv)?;

    content.security = Some(security);
    content.cipher = Some(unit);
    Ok(())
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Session id
    pub sid: String,
    /// Our role
    pub role: Role,
    /// State
    pub state: SessionState,
    /// Initiator
    pub initiator: Jid,
    /// Responder
    pub responder: Jid,
    /// Contents, in negotiation order
    pub contents: Vec<ContentSnapshot>,
    /// Outstanding local actions
    pub pending_actions: usize,
}

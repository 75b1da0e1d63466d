//! Application callbacks.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::registry::SessionRegistry;
use crate::codec::Description;
use crate::error::Result;
use crate::jid::Jid;
use crate::protocol::{ContentSnapshot, ReasonCondition};
use crate::transport::ContentChannel;

/// Receives everything the engine reports to the application.
///
/// Callbacks run on engine tasks and must not block. Every method has an
/// empty default, so listeners implement only what they need.
pub trait SessionListener: Send + Sync {
    /// A peer wants to start a session; answer through the handle
    fn on_incoming_session(&self, _incoming: IncomingSession) {}

    /// A content's channel is ready for use
    fn on_channel_ready(&self, _sid: &str, _content: &str, _channel: ContentChannel) {}

    /// A content could not be carried: no transport, timeout, security
    /// failure. See [`ReasonCondition::is_failure`].
    fn on_channel_failed(&self, _sid: &str, _content: &str, _reason: ReasonCondition) {}

    /// A content was removed on purpose by either party
    fn on_content_removed(&self, _sid: &str, _content: &str, _reason: ReasonCondition) {}

    /// The peer sent an application-level notice
    fn on_description_info(&self, _sid: &str, _content: &str, _info: Value) {}

    /// The session ended
    fn on_session_terminated(&self, _sid: &str, _reason: ReasonCondition) {}
}

/// A listener that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullListener;

impl SessionListener for NullListener {}

/// One engine notification, as delivered by [`EventSink`]
#[derive(Debug)]
pub enum SessionEvent {
    /// See [`SessionListener::on_incoming_session`]
    Incoming(IncomingSession),
    /// See [`SessionListener::on_channel_ready`]
    ChannelReady {
        /// Session id
        sid: String,
        /// Content name
        content: String,
        /// The channel
        channel: ContentChannel,
    },
    /// See [`SessionListener::on_channel_failed`]
    ChannelFailed {
        /// Session id
        sid: String,
        /// Content name
        content: String,
        /// Why
        reason: ReasonCondition,
    },
    /// See [`SessionListener::on_content_removed`]
    ContentRemoved {
        /// Session id
        sid: String,
        /// Content name
        content: String,
        /// Why
        reason: ReasonCondition,
    },
    /// See [`SessionListener::on_description_info`]
    DescriptionInfo {
        /// Session id
        sid: String,
        /// Content name
        content: String,
        /// Payload
        info: Value,
    },
    /// See [`SessionListener::on_session_terminated`]
    Terminated {
        /// Session id
        sid: String,
        /// Why
        reason: ReasonCondition,
    },
}

impl SessionEvent {
    /// Session the event belongs to
    pub fn sid(&self) -> &str {
        match self {
            Self::Incoming(incoming) => incoming.sid(),
            Self::ChannelReady { sid, .. }
            | Self::ChannelFailed { sid, .. }
            | Self::ContentRemoved { sid, .. }
            | Self::DescriptionInfo { sid, .. }
            | Self::Terminated { sid, .. } => sid,
        }
    }
}

/// Forwards callbacks onto a channel of [`SessionEvent`]s
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    /// Sink plus the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

impl SessionListener for EventSink {
    fn on_incoming_session(&self, incoming: IncomingSession) {
        self.emit(SessionEvent::Incoming(incoming));
    }

    fn on_channel_ready(&self, sid: &str, content: &str, channel: ContentChannel) {
        self.emit(SessionEvent::ChannelReady {
            sid: sid.to_string(),
            content: content.to_string(),
            channel,
        });
    }

    fn on_channel_failed(&self, sid: &str, content: &str, reason: ReasonCondition) {
        self.emit(SessionEvent::ChannelFailed {
            sid: sid.to_string(),
            content: content.to_string(),
            reason,
        });
    }

    fn on_content_removed(&self, sid: &str, content: &str, reason: ReasonCondition) {
        self.emit(SessionEvent::ContentRemoved {
            sid: sid.to_string(),
            content: content.to_string(),
            reason,
        });
    }

    fn on_description_info(&self, sid: &str, content: &str, info: Value) {
        self.emit(SessionEvent::DescriptionInfo {
            sid: sid.to_string(),
            content: content.to_string(),
            info,
        });
    }

    fn on_session_terminated(&self, sid: &str, reason: ReasonCondition) {
        self.emit(SessionEvent::Terminated {
            sid: sid.to_string(),
            reason,
        });
    }
}

/// A content offered by the peer
#[derive(Debug, Clone)]
pub struct OfferedContent {
    /// Negotiation view of the content
    pub snapshot: ContentSnapshot,
    /// What is offered
    pub description: Description,
}

/// Accept/decline handle for an incoming session.
///
/// Dropping the handle leaves the session pending until the peer gives up
/// or the registry shuts down.
pub struct IncomingSession {
    pub(crate) sid: String,
    pub(crate) peer: Jid,
    pub(crate) contents: Vec<OfferedContent>,
    pub(crate) registry: SessionRegistry,
}

impl IncomingSession {
    /// Session id
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Who is asking
    pub fn peer(&self) -> &Jid {
        &self.peer
    }

    /// Offered contents, in the peer's order
    pub fn contents(&self) -> &[OfferedContent] {
        &self.contents
    }

    /// Accept the session; transports start establishing
    pub async fn accept(self) -> Result<()> {
        self.registry.accept(&self.sid).await
    }

    /// Decline the session
    pub async fn decline(self) -> Result<()> {
        self.registry.decline(&self.sid).await
    }
}

impl std::fmt::Debug for IncomingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingSession")
            .field("sid", &self.sid)
            .field("peer", &self.peer)
            .field("contents", &self.contents)
            .finish_non_exhaustive()
    }
}

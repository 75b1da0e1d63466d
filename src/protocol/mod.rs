//! Jingle session negotiation.
//!
//! Two peers negotiate one or more *contents* inside a session. Each content
//! pairs an application description with a transport descriptor and,
//! optionally, a security element. Transports can be replaced mid-session
//! when establishment fails, without tearing the session down.
//!
//! ## Message Flow
//!
//! ```text
//! Initiator                              Responder
//!    |                                       |
//!    |------ session-initiate (contents) --->|  Session pending on both sides
//!    |                                       |
//!    |<------------ session-accept ----------|  Both sides active
//!    |                                       |
//!    |========= transport establishment ====|  One attempt per content
//!    |                                       |
//!    |---- transport-replace (fallback) ---->|  On failure: next namespace
//!    |<----------- transport-accept ---------|
//!    |                                       |
//!    |------------ session-terminate ------->|  Terminal, never revived
//! ```
//!
//! ## State Machine
//!
//! | State        | Description                          | Valid Transitions |
//! |--------------|--------------------------------------|-------------------|
//! | `Pending`    | initiate sent/received, not accepted | → Active, Terminated |
//! | `Active`     | accepted, contents establishing      | → Terminated      |
//! | `Terminated` | ended (terminal)                     | none              |
//!
//! [`Session`] is a synchronous state machine: every operation returns the
//! [`Effect`]s the engine must carry out (stanzas to send, establishment to
//! start or cancel, timers to arm). It never performs I/O itself.

mod content;
mod message;
mod pending;
mod session;

pub use content::{Content, ContentOffer, ContentSnapshot, ContentState};
pub use message::{
    Action, ContentElement, DataKind, DataPacket, ErrorCondition, ErrorReply, JingleMessage, Reason,
    ReasonCondition, Stanza,
};
pub use pending::{PendingAction, PendingKind, PendingLedger};
pub use session::{
    Effect, NegotiationContext, Session, SessionSnapshot, SessionState, DEFAULT_PENDING_TIMEOUT,
    DEFAULT_TOMBSTONE_CAPACITY,
};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{JingleError, Result};

/// Jingle signaling namespace
pub const NS_JINGLE: &str = "urn:xmpp:jingle:1";

/// In-band relay transport namespace
pub const NS_IBB: &str = "urn:xmpp:jingle:transports:ibb:1";

/// Candidate socket transport namespace
pub const NS_S5B: &str = "urn:xmpp:jingle:transports:s5b:1";

/// File-transfer application namespace
pub const NS_FILE_TRANSFER: &str = "urn:xmpp:jingle:apps:file-transfer:5";

/// Encrypted-transport security namespace
pub const NS_JET: &str = "urn:xmpp:jingle:jet:0";

/// Side of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sent session-initiate
    Initiator,
    /// Received session-initiate
    Responder,
}

impl Role {
    /// The other side
    pub fn opposite(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

/// Which parties send media for a content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Senders {
    /// Nobody
    None,
    /// Only the initiator
    Initiator,
    /// Only the responder
    Responder,
    /// Both parties
    #[default]
    Both,
}

/// Outbound half of the signaling connection.
pub trait StanzaSink: Send + Sync {
    /// Hand a stanza to the connection
    fn send(&self, stanza: Stanza) -> Result<()>;
}

impl StanzaSink for mpsc::UnboundedSender<Stanza> {
    fn send(&self, stanza: Stanza) -> Result<()> {
        mpsc::UnboundedSender::send(self, stanza)
            .map_err(|e| JingleError::ConnectionClosed(format!("stanza dropped: {:?}", e.0.sid())))
    }
}

/// Random alphanumeric token for content names, stream ids and candidate ids
pub(crate) fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

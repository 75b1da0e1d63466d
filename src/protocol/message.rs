//! Stanzas exchanged over the signaling connection.
//!
//! Everything is serialized as JSON. A [`Stanza`] is one of a Jingle
//! action, an in-band data packet, or an error reply.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Role, Senders};
use crate::codec::Payload;
use crate::jid::Jid;

/// Jingle actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Offer a new session
    SessionInitiate,
    /// Accept an offered session
    SessionAccept,
    /// End a session
    SessionTerminate,
    /// Session-level informational ping
    SessionInfo,
    /// Add a content to an active session
    ContentAdd,
    /// Accept an added content
    ContentAccept,
    /// Refuse an added content
    ContentReject,
    /// Remove a content
    ContentRemove,
    /// Propose a different transport for a content
    TransportReplace,
    /// Accept a proposed transport
    TransportAccept,
    /// Refuse a proposed transport
    TransportReject,
    /// Transport-level notice (candidate used / candidate error)
    TransportInfo,
    /// Security key exchange continuation
    SecurityInfo,
    /// Application-level notice
    DescriptionInfo,
}

impl Action {
    /// Wire name of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionInitiate => "session-initiate",
            Self::SessionAccept => "session-accept",
            Self::SessionTerminate => "session-terminate",
            Self::SessionInfo => "session-info",
            Self::ContentAdd => "content-add",
            Self::ContentAccept => "content-accept",
            Self::ContentReject => "content-reject",
            Self::ContentRemove => "content-remove",
            Self::TransportReplace => "transport-replace",
            Self::TransportAccept => "transport-accept",
            Self::TransportReject => "transport-reject",
            Self::TransportInfo => "transport-info",
            Self::SecurityInfo => "security-info",
            Self::DescriptionInfo => "description-info",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session or content ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCondition {
    /// Completed normally
    Success,
    /// Responder declined
    Decline,
    /// Party cancelled
    Cancel,
    /// Party went away
    Gone,
    /// Something timed out
    Timeout,
    /// No transport could be established
    FailedTransport,
    /// Application failed
    FailedApplication,
    /// No description namespace understood
    UnsupportedApplications,
    /// No transport namespace understood
    UnsupportedTransports,
    /// Security element could not be used
    SecurityError,
    /// Anything else
    GeneralError,
}

impl ReasonCondition {
    /// Whether the condition reports something going wrong, as opposed to
    /// a party ending things on purpose
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Success | Self::Decline | Self::Cancel | Self::Gone)
    }
}

impl fmt::Display for ReasonCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&s)
    }
}

/// Reason element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reason {
    /// Condition
    pub condition: ReasonCondition,
    /// Free-form text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Reason {
    /// Reason without text
    pub fn new(condition: ReasonCondition) -> Self {
        Self { condition, text: None }
    }

    /// Reason with text
    pub fn with_text(condition: ReasonCondition, text: impl Into<String>) -> Self {
        Self {
            condition,
            text: Some(text.into()),
        }
    }
}

/// Content element as carried by Jingle actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentElement {
    /// Content name, unique within the session
    pub name: String,
    /// Who created the content
    pub creator: Role,
    /// Who sends media
    #[serde(default)]
    pub senders: Senders,
    /// Application description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Payload>,
    /// Transport descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Payload>,
    /// Security element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<Payload>,
}

impl ContentElement {
    /// Bare element naming a content
    pub fn named(name: &str, creator: Role) -> Self {
        Self {
            name: name.to_string(),
            creator,
            senders: Senders::default(),
            description: None,
            transport: None,
            security: None,
        }
    }

    /// Attach a transport payload
    pub fn with_transport(mut self, transport: Payload) -> Self {
        self.transport = Some(transport);
        self
    }
}

/// A Jingle action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JingleMessage {
    /// Sender address
    pub from: Jid,
    /// Recipient address
    pub to: Jid,
    /// Session id
    pub sid: String,
    /// Action
    pub action: Action,
    /// Session initiator, set on session-initiate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<Jid>,
    /// Session responder, set on session-accept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder: Option<Jid>,
    /// Contents the action refers to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contents: Vec<ContentElement>,
    /// Reason, on terminate/reject/remove
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    /// Informational payload (session-info, description-info, transport-info)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

impl JingleMessage {
    /// Create a message with no contents
    pub fn new(action: Action, sid: &str, from: &Jid, to: &Jid) -> Self {
        Self {
            from: from.clone(),
            to: to.clone(),
            sid: sid.to_string(),
            action,
            initiator: None,
            responder: None,
            contents: Vec::new(),
            reason: None,
            info: None,
        }
    }

    /// Attach a content element
    pub fn with_content(mut self, content: ContentElement) -> Self {
        self.contents.push(content);
        self
    }

    /// Attach a reason
    pub fn with_reason(mut self, reason: Reason) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Attach an informational payload
    pub fn with_info(mut self, info: Value) -> Self {
        self.info = Some(info);
        self
    }

    /// The single content element, for actions that carry exactly one
    pub fn single_content(&self) -> Option<&ContentElement> {
        match self.contents.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }
}

/// In-band data packet body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DataKind {
    /// One chunk of the stream
    Data {
        /// Wrapping sequence number, starting at 0
        seq: u16,
        /// Base64 chunk
        data: String,
    },
    /// End of stream
    Close,
}

/// In-band data packet, addressed by transport stream id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPacket {
    /// Transport namespace the packet belongs to
    pub namespace: String,
    /// Sender address
    pub from: Jid,
    /// Recipient address
    pub to: Jid,
    /// Transport stream id
    pub sid: String,
    /// Body
    #[serde(flatten)]
    pub kind: DataKind,
}

/// Peer-visible error conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCondition {
    /// A session with this id already exists
    Conflict,
    /// No such session (or it already ended)
    UnknownSession,
    /// Malformed request
    BadRequest,
    /// Action not legal in the current state
    OutOfOrder,
    /// Informational payload not understood
    UnsupportedInfo,
}

/// Error reply to a stanza
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Sender address
    pub from: Jid,
    /// Recipient address
    pub to: Jid,
    /// Session (or stream) id the failed stanza carried
    pub sid: String,
    /// Action that failed, if it was a Jingle action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    /// Condition
    pub condition: ErrorCondition,
}

/// Anything sent over the signaling connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Stanza {
    /// Jingle action
    Jingle(JingleMessage),
    /// In-band data
    Data(DataPacket),
    /// Error reply
    Error(ErrorReply),
}

impl Stanza {
    /// Session or stream id
    pub fn sid(&self) -> &str {
        match self {
            Self::Jingle(m) => &m.sid,
            Self::Data(p) => &p.sid,
            Self::Error(e) => &e.sid,
        }
    }

    /// Sender address
    pub fn from(&self) -> &Jid {
        match self {
            Self::Jingle(m) => &m.from,
            Self::Data(p) => &p.from,
            Self::Error(e) => &e.from,
        }
    }

    /// Recipient address
    pub fn to(&self) -> &Jid {
        match self {
            Self::Jingle(m) => &m.to,
            Self::Data(p) => &p.to,
            Self::Error(e) => &e.to,
        }
    }

    /// Serialize to JSON text
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from JSON text
    pub fn from_json(text: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn romeo() -> Jid {
        "romeo@montague.lit/orchard".parse().unwrap()
    }

    fn juliet() -> Jid {
        "juliet@capulet.lit/balcony".parse().unwrap()
    }

    #[test]
    fn test_failure_conditions() {
        assert!(!ReasonCondition::Success.is_failure());
        assert!(!ReasonCondition::Cancel.is_failure());
        assert!(ReasonCondition::FailedTransport.is_failure());
        assert!(ReasonCondition::Timeout.is_failure());
        assert!(ReasonCondition::SecurityError.is_failure());
    }

    #[test]
    fn test_action_wire_names() {
        for action in [
            Action::SessionInitiate,
            Action::TransportReplace,
            Action::SecurityInfo,
            Action::DescriptionInfo,
        ] {
            let v = serde_json::to_value(action).unwrap();
            assert_eq!(v, json!(action.as_str()));
        }
        assert_eq!(ReasonCondition::FailedTransport.to_string(), "failed-transport");
    }

    #[test]
    fn test_jingle_stanza_json() {
        let msg = JingleMessage::new(Action::SessionTerminate, "s1", &romeo(), &juliet())
            .with_reason(Reason::new(ReasonCondition::Success));
        let text = Stanza::Jingle(msg.clone()).to_json().unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "jingle");
        assert_eq!(v["action"], "session-terminate");
        assert_eq!(v["reason"]["condition"], "success");
        assert!(v.get("contents").is_none());

        assert_eq!(Stanza::from_json(&text).unwrap(), Stanza::Jingle(msg));
    }

    #[test]
    fn test_data_packet_json() {
        let packet = DataPacket {
            namespace: super::super::NS_IBB.to_string(),
            from: romeo(),
            to: juliet(),
            sid: "ibb1".to_string(),
            kind: DataKind::Data {
                seq: 0,
                data: "aGVsbG8=".to_string(),
            },
        };
        let v = serde_json::to_value(Stanza::Data(packet.clone())).unwrap();
        assert_eq!(v["kind"], "data");
        assert_eq!(v["seq"], 0);

        let close: Stanza = serde_json::from_value(json!({
            "type": "data",
            "namespace": super::super::NS_IBB,
            "from": "romeo@montague.lit/orchard",
            "to": "juliet@capulet.lit/balcony",
            "sid": "ibb1",
            "kind": "close"
        }))
        .unwrap();
        assert!(matches!(close, Stanza::Data(DataPacket { kind: DataKind::Close, .. })));
    }

    #[test]
    fn test_rejects_invalid_address() {
        let bad = json!({
            "type": "error",
            "from": "not an address",
            "to": "juliet@capulet.lit/balcony",
            "sid": "s",
            "condition": "conflict"
        });
        assert!(serde_json::from_value::<Stanza>(bad).is_err());
    }

    #[test]
    fn test_single_content() {
        let msg = JingleMessage::new(Action::ContentRemove, "s", &romeo(), &juliet());
        assert!(msg.single_content().is_none());
        let msg = msg.with_content(ContentElement::named("a", Role::Initiator));
        assert_eq!(msg.single_content().unwrap().name, "a");
    }
}

//! Contents: one negotiated exchange inside a session.

use std::collections::BTreeSet;

use serde::Serialize;

use super::message::ContentElement;
use super::{random_token, Role, Senders};
use crate::codec::{Description, FileDirection, Security, Transport};
use crate::crypto::CipherUnit;
use crate::error::Result;

/// Negotiation progress of a content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentState {
    /// Part of a session that is not yet accepted
    Negotiating,
    /// Added to an active session, awaiting content-accept
    Proposed,
    /// Transport establishment in progress
    Establishing,
    /// Channel handed to the application
    Established,
}

/// A content as the engine tracks it.
#[derive(Debug)]
pub struct Content {
    pub(crate) name: String,
    pub(crate) creator: Role,
    pub(crate) senders: Senders,
    pub(crate) description: Description,
    pub(crate) transport: Transport,
    /// Who offered the current transport descriptor
    pub(crate) transport_offerer: Role,
    pub(crate) security: Option<Security>,
    pub(crate) cipher: Option<CipherUnit>,
    pub(crate) state: ContentState,
    blacklist: BTreeSet<String>,
}

impl Content {
    pub(crate) fn new(
        name: String,
        creator: Role,
        senders: Senders,
        description: Description,
        transport: Transport,
        state: ContentState,
    ) -> Self {
        Self {
            name,
            creator,
            senders,
            description,
            transport,
            transport_offerer: creator,
            security: None,
            cipher: None,
            state,
            blacklist: BTreeSet::new(),
        }
    }

    /// Content name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Who created the content
    pub fn creator(&self) -> Role {
        self.creator
    }

    /// Who sends media
    pub fn senders(&self) -> Senders {
        self.senders
    }

    /// Application description
    pub fn description(&self) -> &Description {
        &self.description
    }

    /// Current transport descriptor
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Security element, if the content is encrypted
    pub fn security(&self) -> Option<&Security> {
        self.security.as_ref()
    }

    /// Negotiation progress
    pub fn state(&self) -> ContentState {
        self.state
    }

    /// Whether the side playing `role` writes the file bytes
    pub fn sends_data(&self, role: Role) -> bool {
        let sender = match &self.description {
            Description::FileTransfer(ft) => match ft.direction {
                FileDirection::Offer => self.creator,
                FileDirection::Request => self.creator.opposite(),
            },
        };
        sender == role
    }

    /// Namespaces already tried and rejected or failed
    pub fn blacklist(&self) -> &BTreeSet<String> {
        &self.blacklist
    }

    /// Whether a namespace must not be offered again
    pub fn is_blacklisted(&self, namespace: &str) -> bool {
        self.blacklist.contains(namespace)
    }

    /// Never removes; the set only grows.
    pub(crate) fn blacklist_namespace(&mut self, namespace: &str) {
        self.blacklist.insert(namespace.to_string());
    }

    /// Render for session-initiate / content-add
    pub(crate) fn to_element(&self, with_security: bool) -> Result<ContentElement> {
        let security = match (&self.security, with_security) {
            (Some(security), true) => Some(security.to_payload()?),
            _ => None,
        };
        Ok(ContentElement {
            name: self.name.clone(),
            creator: self.creator,
            senders: self.senders,
            description: Some(self.description.to_payload()?),
            transport: Some(self.transport.to_payload()?),
            security,
        })
    }

    pub(crate) fn snapshot(&self) -> ContentSnapshot {
        ContentSnapshot {
            name: self.name.clone(),
            creator: self.creator,
            senders: self.senders,
            state: self.state,
            transport: self.transport.namespace().to_string(),
            blacklist: self.blacklist.iter().cloned().collect(),
            secured: self.security.is_some(),
        }
    }
}

/// Read-only view of a content
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentSnapshot {
    /// Content name
    pub name: String,
    /// Creator
    pub creator: Role,
    /// Senders
    pub senders: Senders,
    /// Progress
    pub state: ContentState,
    /// Current transport namespace
    pub transport: String,
    /// Blacklisted transport namespaces
    pub blacklist: Vec<String>,
    /// Whether the content carries a security element
    pub secured: bool,
}

/// What the application asks to negotiate.
#[derive(Debug, Clone)]
pub struct ContentOffer {
    /// Content name; a random token when omitted
    pub name: Option<String>,
    /// Application description
    pub description: Description,
    /// Who sends media
    pub senders: Senders,
    /// Transport namespace to try first; the most preferred provider when omitted
    pub transport: Option<String>,
    /// Key-transport namespace; the content is encrypted when set
    pub key_transport: Option<String>,
}

impl ContentOffer {
    /// Offer a description with default settings
    pub fn new(description: Description) -> Self {
        Self {
            name: None,
            description,
            senders: Senders::default(),
            transport: None,
            key_transport: None,
        }
    }

    /// Set the content name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Set the senders
    pub fn with_senders(mut self, senders: Senders) -> Self {
        self.senders = senders;
        self
    }

    /// Try this transport namespace first
    pub fn with_transport(mut self, namespace: &str) -> Self {
        self.transport = Some(namespace.to_string());
        self
    }

    /// Encrypt the content, transporting the key with this codec
    pub fn secured(mut self, key_transport: &str) -> Self {
        self.key_transport = Some(key_transport.to_string());
        self
    }

    pub(crate) fn content_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| random_token(8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FileInfo, FileTransfer, InBandTransport};
    use proptest::prelude::*;

    fn content(direction: FileDirection, creator: Role) -> Content {
        let ft = match direction {
            FileDirection::Offer => FileTransfer::offer(FileInfo::new("a.txt", 1)),
            FileDirection::Request => FileTransfer::request(FileInfo::new("a.txt", 1)),
        };
        Content::new(
            "file".to_string(),
            creator,
            Senders::Initiator,
            Description::FileTransfer(ft),
            Transport::InBand(InBandTransport::new("ibb", 4096)),
            ContentState::Negotiating,
        )
    }

    #[test]
    fn test_data_sender() {
        let offer = content(FileDirection::Offer, Role::Initiator);
        assert!(offer.sends_data(Role::Initiator));
        assert!(!offer.sends_data(Role::Responder));

        let request = content(FileDirection::Request, Role::Initiator);
        assert!(request.sends_data(Role::Responder));
    }

    #[test]
    fn test_element_omits_security_unless_asked() {
        let c = content(FileDirection::Offer, Role::Initiator);
        let element = c.to_element(true).unwrap();
        assert!(element.security.is_none());
        assert!(element.description.is_some());
        assert_eq!(c.snapshot().transport, crate::protocol::NS_IBB);
    }

    #[test]
    fn test_offer_name_defaults_to_token() {
        let offer = ContentOffer::new(content(FileDirection::Offer, Role::Initiator).description);
        assert_eq!(offer.content_name().len(), 8);
        assert_eq!(offer.with_name("x").content_name(), "x");
    }

    proptest! {
        #[test]
        fn prop_blacklist_only_grows(ops in proptest::collection::vec(0u8..4, 0..40)) {
            let mut c = content(FileDirection::Offer, Role::Initiator);
            let mut seen = BTreeSet::new();
            for op in ops {
                let ns = format!("urn:example:{op}");
                let before = c.blacklist().len();
                c.blacklist_namespace(&ns);
                seen.insert(ns.clone());
                prop_assert!(c.blacklist().len() >= before);
                prop_assert!(c.is_blacklisted(&ns));
            }
            prop_assert_eq!(c.blacklist(), &seen);
        }
    }
}

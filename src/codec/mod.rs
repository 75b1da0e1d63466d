//! Payload codecs for the three polymorphic parts of a content.
//!
//! Each part is a closed tagged variant, keyed on the wire by namespace:
//!
//! | Part          | Variant                         | Namespace                           |
//! |---------------|---------------------------------|-------------------------------------|
//! | Description   | [`Description::FileTransfer`]   | `urn:xmpp:jingle:apps:file-transfer:5` |
//! | Transport     | [`Transport::InBand`]           | `urn:xmpp:jingle:transports:ibb:1`  |
//! | Transport     | [`Transport::Socket`]           | `urn:xmpp:jingle:transports:s5b:1`  |
//! | Security      | [`Security::Jet`]               | `urn:xmpp:jingle:jet:0`             |
//!
//! Extension elements travel as a [`Payload`]: the namespace plus a JSON
//! body. The [`CodecRegistry`] resolves the namespace to a decoder once, at
//! engine construction; encoding is a method on each variant.
//!
//! ```rust,ignore
//! use jingle::codec::{CodecRegistry, Transport, InBandTransport};
//!
//! let registry = CodecRegistry::default();
//! let transport = Transport::InBand(InBandTransport::new("ibb-1", 4096));
//! let payload = transport.to_payload()?;
//! assert_eq!(registry.decode_transport(&payload)?, transport);
//! ```

mod description;
mod security;
mod transport;

pub use description::{Description, FileDirection, FileInfo, FileTransfer, HashValue};
pub use security::{JetSecurity, Security};
pub use transport::{Candidate, CandidateKind, InBandTransport, SocketTransport, Transport};

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{JingleError, Result};
use crate::protocol::{NS_FILE_TRANSFER, NS_IBB, NS_JET, NS_S5B};

/// A namespaced extension element in wire form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Namespace that selects the codec
    pub namespace: String,
    /// Element body
    #[serde(default)]
    pub body: Value,
}

impl Payload {
    /// Create a payload
    pub fn new(namespace: impl Into<String>, body: Value) -> Self {
        Self {
            namespace: namespace.into(),
            body,
        }
    }

    /// Serialize a body into a payload
    pub fn encode<T: Serialize>(namespace: &str, body: &T) -> Result<Self> {
        Ok(Self::new(namespace, serde_json::to_value(body)?))
    }

    /// Deserialize the body, mapping failures to protocol violations
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.body.clone()).map_err(|e| {
            JingleError::ProtocolViolation(format!("malformed {} payload: {}", self.namespace, e))
        })
    }
}

/// Decoder for one namespace
pub type Decoder<T> = fn(&Payload) -> Result<T>;

/// Namespace → decoder tables, built once and shared read-only.
#[derive(Clone)]
pub struct CodecRegistry {
    descriptions: HashMap<String, Decoder<Description>>,
    transports: HashMap<String, Decoder<Transport>>,
    securities: HashMap<String, Decoder<Security>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::empty()
            .with_description(NS_FILE_TRANSFER, Description::decode_file_transfer)
            .with_transport(NS_IBB, Transport::decode_in_band)
            .with_transport(NS_S5B, Transport::decode_socket)
            .with_security(NS_JET, Security::decode_jet)
    }
}

impl CodecRegistry {
    /// Registry with no codecs at all
    pub fn empty() -> Self {
        Self {
            descriptions: HashMap::new(),
            transports: HashMap::new(),
            securities: HashMap::new(),
        }
    }

    /// Register a description decoder
    pub fn with_description(mut self, namespace: &str, decoder: Decoder<Description>) -> Self {
        self.descriptions.insert(namespace.to_string(), decoder);
        self
    }

    /// Register a transport decoder
    pub fn with_transport(mut self, namespace: &str, decoder: Decoder<Transport>) -> Self {
        self.transports.insert(namespace.to_string(), decoder);
        self
    }

    /// Register a security decoder
    pub fn with_security(mut self, namespace: &str, decoder: Decoder<Security>) -> Self {
        self.securities.insert(namespace.to_string(), decoder);
        self
    }

    /// Decode a description payload
    pub fn decode_description(&self, payload: &Payload) -> Result<Description> {
        lookup(&self.descriptions, payload)
    }

    /// Decode a transport payload
    pub fn decode_transport(&self, payload: &Payload) -> Result<Transport> {
        lookup(&self.transports, payload)
    }

    /// Decode a security payload
    pub fn decode_security(&self, payload: &Payload) -> Result<Security> {
        lookup(&self.securities, payload)
    }

    /// Whether a transport namespace has a decoder
    pub fn supports_transport(&self, namespace: &str) -> bool {
        self.transports.contains_key(namespace)
    }
}

fn lookup<T>(table: &HashMap<String, Decoder<T>>, payload: &Payload) -> Result<T> {
    let decoder = table
        .get(&payload.namespace)
        .ok_or_else(|| JingleError::UnsupportedNamespace(payload.namespace.clone()))?;
    decoder(payload)
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("descriptions", &self.descriptions.keys().collect::<Vec<_>>())
            .field("transports", &self.transports.keys().collect::<Vec<_>>())
            .field("securities", &self.securities.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roundtrip_every_registered_transport_and_security() {
        let registry = CodecRegistry::default();

        let transports = vec![
            Transport::InBand(InBandTransport::new("ibb-sid", 4096)),
            Transport::Socket(SocketTransport {
                sid: "s5b-sid".to_string(),
                dst_hash: Some("q8Gg6A1kSxmOQ8cphvGdMRNpSeyFk9MR3QCx2DzHe5E=".to_string()),
                candidates: vec![Candidate {
                    cid: "c1".to_string(),
                    host: "192.0.2.1".to_string(),
                    port: 5086,
                    priority: 8257636,
                    kind: CandidateKind::Direct,
                }],
            }),
        ];
        for transport in transports {
            let payload = transport.to_payload().unwrap();
            assert_eq!(payload.namespace, transport.namespace());
            assert_eq!(registry.decode_transport(&payload).unwrap(), transport);
        }

        let security = Security::Jet(JetSecurity {
            cipher: "urn:xmpp:ciphers:chacha20-poly1305".to_string(),
            key_transport: Payload::new("urn:xmpp:jingle:jet-psk:0", json!({"sealed": "AAAA"})),
        });
        let payload = security.to_payload().unwrap();
        assert_eq!(registry.decode_security(&payload).unwrap(), security);
    }

    #[test]
    fn test_unknown_namespace() {
        let registry = CodecRegistry::default();
        let payload = Payload::new("urn:example:carrier-pigeon", json!({}));
        assert!(matches!(
            registry.decode_transport(&payload),
            Err(JingleError::UnsupportedNamespace(_))
        ));
        assert!(!registry.supports_transport("urn:example:carrier-pigeon"));
    }

    #[test]
    fn test_malformed_body_is_protocol_violation() {
        let registry = CodecRegistry::default();
        let payload = Payload::new(NS_IBB, json!({"sid": 12}));
        assert!(matches!(
            registry.decode_transport(&payload),
            Err(JingleError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_empty_registry_supports_nothing() {
        let registry = CodecRegistry::empty();
        let payload = Transport::InBand(InBandTransport::new("x", 4096)).to_payload().unwrap();
        assert!(registry.decode_transport(&payload).is_err());
    }
}

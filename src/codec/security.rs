//! Security elements: encrypted-transport parameters for a content.

use serde::{Deserialize, Serialize};

use super::Payload;
use crate::crypto::CipherKind;
use crate::error::{JingleError, Result};
use crate::protocol::NS_JET;

/// Security variants, one per security namespace
#[derive(Debug, Clone, PartialEq)]
pub enum Security {
    /// Encrypted transport with a transported key
    Jet(JetSecurity),
}

impl Security {
    /// Namespace of this variant
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Jet(_) => NS_JET,
        }
    }

    /// Render to wire form
    pub fn to_payload(&self) -> Result<Payload> {
        match self {
            Self::Jet(jet) => Payload::encode(NS_JET, jet),
        }
    }

    /// Decoder registered for [`NS_JET`]
    pub fn decode_jet(payload: &Payload) -> Result<Self> {
        let jet: JetSecurity = payload.decode()?;
        if jet.key_transport.namespace.is_empty() {
            return Err(JingleError::ProtocolViolation(
                "security element without key transport".to_string(),
            ));
        }
        Ok(Self::Jet(jet))
    }

    /// The inner encrypted-transport element
    pub fn as_jet(&self) -> &JetSecurity {
        match self {
            Self::Jet(jet) => jet,
        }
    }
}

/// Encrypted-transport element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JetSecurity {
    /// Cipher namespace
    pub cipher: String,
    /// Transported `key || iv`, opaque to everything but its codec
    pub key_transport: Payload,
}

impl JetSecurity {
    /// Resolve the cipher namespace
    pub fn cipher_kind(&self) -> Result<CipherKind> {
        Ok(CipherKind::from_namespace(&self.cipher)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cipher_kind_resolution() {
        let jet = JetSecurity {
            cipher: CipherKind::Aes256Gcm.namespace().to_string(),
            key_transport: Payload::new("urn:example:kt", json!({})),
        };
        assert_eq!(jet.cipher_kind().unwrap(), CipherKind::Aes256Gcm);

        let unknown = JetSecurity {
            cipher: "urn:example:rot13".to_string(),
            ..jet
        };
        assert!(matches!(unknown.cipher_kind(), Err(JingleError::Crypto(_))));
    }

    #[test]
    fn test_missing_key_transport() {
        let payload = Payload::new(NS_JET, json!({"cipher": "urn:xmpp:ciphers:chacha20-poly1305"}));
        assert!(Security::decode_jet(&payload).is_err());
    }
}

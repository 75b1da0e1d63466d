//! Peer addresses.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{JingleError, Result};

/// A `local@domain/resource` address. Sessions run between full addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid(String);

impl Jid {
    /// Parse and validate an address
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() || s.len() > 3071 {
            return Err(JingleError::InvalidJid(format!("bad length: {}", s.len())));
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(JingleError::InvalidJid(s.to_string()));
        }

        let bare = s.split('/').next().unwrap_or_default();
        let domain = bare.rsplit('@').next().unwrap_or_default();
        if domain.is_empty() || bare.matches('@').count() > 1 || bare.starts_with('@') {
            return Err(JingleError::InvalidJid(s.to_string()));
        }
        if s.ends_with('/') {
            return Err(JingleError::InvalidJid(s.to_string()));
        }

        Ok(Self(s.to_string()))
    }

    /// The address without its resource
    pub fn bare(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// The resource part, if any
    pub fn resource(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, r)| r)
    }

    /// Whether this is a full (resource-bearing) address
    pub fn is_full(&self) -> bool {
        self.resource().is_some()
    }

    /// Get the address as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Jid {
    type Err = JingleError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Jid {
    type Error = JingleError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let jid = Jid::parse("romeo@montague.lit/orchard").unwrap();
        assert_eq!(jid.bare(), "romeo@montague.lit");
        assert_eq!(jid.resource(), Some("orchard"));
        assert!(jid.is_full());
    }

    #[test]
    fn test_resource_may_contain_slash() {
        let jid = Jid::parse("romeo@montague.lit/a/b").unwrap();
        assert_eq!(jid.resource(), Some("a/b"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Jid::parse("").is_err());
        assert!(Jid::parse("romeo @montague.lit").is_err());
        assert!(Jid::parse("@montague.lit").is_err());
        assert!(Jid::parse("a@b@c").is_err());
        assert!(Jid::parse("romeo@montague.lit/").is_err());
    }

    #[test]
    fn test_serde_validates() {
        let ok: Jid = serde_json::from_str("\"juliet@capulet.lit/balcony\"").unwrap();
        assert_eq!(ok.as_str(), "juliet@capulet.lit/balcony");
        assert!(serde_json::from_str::<Jid>("\"bad jid\"").is_err());
    }
}

//! Transport descriptors: how a content's bytes travel.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::Payload;
use crate::error::{JingleError, Result};
use crate::protocol::{NS_IBB, NS_S5B};

/// Largest candidate list accepted from a peer
pub const MAX_CANDIDATES: usize = 64;

/// Transport variants, one per transport namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// In-band relay over the signaling connection
    InBand(InBandTransport),
    /// Direct/proxied TCP candidates
    Socket(SocketTransport),
}

impl Transport {
    /// Namespace of this variant
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::InBand(_) => NS_IBB,
            Self::Socket(_) => NS_S5B,
        }
    }

    /// Stream id carried by the descriptor
    pub fn sid(&self) -> &str {
        match self {
            Self::InBand(t) => &t.sid,
            Self::Socket(t) => &t.sid,
        }
    }

    /// Render to wire form
    pub fn to_payload(&self) -> Result<Payload> {
        match self {
            Self::InBand(t) => Payload::encode(NS_IBB, t),
            Self::Socket(t) => Payload::encode(NS_S5B, t),
        }
    }

    /// Decoder registered for [`NS_IBB`]
    pub fn decode_in_band(payload: &Payload) -> Result<Self> {
        let t: InBandTransport = payload.decode()?;
        if t.sid.is_empty() {
            return Err(JingleError::ProtocolViolation("in-band transport without sid".to_string()));
        }
        if t.block_size == 0 {
            return Err(JingleError::ProtocolViolation("in-band block-size is zero".to_string()));
        }
        Ok(Self::InBand(t))
    }

    /// Decoder registered for [`NS_S5B`]
    pub fn decode_socket(payload: &Payload) -> Result<Self> {
        let t: SocketTransport = payload.decode()?;
        if t.sid.is_empty() {
            return Err(JingleError::ProtocolViolation("socket transport without sid".to_string()));
        }
        if t.candidates.len() > MAX_CANDIDATES {
            return Err(JingleError::ProtocolViolation(format!(
                "too many candidates: {}",
                t.candidates.len()
            )));
        }
        for candidate in &t.candidates {
            if candidate.host.is_empty() || candidate.port == 0 || candidate.cid.is_empty() {
                return Err(JingleError::ProtocolViolation(format!(
                    "invalid candidate {:?}",
                    candidate.cid
                )));
            }
        }
        Ok(Self::Socket(t))
    }
}

/// In-band relay descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InBandTransport {
    /// Stream id addressing data packets
    pub sid: String,
    /// Largest chunk, in bytes, before base64
    pub block_size: u16,
}

impl InBandTransport {
    /// Create a descriptor
    pub fn new(sid: &str, block_size: u16) -> Self {
        Self {
            sid: sid.to_string(),
            block_size,
        }
    }
}

/// Candidate socket descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketTransport {
    /// Stream id
    pub sid: String,
    /// Base64 handshake digest, for display only; both sides recompute it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_hash: Option<String>,
    /// Offered candidates, in declaration order
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

impl SocketTransport {
    /// Candidates in the order they should be dialed: descending priority,
    /// ties kept in declaration order.
    pub fn candidates_by_priority(&self) -> Vec<&Candidate> {
        let mut ordered: Vec<&Candidate> = self.candidates.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
        ordered
    }
}

/// Candidate classes, from most to least preferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    /// Host address
    Direct,
    /// NAT-assisted address
    Assisted,
    /// Tunnel endpoint
    Tunnel,
    /// Mediated proxy
    Proxy,
}

impl CandidateKind {
    /// Type preference used in the priority formula
    pub fn type_preference(&self) -> u32 {
        match self {
            Self::Direct => 126,
            Self::Assisted => 120,
            Self::Tunnel => 110,
            Self::Proxy => 10,
        }
    }
}

/// One connection candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Candidate id, unique within the descriptor
    pub cid: String,
    /// Host name or IP literal
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Higher is tried first
    pub priority: u32,
    /// Candidate class
    #[serde(rename = "type")]
    pub kind: CandidateKind,
}

impl Candidate {
    /// `type_preference << 16 | local_preference`
    pub fn compute_priority(kind: CandidateKind, local_preference: u16) -> u32 {
        (kind.type_preference() << 16) | u32::from(local_preference)
    }

    /// Build a candidate for a local address
    pub fn for_addr(cid: String, addr: SocketAddr, kind: CandidateKind, local_preference: u16) -> Self {
        Self {
            cid,
            host: addr.ip().to_string(),
            port: addr.port(),
            priority: Self::compute_priority(kind, local_preference),
            kind,
        }
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn candidate(cid: &str, priority: u32) -> Candidate {
        Candidate {
            cid: cid.to_string(),
            host: "192.0.2.7".to_string(),
            port: 1080,
            priority,
            kind: CandidateKind::Direct,
        }
    }

    #[test]
    fn test_candidate_order() {
        let t = SocketTransport {
            sid: "s".to_string(),
            dst_hash: None,
            candidates: vec![candidate("a", 8257636), candidate("b", 8258636), candidate("c", 7878787)],
        };
        let order: Vec<&str> = t.candidates_by_priority().iter().map(|c| c.cid.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_priority_ties_keep_declaration_order() {
        let t = SocketTransport {
            sid: "s".to_string(),
            dst_hash: None,
            candidates: vec![candidate("x", 5), candidate("y", 9), candidate("z", 5)],
        };
        let order: Vec<&str> = t.candidates_by_priority().iter().map(|c| c.cid.as_str()).collect();
        assert_eq!(order, vec!["y", "x", "z"]);
    }

    #[test]
    fn test_priority_formula() {
        assert_eq!(Candidate::compute_priority(CandidateKind::Direct, 0), 126 << 16);
        assert_eq!(Candidate::compute_priority(CandidateKind::Proxy, 7), (10 << 16) | 7);
        assert!(
            Candidate::compute_priority(CandidateKind::Tunnel, u16::MAX)
                < Candidate::compute_priority(CandidateKind::Assisted, 0)
        );
    }

    #[test]
    fn test_candidate_kind_wire_name() {
        let c = candidate("a", 1);
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "direct");
    }

    #[test]
    fn test_ipv6_address() {
        let mut c = candidate("a", 1);
        c.host = "::1".to_string();
        assert_eq!(c.address(), "[::1]:1080");
    }

    #[test]
    fn test_rejects_bad_descriptors() {
        let zero_block = Payload::new(NS_IBB, json!({"sid": "a", "block_size": 0}));
        assert!(Transport::decode_in_band(&zero_block).is_err());

        let bad_port = Payload::new(
            NS_S5B,
            json!({"sid": "a", "candidates": [{"cid": "c", "host": "h", "port": 0, "priority": 1, "type": "direct"}]}),
        );
        assert!(Transport::decode_socket(&bad_port).is_err());

        let many: Vec<_> = (0..=MAX_CANDIDATES)
            .map(|i| json!({"cid": format!("c{i}"), "host": "h", "port": 1, "priority": 1, "type": "direct"}))
            .collect();
        let flood = Payload::new(NS_S5B, json!({"sid": "a", "candidates": many}));
        assert!(Transport::decode_socket(&flood).is_err());
    }

    proptest! {
        #[test]
        fn prop_dial_order_is_non_increasing(priorities in proptest::collection::vec(any::<u32>(), 0..20)) {
            let t = SocketTransport {
                sid: "s".to_string(),
                dst_hash: None,
                candidates: priorities.iter().enumerate().map(|(i, p)| candidate(&i.to_string(), *p)).collect(),
            };
            let ordered = t.candidates_by_priority();
            prop_assert_eq!(ordered.len(), priorities.len());
            for pair in ordered.windows(2) {
                prop_assert!(pair[0].priority >= pair[1].priority);
            }
        }
    }
}

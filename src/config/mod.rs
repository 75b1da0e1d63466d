//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`JINGLE_*`)
//!
//! Every section has defaults, so an empty file is a valid configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{CipherKind, NS_JET_PSK};
use crate::error::{JingleError, Result};
use crate::protocol::{DEFAULT_PENDING_TIMEOUT, DEFAULT_TOMBSTONE_CAPACITY, NS_IBB, NS_S5B};
use crate::transport::{DEFAULT_BLOCK_SIZE, DEFAULT_MAX_BLOCK_SIZE};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Negotiation policy
    #[serde(default)]
    pub negotiation: NegotiationConfig,

    /// In-band relay transport
    #[serde(default)]
    pub in_band: InBandConfig,

    /// Candidate socket transport
    #[serde(default)]
    pub socket: SocketConfig,

    /// Encrypted transports
    #[serde(default)]
    pub security: SecurityConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| JingleError::Config(format!("Failed to read config file {}: {e}", path.display())))?;

        let config: Self =
            toml::from_str(&content).map_err(|e| JingleError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Default file location (`<config dir>/jingle/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("jingle").join("config.toml"))
    }

    /// The default file if it exists, then environment overrides
    pub fn load() -> Result<Self> {
        let base = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        let config = base.with_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `JINGLE_*` environment overrides on top of this config
    pub fn with_env(mut self) -> Self {
        if let Some(ms) = env_parse("JINGLE_PENDING_TIMEOUT_MS") {
            self.negotiation.pending_timeout_ms = ms;
        }
        if let Ok(list) = std::env::var("JINGLE_TRANSPORTS") {
            self.negotiation.transports = split_list(&list);
        }
        if let Some(auto) = env_parse("JINGLE_AUTO_ACCEPT_CONTENT_ADD") {
            self.negotiation.auto_accept_content_add = auto;
        }

        if let Some(size) = env_parse("JINGLE_IBB_BLOCK_SIZE") {
            self.in_band.block_size = size;
        }

        if let Some(bind) = env_parse("JINGLE_SOCKET_BIND") {
            self.socket.bind = bind;
        }
        if let Ok(list) = std::env::var("JINGLE_SOCKET_ADVERTISE") {
            self.socket.advertise = split_list(&list).iter().filter_map(|a| a.parse().ok()).collect();
        }
        if let Ok(list) = std::env::var("JINGLE_SOCKET_PROXIES") {
            self.socket.proxies = split_list(&list).iter().filter_map(|a| a.parse().ok()).collect();
        }

        if let Ok(cipher) = std::env::var("JINGLE_CIPHER") {
            self.security.cipher = cipher;
        }

        self
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.negotiation.transports.is_empty() {
            return Err(JingleError::Config("at least one transport must be enabled".to_string()));
        }
        for ns in &self.negotiation.transports {
            if ns != NS_IBB && ns != NS_S5B {
                return Err(JingleError::Config(format!("unknown transport {ns}")));
            }
        }
        if self.in_band.block_size == 0 || self.in_band.block_size > self.in_band.max_block_size {
            return Err(JingleError::Config(format!(
                "in-band block size {} must be within 1..={}",
                self.in_band.block_size, self.in_band.max_block_size
            )));
        }
        self.security.cipher_kind()?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Negotiation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// How long transport-replace and content-add wait for an answer
    pub pending_timeout_ms: u64,

    /// Enabled transport namespaces, most preferred first
    pub transports: Vec<String>,

    /// Accept inbound content-add without asking the application
    pub auto_accept_content_add: bool,

    /// How many terminated sids are remembered
    pub tombstone_capacity: usize,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            pending_timeout_ms: DEFAULT_PENDING_TIMEOUT.as_millis() as u64,
            transports: vec![NS_S5B.to_string(), NS_IBB.to_string()],
            auto_accept_content_add: true,
            tombstone_capacity: DEFAULT_TOMBSTONE_CAPACITY,
        }
    }
}

impl NegotiationConfig {
    /// Pending-action timeout
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }
}

/// In-band relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InBandConfig {
    /// Block size we offer
    pub block_size: u16,

    /// Largest block we accept from a peer
    pub max_block_size: u16,
}

impl Default for InBandConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
        }
    }
}

/// Candidate socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Listener address; port 0 picks a free port
    pub bind: SocketAddr,

    /// Addresses to advertise instead of the bound one (NAT, port mapping)
    pub advertise: Vec<SocketAddr>,

    /// SOCKS5 mediators to advertise as proxy candidates
    pub proxies: Vec<SocketAddr>,

    /// Bound on each candidate dial
    pub connect_timeout_ms: u64,

    /// How long the listening side waits for the peer
    pub accept_timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            advertise: Vec::new(),
            proxies: Vec::new(),
            connect_timeout_ms: 3_000,
            accept_timeout_ms: 10_000,
        }
    }
}

impl SocketConfig {
    /// Dial timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Listen timeout
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }
}

/// Encrypted transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Cipher for contents we encrypt: a namespace or a short name
    /// (`chacha20-poly1305`, `aes-256-gcm`)
    pub cipher: String,

    /// Key-transport namespace used when the application does not pick one
    pub key_transport: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            cipher: CipherKind::default().namespace().to_string(),
            key_transport: NS_JET_PSK.to_string(),
        }
    }
}

impl SecurityConfig {
    /// Resolve the configured cipher
    pub fn cipher_kind(&self) -> Result<CipherKind> {
        self.cipher.parse::<CipherKind>().map_err(|e| JingleError::Config(e.to_string()))
    }
}

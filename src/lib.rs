//! # Jingle - Peer-to-Peer Session Negotiation
//!
//! Negotiation engine for peer-to-peer data sessions (file transfer,
//! arbitrary byte streams) between two endpoints of a federated messaging
//! network. A session carries one or more *contents*; each content pairs an
//! application description with a transport and, optionally, an encrypted
//! transport layer.
//!
//! ## Features
//!
//! - **Iterative renegotiation**: transport replacement, content add/remove
//! - **Automatic fallback**: a failed transport is blacklisted and the next
//!   registered one is proposed, without restarting the session
//! - **Two transports**: in-band relay over the signaling connection, and
//!   candidate-based TCP sockets (direct or through a SOCKS5 mediator)
//! - **Encrypted transports**: ChaCha20-Poly1305 / AES-256-GCM framing with
//!   pre-shared-key key transport
//! - **Concurrency-safe**: per-session locks, abortable establishment tasks,
//!   stale completions dropped by attempt id
//!
//! ## Protocol Overview
//!
//! ```text
//! Initiator                                        Responder
//!    |                                                 |
//!    |------ session-initiate (contents) ------------->|
//!    |<----- session-accept ---------------------------|
//!    |                                                 |
//!    |====== transport establishment (per content) ====|
//!    |                                                 |
//!    |------ transport-replace (after a failure) ----->|
//!    |<----- transport-accept -------------------------|
//!    |                                                 |
//!    |------ session-terminate ----------------------->|
//! ```
//!
//! ### State Machine
//!
//! ```text
//!                session-accept
//!     [Pending] ─────────────────> [Active]
//!         │                           │
//!         │ session-terminate /       │ session-terminate /
//!         │ unrecoverable failure     │ last content gone
//!         v                           v
//!     [Terminated] <──────────────────┘      (terminal)
//! ```
//!
//! ### Actions
//!
//! | Action            | Effect                                              |
//! |-------------------|-----------------------------------------------------|
//! | session-initiate  | create a pending session with its contents          |
//! | session-accept    | session active, transports start establishing       |
//! | session-terminate | session ends, in-flight establishment cancelled     |
//! | content-add       | new content in an active session                    |
//! | content-accept    | added content starts establishing                   |
//! | content-reject    | added content dropped                               |
//! | content-remove    | content dropped                                     |
//! | transport-replace | propose another transport for a content             |
//! | transport-accept  | replacement final, establishment restarts           |
//! | transport-reject  | replacement refused, namespace blacklisted          |
//! | transport-info    | informational, no state change                      |
//! | security-info     | key exchange continuation for a pending session     |
//! | description-info  | application-level notice                            |
//! | session-info      | ping                                                |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use jingle::{Config, ContentOffer, EventSink, Keyring, SessionRegistry};
//! use jingle::codec::{Description, FileInfo, FileTransfer};
//!
//! let (out_tx, out_rx) = tokio::sync::mpsc::unbounded_channel();
//! let (events, mut event_rx) = EventSink::channel();
//! let registry = SessionRegistry::from_config(
//!     "romeo@montague.lit/orchard".parse()?,
//!     &Config::load()?,
//!     Keyring::new(),
//!     Arc::new(out_tx),
//!     Arc::new(events),
//! )?;
//!
//! // Inbound stanzas from the connection
//! tokio::spawn({
//!     let registry = registry.clone();
//!     async move { registry.run(in_rx).await }
//! });
//!
//! let offer = ContentOffer::new(Description::FileTransfer(FileTransfer::offer(
//!     FileInfo::new("balcony.jpg", 31_337),
//! )));
//! let sid = registry
//!     .create_outbound_session("juliet@capulet.lit/balcony".parse()?, vec![offer])
//!     .await?;
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: Session registry, effect execution, application callbacks
//! - [`protocol`]: Messages, session/content state machine, pending actions
//! - [`codec`]: Description / Transport / Security payloads and decoders
//! - [`transport`]: Channel providers (in-band relay, candidate sockets)
//! - [`crypto`]: Cipher units, key transport, encrypted channels
//! - [`config`]: Configuration management
//! - [`jid`]: Peer addresses
//! - [`error`]: Error types and result aliases

pub mod codec;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod jid;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use codec::{CodecRegistry, Description, Payload, Security, Transport};
pub use config::Config;
pub use crypto::{CipherKind, CipherUnit, Keyring, SecureChannel};
pub use engine::{EventSink, IncomingSession, SessionEvent, SessionListener, SessionRegistry};
pub use error::{JingleError, Result};
pub use jid::Jid;
pub use protocol::{
    ContentOffer, JingleMessage, NegotiationContext, Reason, ReasonCondition, Role, Senders, Session,
    SessionSnapshot, SessionState, Stanza, StanzaSink,
};
pub use transport::{ChannelProvider, ContentChannel, InBandProvider, ProviderRegistry, SocketProvider};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

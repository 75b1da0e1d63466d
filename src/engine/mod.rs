//! Negotiation engine: one [`SessionRegistry`] per connection.
//!
//! The registry owns every [`Session`](crate::protocol::Session) of a
//! connection and carries out the effects the state machines return:
//!
//! ```text
//! inbound stanza ──► SessionRegistry ──► Session::apply ──► Vec<Effect>
//!                          │                                    │
//!                          │◄───────────── execute ◄────────────┘
//!                          │
//!          ┌───────────────┼──────────────────┬──────────────────┐
//!          ▼               ▼                  ▼                  ▼
//!     StanzaSink    ChannelProvider::open   timers      SessionListener
//!     (outbound)    (spawned, abortable)  (pending)     (application)
//! ```
//!
//! Each session sits behind its own `tokio::sync::Mutex`; establishment
//! and timers run on spawned tasks and re-enter through the same lock, so a
//! completion that raced a replacement is recognized by its attempt id and
//! dropped.

mod listener;
mod registry;

pub use listener::{EventSink, IncomingSession, NullListener, OfferedContent, SessionEvent, SessionListener};
pub use registry::SessionRegistry;

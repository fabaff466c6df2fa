//! Connections and sessions for Loomwire.
//!
//! This crate turns a byte stream into a session:
//!
//! 1. **Connection** ([`Connection`]): the outgoing queue, the framed
//!    reader, the session context handed to message handlers, lifecycle
//!    listeners, and deferred actions
//! 2. **Personality** ([`Personality`]): whether the application or
//!    background tasks drive I/O
//! 3. **Access control** ([`AccessControl`]): the application's say in
//!    who gets in during the handshake
//! 4. **Liveness** ([`PingStatus`]): optional ping probing
//!
//! # How it fits in the stack
//!
//! ```text
//! Router / facade (above)  ← group delivery, handshake, servers and clients
//!     ↕
//! Session layer (this crate)
//!     ↕
//! Protocol (below)         ← frames, registry, system messages
//!     ↕
//! Transport (below)        ← byte streams
//! ```

#![allow(async_fn_in_trait)]

mod access;
mod connection;
mod error;
mod personality;
mod ping;

pub use access::{AcceptAll, AccessControl, AccessDecision, split_key};
pub use connection::{Connection, ConnectionListener, WeakConnection};
pub use error::SessionError;
pub use personality::{AsyncSettings, Personality, PersonalityState, SyncSettings};
pub use ping::{DEFAULT_PING_PERIOD, PingStatus};

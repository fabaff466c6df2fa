//! # Loomwire
//!
//! Message-oriented networking substrate for multi-user servers.
//!
//! Loomwire carries typed binary messages over byte streams. Applications
//! register message packages with handlers, decide who may connect, and
//! pick per connection whether background tasks or their own tick loop
//! drive I/O. This crate ties the layers together:
//!
//! - [`NetServerBuilder`] / [`NetServer`] / [`ServerHandle`]: accept loop,
//!   connection limit, server lock, handshake
//! - [`NetClient`]: connect with timeout and cancellation
//! - [`SyncPump`]: tick-driven driver for synchronous connections
//! - [`redirect`]: moving a client to another server
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use loomwire::prelude::*;
//!
//! # async fn run() -> Result<(), LoomwireError> {
//! let server = NetServerBuilder::<()>::new()
//!     .bind("127.0.0.1:4000")
//!     .build_tcp(AcceptAll)
//!     .await?;
//! server.run().await
//! # }
//! ```

#![allow(async_fn_in_trait)]

mod client;
mod config;
mod error;
mod handshake;
mod pump;
pub mod redirect;
mod server;
pub mod telemetry;

pub use client::NetClient;
pub use config::{ClientConfig, PROTOCOL_VERSION, ServerConfig};
pub use error::{ConfigError, ConnectError, LoomwireError};
pub use pump::SyncPump;
pub use server::{NetServer, NetServerBuilder, ServerHandle};

pub use loomwire_protocol as protocol;
pub use loomwire_router as router;
pub use loomwire_session as session;
pub use loomwire_tick as tick;
pub use loomwire_transport as transport;

pub use loomwire_session::AcceptAll;

pub mod prelude {
    pub use crate::redirect::{RedirectConnection, RedirectFailed, RedirectListener, redirect_package};
    pub use crate::{
        ClientConfig, ConnectError, LoomwireError, NetClient, NetServer, NetServerBuilder,
        ServerConfig, ServerHandle, SyncPump,
    };
    pub use loomwire_protocol::{
        Deferred, Dispatch, ErrorCode, Handle, HandlerError, Location, Message, MessagePackage,
        MessageRegistry, ProtocolError, WireReader, WireWriter,
    };
    pub use loomwire_router::{GroupRouter, MessageRouter, Recipient, Scope};
    pub use loomwire_session::{
        AcceptAll, AccessControl, AccessDecision, Connection, ConnectionListener, Personality,
        split_key,
    };
    pub use loomwire_tick::TickConfig;
    pub use loomwire_transport::{MemoryNetwork, TcpConnector};
}

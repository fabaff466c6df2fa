//! Byte-stream transports for Loomwire.
//!
//! The layers above this crate speak a message protocol, but all they need
//! from the network is an ordered, reliable duplex byte stream. This crate
//! provides:
//!
//! - [`Transport`]: accepts incoming streams (the server side)
//! - [`Connector`]: opens outgoing streams to an endpoint (the client side)
//! - [`TcpTransport`] / [`TcpConnector`]: real sockets
//! - [`MemoryNetwork`]: in-process pipes for single-process deployments
//!   and tests
//!
//! Every stream is handed out as a [`BoxStream`], so the connection layer
//! never needs to know which transport produced it.

mod error;
mod memory;
mod tcp;

pub use error::TransportError;
pub use memory::{MemoryConnector, MemoryNetwork, MemoryTransport};
pub use tcp::{TcpConnector, TcpTransport};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};

/// Counter for generating unique connection IDs across all transports.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates a fresh, process-unique ID.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An ordered, reliable duplex byte stream.
///
/// Blanket-implemented for anything that is `AsyncRead + AsyncWrite`, so
/// `TcpStream`, `DuplexStream` and test doubles all qualify.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A type-erased [`ByteStream`].
pub type BoxStream = Box<dyn ByteStream>;

/// A freshly accepted stream plus what we know about the peer.
pub struct Accepted {
    /// ID assigned to the connection that will wrap this stream.
    pub id: ConnectionId,
    /// Human-readable peer description (socket address or memory endpoint).
    pub peer: String,
    /// The stream itself.
    pub stream: BoxStream,
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Accepts new incoming streams.
pub trait Transport: Send + 'static {
    /// Waits for and accepts the next incoming stream.
    ///
    /// Returns [`TransportError::Shutdown`] once the transport can no
    /// longer produce streams.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<Accepted, TransportError>> + Send;

    /// Describes where this transport is listening (e.g. `127.0.0.1:4000`).
    fn local_endpoint(&self) -> String;
}

/// Opens outgoing streams.
pub trait Connector: Send + Sync + 'static {
    /// Opens a stream to `endpoint`.
    ///
    /// The endpoint format is transport specific: `host:port` for TCP, a
    /// registered name for the in-memory network.
    fn connect(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<BoxStream, TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_new_and_into_inner() {
        let id = ConnectionId::new(42);
        assert_eq!(id.into_inner(), 42);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new(7);
        assert_eq!(id.to_string(), "conn-7");
    }

    #[test]
    fn test_connection_id_next_is_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_connection_id_hash_works_as_map_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(ConnectionId::new(1), "alice");
        map.insert(ConnectionId::new(2), "bob");
        assert_eq!(map[&ConnectionId::new(1)], "alice");
    }

    #[test]
    fn test_box_stream_accepts_duplex() {
        let (a, _b) = tokio::io::duplex(64);
        let boxed: BoxStream = Box::new(a);
        drop(boxed);
    }
}

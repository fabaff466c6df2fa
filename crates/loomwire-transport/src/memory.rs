//! In-process transport over `tokio::io::duplex` pipes.
//!
//! A [`MemoryNetwork`] is a tiny name service: servers bind a name, clients
//! connect to that name and get one end of a fresh duplex pipe while the
//! listener receives the other. Nothing leaves the process, which makes
//! this the transport of choice for standalone deployments and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::{Accepted, BoxStream, ConnectionId, Connector, Transport, TransportError};

/// Per-pipe buffer size in bytes.
const PIPE_CAPACITY: usize = 64 * 1024;

/// How many unaccepted streams a listener queues before connects wait.
const BACKLOG: usize = 64;

type Backlog = mpsc::Sender<(DuplexStream, String)>;

#[derive(Default)]
struct Registry {
    listeners: Mutex<HashMap<String, Backlog>>,
    next_client: AtomicU64,
}

/// A namespace of in-memory endpoints.
///
/// Cloning is cheap; all clones share the same namespace.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<Registry>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener under `name`.
    ///
    /// A name whose previous listener was dropped can be bound again.
    pub fn bind(&self, name: &str) -> Result<MemoryTransport, TransportError> {
        let mut listeners = self
            .registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = listeners.get(name) {
            if !existing.is_closed() {
                return Err(TransportError::EndpointInUse(name.to_string()));
            }
        }

        let (tx, rx) = mpsc::channel(BACKLOG);
        listeners.insert(name.to_string(), tx);
        tracing::info!(endpoint = name, "memory transport listening");

        Ok(MemoryTransport {
            name: name.to_string(),
            incoming: rx,
        })
    }

    /// Returns a connector that dials endpoints on this network.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
        }
    }

    fn backlog(&self, name: &str) -> Option<Backlog> {
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

/// The accepting side of a [`MemoryNetwork`] endpoint.
pub struct MemoryTransport {
    name: String,
    incoming: mpsc::Receiver<(DuplexStream, String)>,
}

impl Transport for MemoryTransport {
    async fn accept(&mut self) -> Result<Accepted, TransportError> {
        let (stream, peer) = self
            .incoming
            .recv()
            .await
            .ok_or(TransportError::Shutdown)?;

        let id = ConnectionId::next();
        tracing::debug!(%id, %peer, endpoint = %self.name, "accepted memory connection");

        Ok(Accepted {
            id,
            peer,
            stream: Box::new(stream),
        })
    }

    fn local_endpoint(&self) -> String {
        self.name.clone()
    }
}

/// The dialing side of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
}

impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<BoxStream, TransportError> {
        let backlog = self
            .network
            .backlog(endpoint)
            .ok_or_else(|| TransportError::UnknownEndpoint(endpoint.to_string()))?;

        let (client_end, server_end) = tokio::io::duplex(PIPE_CAPACITY);
        let n = self
            .network
            .registry
            .next_client
            .fetch_add(1, Ordering::Relaxed);
        let peer = format!("mem-client-{n}");

        backlog
            .send((server_end, peer))
            .await
            .map_err(|_| TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "listener dropped",
                ),
            })?;

        Ok(Box::new(client_end))
    }
}

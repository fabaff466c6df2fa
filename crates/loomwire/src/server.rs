//! `NetServer` builder, accept loop, and the handle used to operate it.
//!
//! This is the entry point for running a Loomwire server. It ties the
//! layers together: transport → connection → handshake → personality.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use loomwire_protocol::{ErrorCode, Frame, MessagePackage, MessageRegistry, Outbound, ProtocolError};
use loomwire_session::{AccessControl, Connection, ConnectionListener, Personality};
use loomwire_transport::{Accepted, ConnectionId, TcpTransport, Transport, TransportError};
use tokio_util::sync::CancellationToken;

use crate::handshake::{accept_handshake, refuse};
use crate::{ConnectError, LoomwireError, ServerConfig};

/// Upper bound on waiting for the registration of a client that is about
/// to be refused, so the refusal is read rather than reset.
const REFUSAL_LINGER: Duration = Duration::from_millis(500);

/// State shared by the accept loop, handshake tasks, and handles.
struct Shared<C> {
    config: ServerConfig,
    endpoint: String,
    registry: RwLock<Arc<MessageRegistry<C>>>,
    connections: Mutex<HashMap<ConnectionId, Connection<C>>>,
    locked: AtomicBool,
    shutdown: CancellationToken,
}

impl<C> Shared<C> {
    fn table(&self) -> MutexGuard<'_, HashMap<ConnectionId, Connection<C>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> Arc<MessageRegistry<C>> {
        Arc::clone(&self.registry.read().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Removes a connection from the server table when it closes.
struct TableCleanup<C> {
    shared: Weak<Shared<C>>,
}

impl<C: Send + Sync + 'static> ConnectionListener<C> for TableCleanup<C> {
    fn connection_closed(&self, conn: &Connection<C>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.table().remove(&conn.id());
        }
    }
}

/// Builder for configuring and starting a server.
///
/// # Example
///
/// ```rust,ignore
/// use loomwire::prelude::*;
///
/// let server = NetServerBuilder::<Player>::new()
///     .bind("0.0.0.0:4000")
///     .package(&GAME_MESSAGES)
///     .build_tcp(MyAccess)
///     .await?;
/// let handle = server.handle();
/// server.run().await
/// ```
pub struct NetServerBuilder<C> {
    config: ServerConfig,
    packages: Vec<MessagePackage<C>>,
}

impl<C: Send + Sync + 'static> NetServerBuilder<C> {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            packages: Vec::new(),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_address = addr.to_string();
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn protocol_version(mut self, version: u32) -> Self {
        self.config.protocol_version = version;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn personality(mut self, personality: Personality) -> Self {
        self.config.personality = personality;
        self
    }

    /// Registers a message package for every connection.
    pub fn package(mut self, package: &MessagePackage<C>) -> Self {
        self.packages.push(package.clone());
        self
    }

    /// Binds a TCP listener on the configured address.
    pub async fn build_tcp<A: AccessControl<C>>(
        self,
        access: A,
    ) -> Result<NetServer<TcpTransport, A, C>, LoomwireError> {
        let transport = TcpTransport::bind(&self.config.bind_address).await?;
        self.build_with(transport, access)
    }

    /// Uses an existing transport (in-memory, or a pre-bound listener).
    pub fn build_with<T: Transport, A: AccessControl<C>>(
        self,
        transport: T,
        access: A,
    ) -> Result<NetServer<T, A, C>, LoomwireError> {
        let mut registry = MessageRegistry::new();
        for package in &self.packages {
            registry.add_package(package)?;
        }

        let shared = Arc::new(Shared {
            config: self.config.validated(),
            endpoint: transport.local_endpoint(),
            registry: RwLock::new(Arc::new(registry)),
            connections: Mutex::new(HashMap::new()),
            locked: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        Ok(NetServer {
            transport,
            access: Arc::new(access),
            shared,
        })
    }
}

impl<C: Send + Sync + 'static> Default for NetServerBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// A server ready to accept connections.
///
/// Call [`run()`](Self::run) to start the accept loop; use a
/// [`ServerHandle`] taken beforehand to operate it while it runs.
pub struct NetServer<T, A, C> {
    transport: T,
    access: Arc<A>,
    shared: Arc<Shared<C>>,
}

impl<T, A, C> NetServer<T, A, C>
where
    T: Transport,
    A: AccessControl<C>,
    C: Send + Sync + 'static,
{
    pub fn handle(&self) -> ServerHandle<C> {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Where the transport listens.
    pub fn local_endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Runs the accept loop until [`ServerHandle::stop`] is called or the
    /// transport shuts down. Open connections are closed on the way out.
    pub async fn run(mut self) -> Result<(), LoomwireError> {
        tracing::info!(endpoint = %self.shared.endpoint, "server listening");
        let shutdown = self.shared.shutdown.clone();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.transport.accept() => accepted,
            };
            match accepted {
                Ok(accepted) => self.admit(accepted),
                Err(TransportError::Shutdown) => break,
                Err(e) => tracing::error!(error = %e, "accept failed"),
            }
        }

        self.handle().close_all();
        tracing::info!(endpoint = %self.shared.endpoint, "server stopped");
        Ok(())
    }

    fn admit(&self, accepted: Accepted) {
        let Accepted { id, peer, stream } = accepted;
        let conn = Connection::new(id, peer, stream, self.shared.registry());
        tracing::info!(conn_id = %id, peer = %conn.peer(), "connection accepted");

        // Check and insert under one lock so concurrent accepts can't
        // overshoot the limit.
        let refusal = {
            let mut table = self.shared.table();
            if self.shared.locked.load(Ordering::Acquire) {
                Some(ConnectError::new(ErrorCode::AccessLocked, "server is locked"))
            } else if table.len() >= self.shared.config.max_connections {
                Some(ConnectError::new(
                    ErrorCode::MaxConnReached,
                    "too many connections",
                ))
            } else {
                table.insert(id, conn.clone());
                None
            }
        };

        if let Some(err) = refusal {
            tracing::warn!(conn_id = %id, code = ?err.code, "connection refused");
            let linger = REFUSAL_LINGER.min(self.shared.config.handshake_timeout());
            tokio::spawn(async move {
                // Read the registration first so closing doesn't reset
                // the stream before the refusal is read.
                let _ = conn.next_system_message(linger).await;
                refuse(&conn, err).await;
            });
            return;
        }

        conn.add_listener(Arc::new(TableCleanup {
            shared: Arc::downgrade(&self.shared),
        }));

        let access = Arc::clone(&self.access);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let config = &shared.config;
            match accept_handshake(
                &conn,
                access.as_ref(),
                config.protocol_version,
                config.handshake_timeout(),
            )
            .await
            {
                Ok(()) => {
                    if let Err(e) = conn.activate(config.personality) {
                        tracing::debug!(conn_id = %conn.id(), error = %e, "activation failed");
                        return;
                    }
                    tracing::info!(conn_id = %conn.id(), "handshake accepted");
                }
                Err(e) => {
                    tracing::warn!(conn_id = %conn.id(), code = ?e.code, reason = %e.message, "handshake refused");
                }
            }
        });
    }
}

/// Cloneable control surface of a running server.
pub struct ServerHandle<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for ServerHandle<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Send + Sync + 'static> ServerHandle<C> {
    /// Stops the accept loop. `run` returns after closing what is open.
    pub fn stop(&self) {
        self.shared.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// While locked, new connections are refused with `AccessLocked`.
    pub fn set_locked(&self, locked: bool) {
        self.shared.locked.store(locked, Ordering::Release);
        tracing::info!(locked, "server lock changed");
    }

    pub fn is_locked(&self) -> bool {
        self.shared.locked.load(Ordering::Acquire)
    }

    /// Open connections, handshakes in progress included.
    pub fn connection_count(&self) -> usize {
        self.shared.table().len()
    }

    pub fn connections(&self) -> Vec<Connection<C>> {
        self.shared.table().values().cloned().collect()
    }

    pub fn local_endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Queues `msg` on every connection that has been accepted. The
    /// context is only attached once the welcome is queued, so the frame
    /// always lands behind it. Returns how many connections got it.
    pub fn broadcast<M: Outbound + ?Sized>(&self, msg: &M) -> Result<usize, ProtocolError> {
        let frame = Frame::encode(msg)?;
        let targets = self.connections();
        let delivered = targets
            .iter()
            .filter(|c| c.context().is_some())
            .filter(|c| c.queue_frame(frame.clone()).is_ok())
            .count();
        tracing::debug!(id = %frame.id(), delivered, "server broadcast");
        Ok(delivered)
    }

    /// Closes every open connection.
    pub fn close_all(&self) {
        for conn in self.connections() {
            conn.close();
        }
    }

    /// Adds a message package for connections accepted from now on.
    /// Live connections keep the registry they started with.
    pub fn add_package(&self, package: &MessagePackage<C>) -> Result<(), ProtocolError> {
        let mut current = self
            .shared
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let next = current.extended(package)?;
        *current = Arc::new(next);
        tracing::info!(package = package.name, "message package added");
        Ok(())
    }

    /// The registry new connections are created with.
    pub fn registry(&self) -> Arc<MessageRegistry<C>> {
        self.shared.registry()
    }
}

//! Client side: open a stream, register, wait for the verdict.

use std::sync::Arc;

use loomwire_protocol::{ErrorCode, MessagePackage, MessageRegistry, ProtocolError, SystemMessage};
use loomwire_session::{Connection, ConnectionListener, SessionError};
use loomwire_transport::{ConnectionId, Connector};
use tokio_util::sync::CancellationToken;

use crate::{ClientConfig, ConnectError};

/// Opens connections to a server and performs the client handshake.
///
/// One `NetClient` can make many attempts. [`cancel`](Self::cancel)
/// aborts the attempt in progress and every later one: a canceled client
/// stays canceled.
pub struct NetClient<C> {
    config: ClientConfig,
    registry: Arc<MessageRegistry<C>>,
    cancel: CancellationToken,
}

impl<C: Send + Sync + 'static> NetClient<C> {
    pub fn new(config: ClientConfig, registry: MessageRegistry<C>) -> Self {
        Self {
            config: config.validated(),
            registry: Arc::new(registry),
            cancel: CancellationToken::new(),
        }
    }

    /// Client whose registry holds the given packages.
    pub fn with_packages(
        config: ClientConfig,
        packages: &[&MessagePackage<C>],
    ) -> Result<Self, ProtocolError> {
        let mut registry = MessageRegistry::new();
        for package in packages {
            registry.add_package(package)?;
        }
        Ok(Self::new(config, registry))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Aborts the current attempt. The partial connection is closed and
    /// the attempt reports `ConnectCanceled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Connects to `endpoint`, presenting `key`.
    ///
    /// On welcome, `context` becomes the session context and the
    /// configured personality is activated.
    pub async fn connect<K: Connector>(
        &self,
        connector: &K,
        endpoint: &str,
        key: &str,
        context: C,
    ) -> Result<Connection<C>, ConnectError> {
        self.connect_inner(connector, endpoint, key, context, None).await
    }

    /// Like [`connect`](Self::connect), attaching `listener` before the
    /// personality starts.
    pub async fn connect_with_listener<K: Connector>(
        &self,
        connector: &K,
        endpoint: &str,
        key: &str,
        context: C,
        listener: Arc<dyn ConnectionListener<C>>,
    ) -> Result<Connection<C>, ConnectError> {
        self.connect_inner(connector, endpoint, key, context, Some(listener))
            .await
    }

    async fn connect_inner<K: Connector>(
        &self,
        connector: &K,
        endpoint: &str,
        key: &str,
        context: C,
        listener: Option<Arc<dyn ConnectionListener<C>>>,
    ) -> Result<Connection<C>, ConnectError> {
        if self.is_canceled() {
            return Err(ConnectError::canceled());
        }

        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ConnectError::canceled()),
            opened = tokio::time::timeout(self.config.connect_timeout(), connector.connect(endpoint)) => opened,
        };
        let stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ConnectError::new(ErrorCode::ConnectFailed, e.to_string())),
            Err(_) => {
                return Err(ConnectError::new(
                    ErrorCode::ConnectTimedOut,
                    format!("no connection to {endpoint} within {:?}", self.config.connect_timeout()),
                ));
            }
        };

        let conn = Connection::new(ConnectionId::next(), endpoint, stream, Arc::clone(&self.registry));
        tracing::debug!(conn_id = %conn.id(), endpoint, "stream open, registering");

        let result = self.register(&conn, key).await;
        let verdict = match result {
            Ok(verdict) => verdict,
            Err(err) => {
                conn.close();
                return Err(err);
            }
        };

        match verdict {
            SystemMessage::ServerWelcome => {}
            SystemMessage::ServerError { code, message } => {
                conn.close();
                return Err(ConnectError::new(code, message));
            }
            SystemMessage::VersionError {
                code,
                server_version,
                message,
            } => {
                conn.close();
                return Err(ConnectError {
                    code,
                    message,
                    server_version: Some(server_version),
                });
            }
            other => {
                conn.close();
                return Err(ConnectError::new(
                    ErrorCode::BadRequest,
                    format!("unexpected {} during handshake", other.name()),
                ));
            }
        }

        conn.set_context(context);
        if let Some(listener) = listener {
            conn.add_listener(listener);
        }
        if let Err(e) = conn.activate(self.config.personality) {
            conn.close();
            return Err(ConnectError::new(ErrorCode::ConnectFailed, e.to_string()));
        }
        tracing::info!(conn_id = %conn.id(), endpoint, "connected");
        Ok(conn)
    }

    /// Sends the registration and waits for the server's answer.
    async fn register(&self, conn: &Connection<C>, key: &str) -> Result<SystemMessage, ConnectError> {
        let register = SystemMessage::ClientRegister {
            version: self.config.protocol_version,
            key: key.to_string(),
        };
        conn.queue_message(&register)
            .map_err(|e| ConnectError::new(ErrorCode::ConnectFailed, e.to_string()))?;

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(ConnectError::canceled()),
            sent = conn.send_queued() => {
                sent.map_err(|e| ConnectError::new(ErrorCode::ConnectFailed, e.to_string()))?;
            }
        }
        if self.is_canceled() {
            return Err(ConnectError::canceled());
        }

        let timeout = self.config.handshake_timeout();
        let reply = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ConnectError::canceled()),
            reply = conn.next_system_message(timeout) => reply,
        };
        reply.map_err(|e| match e {
            SessionError::Timeout(_) => {
                ConnectError::new(ErrorCode::ConnectTimedOut, "no answer from server")
            }
            SessionError::UnexpectedMessage(id) => {
                ConnectError::new(ErrorCode::BadRequest, format!("unexpected message {id} during handshake"))
            }
            other => ConnectError::new(ErrorCode::ConnectFailed, other.to_string()),
        })
    }
}

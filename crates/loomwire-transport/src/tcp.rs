//! TCP transport built on `tokio::net`.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::{Accepted, BoxStream, ConnectionId, Connector, Transport, TransportError};

/// A [`Transport`] that accepts TCP connections.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Binds a new TCP listener to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| {
            TransportError::BindFailed {
                addr: addr.to_string(),
                source,
            }
        })?;
        tracing::info!(addr, "TCP transport listening");
        Ok(Self { listener })
    }

    /// Returns the bound socket address (useful after binding port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Transport for TcpTransport {
    async fn accept(&mut self) -> Result<Accepted, TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        // Messages are small and latency matters more than packet count.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%addr, error = %e, "could not set TCP_NODELAY");
        }

        let id = ConnectionId::next();
        tracing::debug!(%id, %addr, "accepted TCP connection");

        Ok(Accepted {
            id,
            peer: addr.to_string(),
            stream: Box::new(stream),
        })
    }

    fn local_endpoint(&self) -> String {
        match self.listener.local_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "<unbound>".to_string(),
        }
    }
}

/// A [`Connector`] that opens TCP connections to `host:port` endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> Result<BoxStream, TransportError> {
        let stream = TcpStream::connect(endpoint).await.map_err(|source| {
            TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                source,
            }
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(endpoint, error = %e, "could not set TCP_NODELAY");
        }
        tracing::debug!(endpoint, "TCP connection opened");
        Ok(Box::new(stream))
    }
}

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Binding a listener failed.
    #[error("bind to {addr} failed: {source}")]
    BindFailed {
        /// The address or endpoint name that could not be bound.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Accepting an incoming stream failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// Opening a stream to a remote endpoint failed.
    #[error("connect to {endpoint} failed: {source}")]
    ConnectFailed {
        /// The endpoint we tried to reach.
        endpoint: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// No in-memory listener is registered under this name.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// An in-memory listener is already registered under this name.
    #[error("endpoint already bound: {0}")]
    EndpointInUse(String),

    /// The transport was shut down and will not yield more streams.
    #[error("transport shut down")]
    Shutdown,
}

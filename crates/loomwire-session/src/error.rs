//! Error types for the session layer.

use std::time::Duration;

use loomwire_protocol::{MessageId, ProtocolError};
use loomwire_transport::ConnectionId;

/// Errors that can occur while using a [`Connection`](crate::Connection).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The connection is closed; nothing more can be sent or received.
    #[error("{0} is closed")]
    Closed(ConnectionId),

    /// [`Connection::activate`](crate::Connection::activate) was called on
    /// a connection that already runs a personality.
    #[error("{0} already has an active personality")]
    AlreadyActive(ConnectionId),

    /// A bounded wait expired.
    #[error("no message within {0:?}")]
    Timeout(Duration),

    /// A system message was expected but something else arrived.
    #[error("unexpected message {0}")]
    UnexpectedMessage(MessageId),

    /// Encoding failed, or the stream carried bytes that do not decode.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

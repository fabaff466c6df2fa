//! Error types for the protocol layer.
//!
//! Each crate in Loomwire defines its own error enum. A `ProtocolError`
//! always means the bytes on the wire (or the registry describing them)
//! were wrong, never that the network failed underneath.

use crate::MessageId;

/// Errors that can occur while encoding, decoding, or registering messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The buffer ended before the message did.
    ///
    /// While a stream is open this is not fatal: the frame decoder keeps
    /// the bytes and waits for more. At end-of-stream it is.
    #[error("incomplete message: {needed} more byte(s) needed")]
    Incomplete {
        /// How many more bytes the reader wanted at the point it stopped.
        needed: usize,
    },

    /// A string is longer than a `u16` length prefix can describe.
    #[error("string of {0} bytes exceeds the 65535-byte wire limit")]
    StringTooLong(usize),

    /// The bytes are structurally wrong (bad UTF-8, bad bool, bad length).
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The message decoded but violates protocol rules (e.g. an unknown
    /// error code).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Two message types were registered under the same pair.
    #[error("message {0} is already registered")]
    DuplicateRegistration(MessageId),

    /// Applications cannot register messages in the system category.
    #[error("category {0} is reserved for system messages")]
    ReservedCategory(u8),

    /// The underlying stream failed or ended mid-frame.
    ///
    /// `tokio_util`'s framing requires codec errors to be constructible
    /// from `io::Error`.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// `true` for [`ProtocolError::Incomplete`].
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }
}

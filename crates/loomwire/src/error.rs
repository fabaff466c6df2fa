//! Unified error type for Loomwire.

use std::path::PathBuf;

use loomwire_protocol::{ErrorCode, ProtocolError};
use loomwire_router::RouterError;
use loomwire_session::SessionError;
use loomwire_transport::TransportError;

use crate::redirect::TransferError;

/// Why a client connection attempt failed.
///
/// `code` is what the application should branch on; `message` is for
/// humans. Version mismatches carry the version the server speaks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ConnectError {
    pub code: ErrorCode,
    pub message: String,
    pub server_version: Option<u32>,
}

impl ConnectError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            server_version: None,
        }
    }

    pub(crate) fn canceled() -> Self {
        Self::new(ErrorCode::ConnectCanceled, "connection attempt canceled")
    }
}

/// Failure to load a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level error that wraps every crate-specific error.
///
/// The `#[from]` conversions let `?` lift sub-crate errors directly.
#[derive(Debug, thiserror::Error)]
pub enum LoomwireError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

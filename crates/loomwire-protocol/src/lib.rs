//! Wire protocol for Loomwire.
//!
//! This crate defines what travels over a connection and how it is turned
//! into handler calls:
//!
//! - **Wire primitives** ([`WireWriter`], [`WireReader`]): big-endian
//!   numbers and `u16`-prefixed UTF-8 strings.
//! - **Messages** ([`Message`], [`Outbound`], [`Frame`]): typed payloads
//!   identified by a [`MessageId`] `(category, type)` pair.
//! - **System messages** ([`SystemMessage`], [`ErrorCode`]): handshake,
//!   refusal, ping and end-of-connection, always category 0.
//! - **Registry** ([`MessageRegistry`], [`Handle`], [`MessagePackage`]):
//!   the explicit table mapping pairs to handlers.
//! - **Framing** ([`FrameCodec`], [`FrameEncoder`]): `tokio_util` codecs
//!   that cut a byte stream into [`Inbound`] items.
//!
//! # Architecture
//!
//! ```text
//! Transport (bytes) → Protocol (Inbound / Frame) → Session (Connection + context)
//! ```

mod codec;
mod error;
mod location;
mod message;
mod registry;
mod system;
pub mod wire;

pub use codec::{FrameCodec, FrameEncoder, Inbound};
pub use error::ProtocolError;
pub use location::Location;
pub use message::{Frame, HEADER_LEN, Message, MessageId, Outbound};
pub use registry::{
    BoxedHandler, Dispatch, ErasedHandler, Handle, HandlerError, MessagePackage, MessageRegistry,
};
pub use system::{ErrorCode, SYSTEM_CATEGORY, SystemMessage};
pub use wire::{MAX_STRING_LEN, WireReader, WireWriter};

// Handlers return deferred actions; re-exported so message crates need
// only this dependency.
pub use loomwire_tick::Deferred;

//! Message identity, the [`Message`] trait, and pre-encoded [`Frame`]s.
//!
//! A frame on the wire is `[category: u8][type: u8][payload...]`. There is
//! no total-length prefix: the receiver learns where a message ends by
//! decoding it.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::wire::{WireReader, WireWriter};
use crate::ProtocolError;

/// Bytes taken by the `(category, type)` header.
pub const HEADER_LEN: usize = 2;

/// The `(category, type)` pair that identifies a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    /// Groups related messages (one category per message package).
    pub category: u8,
    /// Distinguishes messages within a category.
    pub kind: u8,
}

impl MessageId {
    pub const fn new(category: u8, kind: u8) -> Self {
        Self { category, kind }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.kind)
    }
}

/// A concrete wire message type.
///
/// Implementors write their fields in a fixed order in
/// [`encode`](Self::encode) and read them back in the same order in
/// [`decode`](Self::decode). The header is handled by the framing layer.
///
/// ```
/// use loomwire_protocol::{Message, ProtocolError, WireReader, WireWriter};
///
/// #[derive(Debug, PartialEq)]
/// struct Say {
///     text: String,
/// }
///
/// impl Message for Say {
///     const CATEGORY: u8 = 2;
///     const TYPE: u8 = 1;
///
///     fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
///         w.put_str(&self.text)
///     }
///
///     fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
///         Ok(Say { text: r.get_string()? })
///     }
/// }
/// ```
pub trait Message: Send + Sync + Sized + 'static {
    /// Category byte of the header.
    const CATEGORY: u8;
    /// Type byte of the header.
    const TYPE: u8;

    /// Writes the payload fields.
    fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), ProtocolError>;

    /// Reads the payload fields.
    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError>;

    /// This type's `(category, type)` pair.
    fn id() -> MessageId {
        MessageId::new(Self::CATEGORY, Self::TYPE)
    }
}

/// Anything that can be written as a frame.
///
/// Object safe, so heterogeneous messages can sit behind `&dyn Outbound`.
/// Every [`Message`] gets this for free; the system message enum
/// implements it by hand because its variants carry different ids.
pub trait Outbound: Send + Sync {
    /// The header this value is written under.
    fn message_id(&self) -> MessageId;

    /// Writes the payload (not the header).
    fn encode_payload(&self, w: &mut WireWriter<'_>) -> Result<(), ProtocolError>;
}

impl<M: Message> Outbound for M {
    fn message_id(&self) -> MessageId {
        M::id()
    }

    fn encode_payload(&self, w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
        self.encode(w)
    }
}

/// A fully encoded message, header included.
///
/// Encoding happens once when a message is queued. Cloning a frame only
/// bumps a reference count, so broadcasting one message to many
/// connections never re-encodes it.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    id: MessageId,
    bytes: Bytes,
}

impl Frame {
    /// Encodes `msg` into a new frame.
    pub fn encode<M: Outbound + ?Sized>(msg: &M) -> Result<Self, ProtocolError> {
        let mut buf = BytesMut::with_capacity(64);
        let id = msg.message_id();
        {
            let mut w = WireWriter::new(&mut buf);
            w.put_u8(id.category);
            w.put_u8(id.kind);
            msg.encode_payload(&mut w)?;
        }
        Ok(Self {
            id,
            bytes: buf.freeze(),
        })
    }

    /// The header of this frame.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Header plus payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total encoded length.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always `false`; a frame contains at least its header.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        a: u16,
        b: String,
    }

    impl Message for Pair {
        const CATEGORY: u8 = 9;
        const TYPE: u8 = 4;

        fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
            w.put_u16(self.a);
            w.put_str(&self.b)
        }

        fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
            Ok(Self {
                a: r.get_u16()?,
                b: r.get_string()?,
            })
        }
    }

    #[test]
    fn test_message_id_display() {
        assert_eq!(MessageId::new(3, 7).to_string(), "3:7");
        assert_eq!(Pair::id(), MessageId::new(9, 4));
    }

    #[test]
    fn test_frame_starts_with_header() {
        let frame = Frame::encode(&Pair { a: 1, b: "z".into() }).unwrap();
        assert_eq!(frame.id(), MessageId::new(9, 4));
        assert_eq!(frame.as_bytes(), &[9, 4, 0, 1, 0, 1, b'z']);
        assert_eq!(frame.len(), 7);
    }

    #[test]
    fn test_frame_from_trait_object() {
        let msg: &dyn Outbound = &Pair { a: 0, b: String::new() };
        let frame = Frame::encode(msg).unwrap();
        assert_eq!(frame.id(), Pair::id());
    }

    #[test]
    fn test_frame_encode_error_propagates() {
        let msg = Pair {
            a: 0,
            b: "x".repeat(70_000),
        };
        assert!(matches!(
            Frame::encode(&msg),
            Err(ProtocolError::StringTooLong(70_000))
        ));
    }

    #[test]
    fn test_decode_reads_back_fields() {
        let frame = Frame::encode(&Pair { a: 513, b: "ok".into() }).unwrap();
        let mut r = WireReader::new(&frame.as_bytes()[HEADER_LEN..]);
        let back = Pair::decode(&mut r).unwrap();
        assert_eq!(back.a, 513);
        assert_eq!(back.b, "ok");
    }
}

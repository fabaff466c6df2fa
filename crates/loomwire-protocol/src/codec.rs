//! Stream framing on top of `tokio_util::codec`.
//!
//! Frames carry no length prefix, so the decoder simply tries to decode a
//! whole message from the start of the buffer. If the reader runs out of
//! bytes it reports [`ProtocolError::Incomplete`]; the decoder then leaves
//! the buffer untouched and asks for more input. Any other failure is
//! fatal for the stream.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{Frame, HEADER_LEN, MessageId};
use crate::registry::{BoxedHandler, MessageRegistry};
use crate::system::{SYSTEM_CATEGORY, SystemMessage};
use crate::wire::WireReader;
use crate::ProtocolError;

/// One decoded unit from the stream.
pub enum Inbound<C> {
    /// A built-in protocol message.
    System(SystemMessage),
    /// A registered application message, ready to run.
    Handler(MessageId, BoxedHandler<C>),
    /// Nothing is registered for this pair.
    ///
    /// Without a length prefix the payload cannot be skipped precisely,
    /// so every byte buffered at that point was discarded.
    Unknown {
        id: MessageId,
        discarded: usize,
    },
}

impl<C> Inbound<C> {
    /// Header of the decoded item.
    pub fn id(&self) -> MessageId {
        match self {
            Self::System(msg) => crate::Outbound::message_id(msg),
            Self::Handler(id, _) => *id,
            Self::Unknown { id, .. } => *id,
        }
    }
}

impl<C> fmt::Debug for Inbound<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System(msg) => f.debug_tuple("System").field(msg).finish(),
            Self::Handler(id, _) => f.debug_tuple("Handler").field(id).finish(),
            Self::Unknown { id, discarded } => f
                .debug_struct("Unknown")
                .field("id", id)
                .field("discarded", discarded)
                .finish(),
        }
    }
}

/// Decodes [`Inbound`] items using a shared [`MessageRegistry`].
pub struct FrameCodec<C> {
    registry: Arc<MessageRegistry<C>>,
}

impl<C> FrameCodec<C> {
    pub fn new(registry: Arc<MessageRegistry<C>>) -> Self {
        Self { registry }
    }

    /// The registry this codec decodes with.
    pub fn registry(&self) -> &Arc<MessageRegistry<C>> {
        &self.registry
    }
}

impl<C: 'static> Decoder for FrameCodec<C> {
    type Item = Inbound<C>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let id = MessageId::new(src[0], src[1]);

        // Ok(None) below means "nobody knows this pair".
        let mut r = WireReader::new(&src[HEADER_LEN..]);
        let decoded = if id.category == SYSTEM_CATEGORY {
            SystemMessage::decode(id.kind, &mut r).map(|m| m.map(Inbound::System))
        } else {
            match self.registry.decode(id, &mut r) {
                Some(res) => res.map(|h| Some(Inbound::Handler(id, h))),
                None => Ok(None),
            }
        };

        match decoded {
            Ok(Some(item)) => {
                let consumed = HEADER_LEN + r.position();
                src.advance(consumed);
                tracing::trace!(%id, bytes = consumed, "frame decoded");
                Ok(Some(item))
            }
            Ok(None) => {
                let discarded = src.len();
                src.clear();
                Ok(Some(Inbound::Unknown { id, discarded }))
            }
            Err(e) if e.is_incomplete() => {
                if let ProtocolError::Incomplete { needed } = e {
                    src.reserve(needed);
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Writes pre-encoded [`Frame`]s to the stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEncoder;

impl Encoder<Frame> for FrameEncoder {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(frame.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::registry::{Dispatch, Handle, HandlerError};
    use crate::wire::WireWriter;

    struct Note(String);

    impl Message for Note {
        const CATEGORY: u8 = 4;
        const TYPE: u8 = 1;
        fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
            w.put_str(&self.0)
        }
        fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
            Ok(Self(r.get_string()?))
        }
    }

    impl Handle<Vec<String>> for Note {
        fn handle(self, _ctx: &Vec<String>) -> Result<Dispatch<Vec<String>>, HandlerError> {
            Ok(Dispatch::Done)
        }
    }

    fn codec() -> FrameCodec<Vec<String>> {
        let mut reg = MessageRegistry::new();
        reg.register::<Note>().unwrap();
        FrameCodec::new(Arc::new(reg))
    }

    fn encoded(frames: &[Frame]) -> BytesMut {
        let mut buf = BytesMut::new();
        for f in frames {
            FrameEncoder.encode(f.clone(), &mut buf).unwrap();
        }
        buf
    }

    #[test]
    fn test_two_frames_decode_in_order() {
        let a = Frame::encode(&Note("first".into())).unwrap();
        let b = Frame::encode(&SystemMessage::Ping { seq: 3 }).unwrap();
        let mut buf = encoded(&[a, b]);
        let mut codec = codec();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Inbound::Handler(id, _) if id == Note::id()));
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(second, Inbound::System(SystemMessage::Ping { seq: 3 })));
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let frame = Frame::encode(&Note("hello world".into())).unwrap();
        let bytes = frame.as_bytes();
        let mut codec = codec();

        let mut buf = BytesMut::new();
        for (i, byte) in bytes.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let out = codec.decode(&mut buf).unwrap();
            if i + 1 < bytes.len() {
                assert!(out.is_none(), "decoded early at byte {i}");
                assert_eq!(buf.len(), i + 1, "partial bytes must be kept");
            } else {
                assert!(out.is_some());
            }
        }
    }

    #[test]
    fn test_unknown_pair_discards_buffer() {
        let mut buf = BytesMut::from(&[42u8, 7, 1, 2, 3][..]);
        let mut codec = codec();
        match codec.decode(&mut buf).unwrap().unwrap() {
            Inbound::Unknown { id, discarded } => {
                assert_eq!(id, MessageId::new(42, 7));
                assert_eq!(discarded, 5);
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_payload_is_fatal() {
        // Note with a 2-byte string that is not UTF-8.
        let mut buf = BytesMut::from(&[4u8, 1, 0, 2, 0xC3, 0x28][..]);
        let err = codec().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_truncated_stream_at_eof_is_error() {
        let frame = Frame::encode(&Note("cut".into())).unwrap();
        let mut buf = BytesMut::from(&frame.as_bytes()[..4]);
        assert!(codec().decode_eof(&mut buf).is_err());
    }
}

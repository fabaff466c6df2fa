//! Anything a router can hand a frame to.

use loomwire_protocol::Frame;
use loomwire_session::Connection;

/// A member of a group.
///
/// `deliver` must not block: routers call it for every member of a
/// snapshot, one after the other.
pub trait Recipient: Send + Sync + 'static {
    /// Hands over an encoded frame. Returns `false` if the recipient can
    /// no longer accept anything (it is closed).
    fn deliver(&self, frame: &Frame) -> bool;
}

impl<C: Send + Sync + 'static> Recipient for Connection<C> {
    fn deliver(&self, frame: &Frame) -> bool {
        self.queue_frame(frame.clone()).is_ok()
    }
}

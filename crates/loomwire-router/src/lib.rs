//! Group membership and broadcast routing for Loomwire.
//!
//! # Key types
//!
//! - [`GroupRouter`]: a named table of members keyed by anything hashable
//! - [`MessageRouter`]: scoped broadcast, with related groups as the
//!   extension point for hierarchical worlds
//! - [`Recipient`]: what a member must be able to do (implemented for
//!   every [`Connection`](loomwire_session::Connection))
//! - [`Scope`]: local, extended, or extended-only delivery

mod error;
mod group;
mod recipient;
mod scope;

pub use error::RouterError;
pub use group::{GroupRouter, MessageRouter};
pub use recipient::Recipient;
pub use scope::Scope;

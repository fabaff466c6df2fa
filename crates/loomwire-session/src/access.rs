//! Access control hook for the connection handshake.
//!
//! Loomwire doesn't decide who may connect. The embedding application
//! implements [`AccessControl`]: given the new connection and the key the
//! client presented, it either accepts (supplying the session context and
//! any lifecycle listeners) or rejects with an [`ErrorCode`].

use std::future::Future;
use std::sync::Arc;

use loomwire_protocol::ErrorCode;

use crate::{Connection, ConnectionListener};

/// Outcome of an access check.
pub enum AccessDecision<C> {
    /// Let the client in. `context` becomes the connection's session
    /// context and every listener is attached before the welcome is sent.
    Accept {
        context: C,
        listeners: Vec<Arc<dyn ConnectionListener<C>>>,
    },
    /// Refuse the client with a machine-readable code and a reason.
    Reject { code: ErrorCode, reason: String },
}

impl<C> AccessDecision<C> {
    pub fn accept(context: C) -> Self {
        Self::Accept {
            context,
            listeners: Vec::new(),
        }
    }

    pub fn reject(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Reject {
            code,
            reason: reason.into(),
        }
    }

    /// Adds a listener to an `Accept`. No effect on a `Reject`.
    pub fn with_listener(mut self, listener: Arc<dyn ConnectionListener<C>>) -> Self {
        if let Self::Accept { listeners, .. } = &mut self {
            listeners.push(listener);
        }
        self
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept { .. })
    }
}

impl<C> std::fmt::Debug for AccessDecision<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept { listeners, .. } => f
                .debug_struct("Accept")
                .field("listeners", &listeners.len())
                .finish_non_exhaustive(),
            Self::Reject { code, reason } => f
                .debug_struct("Reject")
                .field("code", code)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// Decides whether a client key grants access.
///
/// # Example
///
/// ```rust
/// use loomwire_protocol::ErrorCode;
/// use loomwire_session::{split_key, AccessControl, AccessDecision, Connection};
///
/// struct Guestbook;
///
/// impl AccessControl<String> for Guestbook {
///     async fn authorize(&self, _conn: &Connection<String>, key: &str) -> AccessDecision<String> {
///         match split_key(key) {
///             Ok((name, "guest")) => AccessDecision::accept(name.to_string()),
///             Ok(_) => AccessDecision::reject(ErrorCode::BadKeyValue, "wrong password"),
///             Err(code) => AccessDecision::reject(code, "expected name:password"),
///         }
///     }
/// }
/// ```
pub trait AccessControl<C>: Send + Sync + 'static {
    /// Called once per connection, after the version check and before
    /// the welcome.
    fn authorize(
        &self,
        conn: &Connection<C>,
        key: &str,
    ) -> impl Future<Output = AccessDecision<C>> + Send;
}

/// Accepts every key with a default context.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl<C> AccessControl<C> for AcceptAll
where
    C: Default + Send + Sync + 'static,
{
    async fn authorize(&self, conn: &Connection<C>, key: &str) -> AccessDecision<C> {
        tracing::debug!(conn_id = %conn.id(), key, "accepting without checks");
        AccessDecision::accept(C::default())
    }
}

/// Splits a `login:password` key at the first colon.
///
/// # Errors
/// [`ErrorCode::BadKeyFormat`] if there is no colon or the login part is
/// empty.
pub fn split_key(key: &str) -> Result<(&str, &str), ErrorCode> {
    match key.split_once(':') {
        Some((login, secret)) if !login.is_empty() => Ok((login, secret)),
        _ => Err(ErrorCode::BadKeyFormat),
    }
}

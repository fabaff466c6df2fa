//! Moving a client to another server.
//!
//! The old server first hands the session over out of band (through a
//! [`SessionTransfer`]). Only when that succeeded does it tell the client
//! where to go; otherwise the client gets a [`RedirectFailed`] and stays
//! where it is. On the client, both outcomes are deferred to the next
//! tick boundary and reach the session context through
//! [`RedirectListener`].

use std::future::Future;

use loomwire_protocol::{
    Deferred, Dispatch, Handle, HandlerError, Message, MessagePackage, MessageRegistry,
    ProtocolError, WireReader, WireWriter,
};
use loomwire_session::Connection;

use crate::LoomwireError;

/// Category shared by the redirect messages.
pub const REDIRECT_CATEGORY: u8 = 1;

/// Reason sent to the client when the transfer did not go through.
pub const RETRY_LATER: &str = "Movement failed. Retry later...";

/// Tells the client to reconnect to another server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectConnection {
    /// The account key the session continues under.
    pub primary_key: String,
    pub server_id: u32,
    pub host: String,
    pub port: u16,
}

impl RedirectConnection {
    /// `host:port`, ready for a TCP connector.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Message for RedirectConnection {
    const CATEGORY: u8 = REDIRECT_CATEGORY;
    const TYPE: u8 = 1;

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
        w.put_str(&self.primary_key)?;
        w.put_u32(self.server_id);
        w.put_str(&self.host)?;
        w.put_u16(self.port);
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            primary_key: r.get_string()?,
            server_id: r.get_u32()?,
            host: r.get_string()?,
            port: r.get_u16()?,
        })
    }
}

/// The redirect did not happen; the client keeps its current server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectFailed {
    pub reason: String,
}

impl Message for RedirectFailed {
    const CATEGORY: u8 = REDIRECT_CATEGORY;
    const TYPE: u8 = 2;

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
        w.put_str(&self.reason)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            reason: r.get_string()?,
        })
    }
}

/// Client-side session context that can follow redirects.
pub trait RedirectListener: Send + Sync + 'static {
    fn redirect_to(&self, redirect: &RedirectConnection);
    fn redirect_failed(&self, reason: &str);
}

impl<C: RedirectListener> Handle<C> for RedirectConnection {
    fn handle(self, _ctx: &C) -> Result<Dispatch<C>, HandlerError> {
        Ok(Dispatch::Defer(Deferred::new("redirect", move |ctx: &C| {
            ctx.redirect_to(&self);
        })))
    }
}

impl<C: RedirectListener> Handle<C> for RedirectFailed {
    fn handle(self, _ctx: &C) -> Result<Dispatch<C>, HandlerError> {
        Ok(Dispatch::Defer(Deferred::new("redirect-failed", move |ctx: &C| {
            ctx.redirect_failed(&self.reason);
        })))
    }
}

fn register_redirect<C: RedirectListener>(reg: &mut MessageRegistry<C>) -> Result<(), ProtocolError> {
    reg.register::<RedirectConnection>()?
        .register::<RedirectFailed>()?;
    Ok(())
}

/// The redirect messages, for client registries.
pub fn redirect_package<C: RedirectListener>() -> MessagePackage<C> {
    MessagePackage {
        name: "redirect",
        register: register_redirect::<C>,
    }
}

/// A session transfer to another server failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("session transfer failed: {0}")]
pub struct TransferError(pub String);

/// Hands a session over to another server, out of band.
pub trait SessionTransfer: Send + Sync + 'static {
    fn transfer(
        &self,
        primary_key: &str,
        server_id: u32,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;
}

/// Transfers the session, then queues the matching outcome on `conn`.
///
/// The client only learns the new address after the transfer succeeded.
/// On failure it gets [`RETRY_LATER`] and the transfer error is returned.
pub async fn redirect_session<C, T>(
    conn: &Connection<C>,
    transfer: &T,
    redirect: RedirectConnection,
) -> Result<(), LoomwireError>
where
    C: Send + Sync + 'static,
    T: SessionTransfer,
{
    match transfer.transfer(&redirect.primary_key, redirect.server_id).await {
        Ok(()) => {
            tracing::info!(conn_id = %conn.id(), server_id = redirect.server_id, "redirecting client");
            conn.queue_message(&redirect)?;
            Ok(())
        }
        Err(e) => {
            tracing::warn!(conn_id = %conn.id(), server_id = redirect.server_id, error = %e, "redirect failed");
            conn.queue_message(&RedirectFailed {
                reason: RETRY_LATER.to_string(),
            })?;
            Err(e.into())
        }
    }
}

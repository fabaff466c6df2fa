//! Server side of the connection handshake.
//!
//! ```text
//! client                           server
//!   │── ClientRegister{ver, key} ──▶│  version check
//!   │◀── VersionError{code, ver} ───│  mismatch: close
//!   │                               │  AccessControl::authorize
//!   │◀── ServerError{code, msg} ────│  rejected: close
//!   │◀── ServerWelcome ─────────────│  accepted: context + listeners
//! ```

use std::time::Duration;

use loomwire_protocol::{ErrorCode, SystemMessage};
use loomwire_session::{AccessControl, AccessDecision, Connection, SessionError};

use crate::ConnectError;

/// Runs the handshake on a fresh connection.
///
/// On success the context and listeners are attached and the welcome has
/// been written. On failure the refusal has been written and the
/// connection is closed.
pub(crate) async fn accept_handshake<C, A>(
    conn: &Connection<C>,
    access: &A,
    protocol_version: u32,
    timeout: Duration,
) -> Result<(), ConnectError>
where
    C: Send + Sync + 'static,
    A: AccessControl<C>,
{
    let (version, key) = match conn.next_system_message(timeout).await {
        Ok(SystemMessage::ClientRegister { version, key }) => (version, key),
        Ok(other) => {
            let err = ConnectError::new(
                ErrorCode::BadRequest,
                format!("expected registration, got {}", other.name()),
            );
            return Err(refuse(conn, err).await);
        }
        Err(SessionError::UnexpectedMessage(id)) => {
            let err = ConnectError::new(
                ErrorCode::BadRequest,
                format!("expected registration, got message {id}"),
            );
            return Err(refuse(conn, err).await);
        }
        Err(SessionError::Timeout(_)) => {
            conn.close();
            return Err(ConnectError::new(
                ErrorCode::ConnectTimedOut,
                "no registration received",
            ));
        }
        Err(e) => {
            conn.close();
            return Err(ConnectError::new(ErrorCode::ConnectFailed, e.to_string()));
        }
    };

    if version != protocol_version {
        let code = if version < protocol_version {
            ErrorCode::VersionTooOld
        } else {
            ErrorCode::VersionTooNew
        };
        let err = ConnectError {
            code,
            message: format!("client version {version}, server version {protocol_version}"),
            server_version: Some(protocol_version),
        };
        return Err(refuse(conn, err).await);
    }

    match access.authorize(conn, &key).await {
        AccessDecision::Accept { context, listeners } => {
            // The welcome must be first in the queue: listeners and
            // broadcasts may queue application frames once the context is set.
            conn.queue_message(&SystemMessage::ServerWelcome)
                .map_err(|e| ConnectError::new(ErrorCode::ConnectFailed, e.to_string()))?;
            conn.set_context(context);
            for listener in listeners {
                conn.add_listener(listener);
            }
            conn.send_queued()
                .await
                .map_err(|e| ConnectError::new(ErrorCode::ConnectFailed, e.to_string()))?;
            Ok(())
        }
        AccessDecision::Reject { code, reason } => Err(refuse(conn, ConnectError::new(code, reason)).await),
    }
}

/// Writes the refusal matching `err`, closes, and hands `err` back.
pub(crate) async fn refuse<C>(conn: &Connection<C>, err: ConnectError) -> ConnectError
where
    C: Send + Sync + 'static,
{
    let msg = match err.server_version {
        Some(server_version) => SystemMessage::VersionError {
            code: err.code,
            server_version,
            message: err.message.clone(),
        },
        None => SystemMessage::ServerError {
            code: err.code,
            message: err.message.clone(),
        },
    };
    if conn.queue_message(&msg).is_ok() {
        if let Err(e) = conn.send_queued().await {
            tracing::debug!(conn_id = %conn.id(), error = %e, "refusal not delivered");
        }
    }
    conn.close();
    err
}

//! Concurrency personalities: who drives sending and receiving.
//!
//! - **Synchronous**: the application calls
//!   [`Connection::send_queued`] and [`Connection::receive_available`]
//!   from its own loop (typically once per tick).
//! - **Asynchronous**: two background tasks do it. The sender waits for
//!   queued frames, lets more accumulate for a short window, then writes
//!   the batch. The receiver waits for bytes, dispatches what arrived and
//!   applies deferred actions.

use std::sync::PoisonError;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{Connection, SessionError};

/// Where a connection is in its personality lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonalityState {
    /// Created; handshake calls are allowed, nothing runs in the background.
    Idle,
    /// A personality has been activated.
    Active,
    /// Terminal.
    Closed,
}

/// Tuning for the synchronous personality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Messages dispatched per `receive_available` call.
    pub max_per_receive: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self { max_per_receive: 15 }
    }
}

/// Tuning for the asynchronous personality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncSettings {
    /// How long the sender lets frames accumulate before writing.
    pub aggregation_window_ms: u64,
    /// Queue length that ends the window early.
    pub aggregation_limit: usize,
    /// Ceiling for the limit as the sender adapts to bursts.
    pub max_aggregation_limit: usize,
    /// Messages the receiver dispatches before yielding.
    pub max_per_tick: usize,
}

impl Default for AsyncSettings {
    fn default() -> Self {
        Self {
            aggregation_window_ms: 20,
            aggregation_limit: 10,
            max_aggregation_limit: 50,
            max_per_tick: 15,
        }
    }
}

impl AsyncSettings {
    /// Step by which the limit grows each time a batch fills it.
    pub const LIMIT_STEP: usize = 5;

    pub fn aggregation_window(&self) -> Duration {
        Duration::from_millis(self.aggregation_window_ms)
    }
}

/// Which side drives I/O for a connection.
///
/// Serialized with a `mode` tag:
///
/// ```json
/// { "mode": "asynchronous", "aggregation_window_ms": 20 }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Personality {
    Synchronous(SyncSettings),
    Asynchronous(AsyncSettings),
}

impl Default for Personality {
    fn default() -> Self {
        Self::Asynchronous(AsyncSettings::default())
    }
}

impl Personality {
    pub fn synchronous() -> Self {
        Self::Synchronous(SyncSettings::default())
    }

    pub fn asynchronous() -> Self {
        Self::Asynchronous(AsyncSettings::default())
    }

    pub fn is_synchronous(&self) -> bool {
        matches!(self, Self::Synchronous(_))
    }
}

impl<C: Send + Sync + 'static> Connection<C> {
    /// Starts the given personality. Allowed once, on an open connection.
    ///
    /// The asynchronous personality spawns its workers on the current
    /// Tokio runtime.
    pub fn activate(&self, personality: Personality) -> Result<(), SessionError> {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match *state {
                PersonalityState::Idle => *state = PersonalityState::Active,
                PersonalityState::Active => return Err(SessionError::AlreadyActive(self.id())),
                PersonalityState::Closed => return Err(SessionError::Closed(self.id())),
            }
        }

        match personality {
            Personality::Synchronous(settings) => {
                self.set_receive_budget(settings.max_per_receive);
            }
            Personality::Asynchronous(settings) => {
                self.set_receive_budget(settings.max_per_tick);
                tokio::spawn(sender_loop(self.clone(), settings));
                tokio::spawn(receiver_loop(self.clone()));
            }
        }
        tracing::debug!(conn_id = %self.id(), ?personality, "personality activated");
        Ok(())
    }

    pub fn personality_state(&self) -> PersonalityState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn sender_loop<C: Send + Sync + 'static>(conn: Connection<C>, settings: AsyncSettings) {
    let cancel = conn.inner.cancel.clone();
    let window = settings.aggregation_window();
    let max_limit = settings.max_aggregation_limit.max(1);
    let mut limit = settings.aggregation_limit.clamp(1, max_limit);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = conn.inner.outgoing_ready.notified() => {}
        }

        let deadline = Instant::now() + window;
        while conn.queued_len() < limit && !cancel.is_cancelled() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = conn.inner.outgoing_ready.notified() => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        if cancel.is_cancelled() {
            break;
        }

        match conn.send_queued().await {
            Ok(sent) if sent >= limit && limit < max_limit => {
                limit = (limit + AsyncSettings::LIMIT_STEP).min(max_limit);
                tracing::debug!(conn_id = %conn.id(), limit, "aggregation limit raised");
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    tracing::trace!(conn_id = %conn.id(), "sender stopped");
}

async fn receiver_loop<C: Send + Sync + 'static>(conn: Connection<C>) {
    loop {
        if let Err(e) = conn.wait_for_message().await {
            tracing::trace!(conn_id = %conn.id(), error = %e, "receiver stopping");
            break;
        }
        if conn.receive_available().await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }
    tracing::trace!(conn_id = %conn.id(), "receiver stopped");
}

//! Tick-driven driver for synchronous connections.
//!
//! Each tick: dispatch what arrived (which also applies deferred
//! actions), then flush the outgoing queue. With an event-driven
//! [`TickConfig`] (rate 0) the pump wakes on incoming messages instead.

use loomwire_session::{Connection, SessionError};
use loomwire_tick::{TickConfig, TickScheduler};
use tokio::task::JoinHandle;

/// Drives one synchronous connection until it closes.
pub struct SyncPump<C> {
    conn: Connection<C>,
    scheduler: TickScheduler,
}

impl<C: Send + Sync + 'static> SyncPump<C> {
    pub fn new(conn: Connection<C>, config: TickConfig) -> Self {
        Self {
            conn,
            scheduler: TickScheduler::new(config),
        }
    }

    /// Runs until the connection closes. Returns the number of ticks.
    pub async fn run(mut self) -> Result<u64, SessionError> {
        tracing::debug!(conn_id = %self.conn.id(), rate_hz = self.scheduler.rate_hz(), "sync pump started");
        let closed = self.conn.clone();

        loop {
            if self.scheduler.is_event_driven() {
                tokio::select! {
                    _ = closed.closed() => break,
                    waited = self.conn.wait_for_message() => match waited {
                        Ok(()) => {}
                        Err(SessionError::Closed(_)) => break,
                        Err(e) => return Err(e),
                    },
                }
            } else {
                tokio::select! {
                    _ = closed.closed() => break,
                    info = self.scheduler.wait_for_tick() => {
                        tracing::trace!(tick = info.tick, lateness = ?info.lateness, "pump tick");
                    }
                }
            }

            match self.conn.receive_available().await {
                Ok(_) => {}
                Err(SessionError::Closed(_)) => break,
                Err(e) => return Err(e),
            }
            match self.conn.send_queued().await {
                Ok(_) => {}
                Err(SessionError::Closed(_)) => break,
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(conn_id = %self.conn.id(), ticks = self.scheduler.tick_count(), "sync pump stopped");
        Ok(self.scheduler.tick_count())
    }

    pub fn spawn(self) -> JoinHandle<Result<u64, SessionError>> {
        tokio::spawn(self.run())
    }
}

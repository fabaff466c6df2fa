//! Liveness probing with system ping messages.
//!
//! The probing side sends `Ping { seq }` once per period and expects the
//! same sequence number back within two periods. The other side just
//! echoes. A connection echoes by default; enabling the monitor turns
//! echoing off for that end so probes never bounce back and forth.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use loomwire_protocol::SystemMessage;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::Connection;

/// Sequence numbers wrap at this value.
const SEQ_MODULUS: u8 = 120;

/// Probe period used when the caller has no preference.
pub const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(2);

/// Latest result published by the ping monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStatus {
    /// No probe has completed yet.
    Idle,
    /// Round trip of the last answered probe.
    Measured(Duration),
    /// The last probe got no answer within two periods.
    Failed,
    /// The connection is closed.
    Closed,
}

pub(crate) struct PingState {
    send_back: AtomicBool,
    running: AtomicBool,
    outstanding: Mutex<Option<(u8, Instant)>>,
    status: watch::Sender<PingStatus>,
}

impl PingState {
    pub(crate) fn new() -> Self {
        let (status, _) = watch::channel(PingStatus::Idle);
        Self {
            send_back: AtomicBool::new(true),
            running: AtomicBool::new(false),
            outstanding: Mutex::new(None),
            status,
        }
    }

    pub(crate) fn send_back(&self) -> bool {
        self.send_back.load(Ordering::Relaxed)
    }

    fn begin(&self, seq: u8) {
        *self.outstanding.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((seq, Instant::now()));
    }

    pub(crate) fn record_echo(&self, seq: u8) {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(PoisonError::into_inner);
        match *outstanding {
            Some((expected, sent_at)) if expected == seq => {
                *outstanding = None;
                let rtt = sent_at.elapsed();
                tracing::trace!(seq, ?rtt, "ping answered");
                self.status.send_replace(PingStatus::Measured(rtt));
            }
            _ => tracing::debug!(seq, "stale ping echo ignored"),
        }
    }

    fn outstanding_since(&self) -> Option<(u8, Instant)> {
        *self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gives up on `seq` if it is still unanswered.
    fn expire(&self, seq: u8) -> bool {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*outstanding, Some((expected, _)) if expected == seq) {
            *outstanding = None;
            self.status.send_replace(PingStatus::Failed);
            true
        } else {
            false
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.status.send_replace(PingStatus::Closed);
    }
}

impl<C: Send + Sync + 'static> Connection<C> {
    /// Whether this end echoes pings it receives.
    pub fn set_send_back_pings(&self, enabled: bool) {
        self.inner.ping.send_back.store(enabled, Ordering::Relaxed);
    }

    /// Watches the ping status without starting a monitor.
    pub fn ping_status(&self) -> watch::Receiver<PingStatus> {
        self.inner.ping.status.subscribe()
    }

    /// Starts probing the peer every `period`. Stops echoing on this end.
    ///
    /// Calling it again only returns another receiver. Echoes are
    /// recorded when messages are dispatched, so a synchronous
    /// connection must keep calling `receive_available` for probes to
    /// succeed.
    pub fn enable_ping(&self, period: Duration) -> watch::Receiver<PingStatus> {
        self.set_send_back_pings(false);
        if !self.inner.ping.running.swap(true, Ordering::AcqRel) {
            tokio::spawn(ping_loop(self.clone(), period));
        }
        self.ping_status()
    }
}

async fn ping_loop<C: Send + Sync + 'static>(conn: Connection<C>, period: Duration) {
    let cancel = conn.inner.cancel.clone();
    let mut seq: u8 = rand::rng().random_range(0..SEQ_MODULUS);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }

        match conn.inner.ping.outstanding_since() {
            Some((late, sent_at)) if sent_at.elapsed() >= period * 2 => {
                if conn.inner.ping.expire(late) {
                    tracing::warn!(conn_id = %conn.id(), seq = late, "ping not answered");
                }
            }
            Some(_) => continue,
            None => {}
        }

        seq = (seq + 1) % SEQ_MODULUS;
        conn.inner.ping.begin(seq);
        if conn.queue_message(&SystemMessage::Ping { seq }).is_err() {
            break;
        }
        if conn.send_queued().await.is_err() {
            break;
        }
    }
    tracing::trace!(conn_id = %conn.id(), "ping monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_with_matching_seq_measures() {
        let state = PingState::new();
        let rx = state.status.subscribe();
        state.begin(7);
        state.record_echo(7);
        assert!(matches!(*rx.borrow(), PingStatus::Measured(_)));
        assert!(!state.expire(7));
    }

    #[test]
    fn test_stale_echo_is_ignored() {
        let state = PingState::new();
        let rx = state.status.subscribe();
        state.begin(8);
        state.record_echo(3);
        assert_eq!(*rx.borrow(), PingStatus::Idle);
        assert!(state.expire(8));
        assert_eq!(*rx.borrow(), PingStatus::Failed);
    }
}

//! Tick scheduling and deferred actions for Loomwire.
//!
//! Two small pieces that together define a "tick boundary":
//!
//! - [`TickScheduler`] fires at a fixed rate and is what synchronous
//!   connections are pumped by (receive, apply deferred work, send).
//! - [`DeferredQueue`] holds [`Deferred`] actions that message handlers
//!   validated during dispatch but want applied later, exactly once, at the
//!   next boundary.
//!
//! # Event-driven mode
//!
//! When `rate_hz` is 0, [`TickScheduler::wait_for_tick`] pends forever.
//! Asynchronous connections use this mode: their receive loop is the
//! boundary, not a clock.
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         _ = conn.closed() => break,
//!         _ = scheduler.wait_for_tick() => {
//!             conn.receive_available().await?;
//!             conn.send_queued().await?;
//!         }
//!     }
//! }
//! ```

mod deferred;

pub use deferred::{Deferred, DeferredQueue};

use std::time::Duration;

use rand::Rng;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What to do when the caller falls behind the tick clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TickPolicy {
    /// Skip the missed ticks and stay on the original grid.
    #[default]
    Skip,
    /// Fire the missed ticks back-to-back until caught up.
    Burst,
    /// Restart the grid from the late tick.
    Delay,
}

impl TickPolicy {
    fn missed_tick_behavior(self) -> MissedTickBehavior {
        match self {
            Self::Skip => MissedTickBehavior::Skip,
            Self::Burst => MissedTickBehavior::Burst,
            Self::Delay => MissedTickBehavior::Delay,
        }
    }
}

/// Configuration for a [`TickScheduler`].
#[derive(Debug, Clone)]
pub struct TickConfig {
    /// Tick rate in Hz. 0 = event-driven (tick never fires).
    pub rate_hz: u32,
    /// Catch-up behaviour.
    pub policy: TickPolicy,
    /// Upper bound of random delay added before the first tick, so many
    /// connections created together do not tick in lockstep.
    pub initial_jitter: Duration,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            rate_hz: 0,
            policy: TickPolicy::default(),
            initial_jitter: Duration::from_millis(2),
        }
    }
}

impl TickConfig {
    /// Maximum supported tick rate.
    pub const MAX_RATE_HZ: u32 = 1_000;

    /// Create a config for a specific tick rate with default settings.
    pub fn with_rate(rate_hz: u32) -> Self {
        Self {
            rate_hz,
            ..Default::default()
        }
    }

    /// Clamp out-of-range values. Called by [`TickScheduler::new`].
    pub fn validated(mut self) -> Self {
        if self.rate_hz > Self::MAX_RATE_HZ {
            warn!(
                rate = self.rate_hz,
                max = Self::MAX_RATE_HZ,
                "rate_hz exceeds maximum, clamping"
            );
            self.rate_hz = Self::MAX_RATE_HZ;
        }
        self
    }

    /// Duration of a single tick. `None` in event-driven mode.
    pub fn period(&self) -> Option<Duration> {
        if self.rate_hz == 0 {
            None
        } else {
            Some(Duration::from_secs_f64(1.0 / self.rate_hz as f64))
        }
    }
}

// ---------------------------------------------------------------------------
// Tick info & metrics
// ---------------------------------------------------------------------------

/// Returned by [`TickScheduler::wait_for_tick`].
#[derive(Debug, Clone)]
pub struct TickInfo {
    /// Monotonically increasing tick number (starts at 1).
    pub tick: u64,
    /// Fixed period of the scheduler.
    pub dt: Duration,
    /// How late this tick fired relative to its scheduled instant.
    pub lateness: Duration,
}

/// Counters kept by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct TickMetrics {
    /// Total ticks fired.
    pub total_ticks: u64,
    /// Ticks that fired more than 10% of a period late.
    pub late_ticks: u64,
    /// Largest lateness observed.
    pub max_lateness: Duration,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Fixed-rate tick source.
pub struct TickScheduler {
    config: TickConfig,
    period: Option<Duration>,
    /// Built lazily on the first wait so construction needs no runtime.
    interval: Option<Interval>,
    first_tick_at: Option<Instant>,
    tick_count: u64,
    paused: bool,
    metrics: TickMetrics,
}

impl TickScheduler {
    /// Create a scheduler. The first tick is due one period (plus jitter)
    /// from now.
    pub fn new(config: TickConfig) -> Self {
        let config = config.validated();
        let period = config.period();
        let first_tick_at = period.map(|p| Instant::now() + p + initial_jitter(&config));

        match period {
            None => debug!("tick scheduler created in event-driven mode"),
            Some(p) => debug!(
                rate_hz = config.rate_hz,
                period_ms = p.as_secs_f64() * 1000.0,
                policy = ?config.policy,
                "tick scheduler created"
            ),
        }

        Self {
            config,
            period,
            interval: None,
            first_tick_at,
            tick_count: 0,
            paused: false,
            metrics: TickMetrics::default(),
        }
    }

    /// Create a scheduler for a specific rate with default settings.
    pub fn with_rate(rate_hz: u32) -> Self {
        Self::new(TickConfig::with_rate(rate_hz))
    }

    /// Wait until the next tick is due.
    ///
    /// Pends forever in event-driven mode or while paused, which lets it
    /// sit in a `tokio::select!` next to other branches.
    pub async fn wait_for_tick(&mut self) -> TickInfo {
        let period = match self.period {
            Some(period) if !self.paused => period,
            _ => std::future::pending().await,
        };
        let policy = self.config.policy;
        let start = self.first_tick_at.unwrap_or_else(|| Instant::now() + period);
        let interval = self.interval.get_or_insert_with(|| {
            let mut interval = time::interval_at(start, period);
            interval.set_missed_tick_behavior(policy.missed_tick_behavior());
            interval
        });

        let scheduled = interval.tick().await;
        let lateness = Instant::now().saturating_duration_since(scheduled);

        self.tick_count += 1;
        self.metrics.total_ticks += 1;
        if lateness > period / 10 {
            self.metrics.late_ticks += 1;
            warn!(
                tick = self.tick_count,
                late_ms = lateness.as_secs_f64() * 1000.0,
                "tick fired late"
            );
        }
        if lateness > self.metrics.max_lateness {
            self.metrics.max_lateness = lateness;
        }
        trace!(tick = self.tick_count, "tick fired");

        TickInfo {
            tick: self.tick_count,
            dt: period,
            lateness,
        }
    }

    /// Stop firing until [`resume`](Self::resume). Idempotent.
    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            debug!(tick = self.tick_count, "tick scheduler paused");
        }
    }

    /// Resume after a pause. The next tick is one period from now; ticks
    /// missed while paused are not replayed.
    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            self.interval = None;
            self.first_tick_at = self.period.map(|p| Instant::now() + p);
            debug!(tick = self.tick_count, "tick scheduler resumed");
        }
    }

    /// Whether the scheduler is currently paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether this scheduler is in event-driven mode.
    pub fn is_event_driven(&self) -> bool {
        self.period.is_none()
    }

    /// Number of ticks fired so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Snapshot of current metrics.
    pub fn metrics(&self) -> &TickMetrics {
        &self.metrics
    }

    /// The configured rate in Hz.
    pub fn rate_hz(&self) -> u32 {
        self.config.rate_hz
    }

    /// The fixed tick period, or `None` in event-driven mode.
    pub fn period(&self) -> Option<Duration> {
        self.period
    }
}

fn initial_jitter(config: &TickConfig) -> Duration {
    let max = config.initial_jitter.as_micros() as u64;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(rand::rng().random_range(0..max))
}

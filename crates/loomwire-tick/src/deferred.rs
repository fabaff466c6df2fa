//! Actions that run at the next tick boundary.
//!
//! A handler that wants to change application state outside its own
//! dispatch returns a [`Deferred`]. The connection parks it in a
//! [`DeferredQueue`] and applies it with the session context once the
//! current batch of messages has been dispatched.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::trace;

type Action<C> = Box<dyn FnOnce(&C) + Send>;

/// A one-shot action applied to a context of type `C`.
///
/// Created in the *pending* state; [`apply`](Self::apply) consumes it, so
/// it cannot run twice.
pub struct Deferred<C> {
    label: &'static str,
    action: Action<C>,
}

impl<C> Deferred<C> {
    /// Wraps `action` under a short label used in logs.
    pub fn new(label: &'static str, action: impl FnOnce(&C) + Send + 'static) -> Self {
        Self {
            label,
            action: Box::new(action),
        }
    }

    /// The label given at construction.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Runs the action.
    pub fn apply(self, ctx: &C) {
        trace!(label = self.label, "applying deferred action");
        (self.action)(ctx);
    }
}

impl<C> fmt::Debug for Deferred<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// FIFO of pending [`Deferred`] actions. Safe to share between tasks.
pub struct DeferredQueue<C> {
    pending: Mutex<VecDeque<Deferred<C>>>,
}

impl<C> DeferredQueue<C> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Parks an action until the next [`run_all`](Self::run_all).
    pub fn push(&self, action: Deferred<C>) {
        self.lock().push_back(action);
    }

    /// Applies every action queued so far, in order, and returns how many
    /// ran.
    ///
    /// Actions queued while this runs wait for the next call.
    pub fn run_all(&self, ctx: &C) -> usize {
        let batch = std::mem::take(&mut *self.lock());
        let count = batch.len();
        for action in batch {
            action.apply(ctx);
        }
        count
    }

    /// Drops every pending action without running it.
    pub fn clear(&self) -> usize {
        let mut pending = self.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no actions are pending.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Deferred<C>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C> Default for DeferredQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

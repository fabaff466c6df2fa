//! The connection object: one duplex stream, its outgoing queue, its
//! session context, and the dispatch of whatever arrives.
//!
//! A [`Connection`] is a cheap, cloneable handle. Every clone refers to
//! the same session; the stream halves live behind async mutexes so the
//! sender and receiver can work independently.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──▶ handshake (sync calls) ──▶ set_context() ──▶ activate()
//!                                                          │
//!              close() / shutdown() / I/O error ◀──────────┘
//!                         │
//!                         ▼
//!              listeners notified once
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures_util::{FutureExt, SinkExt, StreamExt};
use loomwire_protocol::{
    Dispatch, Frame, FrameCodec, FrameEncoder, Inbound, MessageRegistry, Outbound, SystemMessage,
};
use loomwire_tick::DeferredQueue;
use loomwire_transport::{BoxStream, ConnectionId};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::personality::{PersonalityState, SyncSettings};
use crate::ping::PingState;
use crate::SessionError;

type Reader<C> = FramedRead<ReadHalf<BoxStream>, FrameCodec<C>>;
type Writer = FramedWrite<WriteHalf<BoxStream>, FrameEncoder>;

/// Decoded items plus the framed reader they came from.
struct ReadSide<C> {
    framed: Reader<C>,
    /// Items pulled off the stream by `wait_for_message` but not yet
    /// dispatched.
    pending: VecDeque<Inbound<C>>,
}

/// Observes the lifecycle of a connection.
pub trait ConnectionListener<C>: Send + Sync + 'static {
    /// Called when the listener is attached to an open connection.
    fn connection_created(&self, conn: &Connection<C>) {
        let _ = conn;
    }

    /// Called exactly once, when the connection closes for any reason.
    fn connection_closed(&self, conn: &Connection<C>);
}

pub(crate) struct Inner<C> {
    id: ConnectionId,
    peer: String,
    outgoing: Mutex<VecDeque<Frame>>,
    pub(crate) outgoing_ready: Notify,
    writer: tokio::sync::Mutex<Option<Writer>>,
    reader: tokio::sync::Mutex<Option<ReadSide<C>>>,
    context: RwLock<Option<Arc<C>>>,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener<C>>>>,
    closed: AtomicBool,
    pub(crate) cancel: CancellationToken,
    deferred: DeferredQueue<C>,
    receive_budget: AtomicUsize,
    pub(crate) state: Mutex<PersonalityState>,
    pub(crate) ping: PingState,
}

/// Handle to one logical session over a byte stream.
pub struct Connection<C> {
    pub(crate) inner: Arc<Inner<C>>,
}

impl<C> Clone for Connection<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// Non-owning handle, for contexts that need to reach their own
/// connection without keeping it alive.
pub struct WeakConnection<C> {
    inner: Weak<Inner<C>>,
}

impl<C> Clone for WeakConnection<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<C> WeakConnection<C> {
    /// The connection, if any handle to it is still alive.
    pub fn upgrade(&self) -> Option<Connection<C>> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: Send + Sync + 'static> Connection<C> {
    /// Wraps `stream`. Incoming bytes are decoded with `registry`.
    ///
    /// The connection starts with no context and no personality: the
    /// caller drives the handshake with the synchronous calls, then
    /// attaches a context and [`activate`](Self::activate)s it.
    pub fn new(
        id: ConnectionId,
        peer: impl Into<String>,
        stream: BoxStream,
        registry: Arc<MessageRegistry<C>>,
    ) -> Self {
        let peer = peer.into();
        let (read_half, write_half) = tokio::io::split(stream);
        tracing::debug!(conn_id = %id, %peer, "connection created");

        Self {
            inner: Arc::new(Inner {
                id,
                peer,
                outgoing: Mutex::new(VecDeque::new()),
                outgoing_ready: Notify::new(),
                writer: tokio::sync::Mutex::new(Some(FramedWrite::new(write_half, FrameEncoder))),
                reader: tokio::sync::Mutex::new(Some(ReadSide {
                    framed: FramedRead::new(read_half, FrameCodec::new(registry)),
                    pending: VecDeque::new(),
                })),
                context: RwLock::new(None),
                listeners: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                deferred: DeferredQueue::new(),
                receive_budget: AtomicUsize::new(SyncSettings::default().max_per_receive),
                state: Mutex::new(PersonalityState::Idle),
                ping: PingState::new(),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Peer description given by the transport.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await;
    }

    pub fn downgrade(&self) -> WeakConnection<C> {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // -----------------------------------------------------------------
    // Session context
    // -----------------------------------------------------------------

    /// Replaces the session context handed to message handlers, returning
    /// the previous one.
    pub fn set_context(&self, ctx: C) -> Option<Arc<C>> {
        self.set_shared_context(Arc::new(ctx))
    }

    /// Like [`set_context`](Self::set_context) for a context that is
    /// already shared.
    pub fn set_shared_context(&self, ctx: Arc<C>) -> Option<Arc<C>> {
        let mut slot = self
            .inner
            .context
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        slot.replace(ctx)
    }

    /// The current session context.
    pub fn context(&self) -> Option<Arc<C>> {
        self.inner
            .context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // -----------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------

    /// Attaches a lifecycle listener.
    ///
    /// On an open connection the listener's `connection_created` runs
    /// immediately. On a closed one the listener is dropped unused.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener<C>>) {
        if self.is_closed() {
            tracing::debug!(conn_id = %self.id(), "listener added after close, ignored");
            return;
        }
        lock(&self.inner.listeners).push(Arc::clone(&listener));
        listener.connection_created(self);
    }

    /// Detaches a listener previously added. Returns whether it was found.
    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener<C>>) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    // -----------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------

    /// Encodes `msg` and appends it to the outgoing queue. Never blocks.
    ///
    /// # Errors
    /// [`SessionError::Closed`] on a closed connection, or a protocol
    /// error if the message cannot be encoded.
    pub fn queue_message<M: Outbound + ?Sized>(&self, msg: &M) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id()));
        }
        let frame = Frame::encode(msg)?;
        self.queue_frame(frame)
    }

    /// Appends an already encoded frame. Used to share one encoding
    /// between many connections.
    pub fn queue_frame(&self, frame: Frame) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id()));
        }
        lock(&self.inner.outgoing).push_back(frame);
        self.inner.outgoing_ready.notify_one();
        Ok(())
    }

    /// Frames waiting to be written.
    pub fn queued_len(&self) -> usize {
        lock(&self.inner.outgoing).len()
    }

    /// Writes every queued frame, in queue order, and flushes.
    ///
    /// Returns how many frames were written. Any I/O failure closes the
    /// connection.
    pub async fn send_queued(&self) -> Result<usize, SessionError> {
        let mut guard = self.inner.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(SessionError::Closed(self.id()));
        };

        // Drain under the writer lock so concurrent senders keep FIFO.
        let batch: Vec<Frame> = lock(&self.inner.outgoing).drain(..).collect();
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();

        let mut result = Ok(());
        for frame in batch {
            if let Err(e) = writer.feed(frame).await {
                result = Err(e);
                break;
            }
        }
        if result.is_ok() {
            result = writer.flush().await;
        }

        match result {
            Ok(()) => {
                tracing::trace!(conn_id = %self.id(), frames = count, "frames sent");
                if self.is_closed() {
                    guard.take();
                }
                Ok(count)
            }
            Err(e) => {
                guard.take();
                drop(guard);
                tracing::debug!(conn_id = %self.id(), error = %e, "send failed, closing");
                self.close();
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------

    /// Upper bound on messages dispatched by one
    /// [`receive_available`](Self::receive_available) call.
    pub fn receive_budget(&self) -> usize {
        self.inner.receive_budget.load(Ordering::Relaxed)
    }

    pub(crate) fn set_receive_budget(&self, budget: usize) {
        self.inner.receive_budget.store(budget.max(1), Ordering::Relaxed);
    }

    /// Waits until at least one message is buffered.
    ///
    /// The message is not dispatched; the next
    /// [`receive_available`](Self::receive_available) does that.
    pub async fn wait_for_message(&self) -> Result<(), SessionError> {
        let mut guard = self.inner.reader.lock().await;
        let Some(side) = guard.as_mut() else {
            return Err(SessionError::Closed(self.id()));
        };
        if !side.pending.is_empty() {
            return Ok(());
        }

        let next = tokio::select! {
            _ = self.inner.cancel.cancelled() => None,
            item = side.framed.next() => Some(item),
        };

        match next {
            Some(Some(Ok(item))) => {
                side.pending.push_back(item);
                Ok(())
            }
            None => {
                guard.take();
                Err(SessionError::Closed(self.id()))
            }
            Some(None) => {
                guard.take();
                drop(guard);
                tracing::debug!(conn_id = %self.id(), "peer closed the stream");
                self.close();
                Err(SessionError::Closed(self.id()))
            }
            Some(Some(Err(e))) => {
                guard.take();
                drop(guard);
                tracing::warn!(conn_id = %self.id(), error = %e, "receive failed, closing");
                self.close();
                Err(e.into())
            }
        }
    }

    /// Like [`wait_for_message`](Self::wait_for_message) with a deadline.
    pub async fn wait_for_message_timeout(&self, timeout: Duration) -> Result<(), SessionError> {
        tokio::time::timeout(timeout, self.wait_for_message())
            .await
            .map_err(|_| SessionError::Timeout(timeout))?
    }

    /// Waits for the next message and returns it if it is a system
    /// message. Used by the handshake before any context exists.
    ///
    /// # Errors
    /// [`SessionError::Timeout`] if nothing arrives in time,
    /// [`SessionError::UnexpectedMessage`] for an application or unknown
    /// message, [`SessionError::Closed`] if the stream ends.
    pub async fn next_system_message(&self, timeout: Duration) -> Result<SystemMessage, SessionError> {
        self.wait_for_message_timeout(timeout).await?;
        let item = {
            let mut guard = self.inner.reader.lock().await;
            guard.as_mut().and_then(|side| side.pending.pop_front())
        };
        match item {
            Some(Inbound::System(msg)) => Ok(msg),
            Some(other) => Err(SessionError::UnexpectedMessage(other.id())),
            None => Err(SessionError::Closed(self.id())),
        }
    }

    /// Decodes and dispatches what is already buffered, up to the receive
    /// budget, then applies deferred actions. Never waits for the network.
    ///
    /// Returns the number of messages dispatched.
    pub async fn receive_available(&self) -> Result<usize, SessionError> {
        let budget = self.receive_budget();
        let mut guard = self.inner.reader.lock().await;
        let Some(side) = guard.as_mut() else {
            return Err(SessionError::Closed(self.id()));
        };

        let mut count = 0;
        let mut ended = false;
        let mut failure = None;
        while count < budget {
            let item = match side.pending.pop_front() {
                Some(item) => item,
                None => match side.framed.next().now_or_never() {
                    None => break,
                    Some(None) => {
                        ended = true;
                        break;
                    }
                    Some(Some(Err(e))) => {
                        failure = Some(e);
                        break;
                    }
                    Some(Some(Ok(item))) => item,
                },
            };
            self.dispatch(item);
            count += 1;
            if self.is_closed() {
                break;
            }
        }

        if ended || failure.is_some() || self.is_closed() {
            guard.take();
        }
        drop(guard);

        if let Some(e) = failure {
            tracing::warn!(conn_id = %self.id(), error = %e, "receive failed, closing");
            self.close();
            return Err(e.into());
        }
        if ended {
            tracing::debug!(conn_id = %self.id(), "peer closed the stream");
            self.close();
        }

        self.run_deferred();
        Ok(count)
    }

    /// Applies deferred actions queued by handlers. Returns how many ran.
    pub fn run_deferred(&self) -> usize {
        match self.context() {
            Some(ctx) => self.inner.deferred.run_all(&ctx),
            None => 0,
        }
    }

    /// Deferred actions waiting for the next boundary.
    pub fn deferred_len(&self) -> usize {
        self.inner.deferred.len()
    }

    fn dispatch(&self, item: Inbound<C>) {
        let conn_id = self.id();
        match item {
            Inbound::System(SystemMessage::Ping { seq }) => {
                if self.inner.ping.send_back() {
                    let _ = self.queue_message(&SystemMessage::Ping { seq });
                } else {
                    self.inner.ping.record_echo(seq);
                }
            }
            Inbound::System(SystemMessage::EndOfConnection) => {
                tracing::debug!(%conn_id, "peer ended the connection");
                self.close();
            }
            Inbound::System(other) => {
                tracing::warn!(%conn_id, message = other.name(), "unexpected system message dropped");
            }
            Inbound::Handler(id, handler) => {
                let Some(ctx) = self.context() else {
                    tracing::warn!(%conn_id, %id, "no session context, message dropped");
                    return;
                };
                match handler.run(&ctx) {
                    Ok(Dispatch::Done) => {}
                    Ok(Dispatch::Defer(action)) => self.inner.deferred.push(action),
                    Err(e) => {
                        tracing::warn!(%conn_id, %id, error = %e, "handler failed, message dropped");
                    }
                }
            }
            Inbound::Unknown { id, discarded } => {
                tracing::warn!(%conn_id, %id, discarded, "unknown message, buffered bytes discarded");
            }
        }
    }

    // -----------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------

    /// Closes the connection. Idempotent.
    ///
    /// Stops the personality workers, releases the stream, drops unsent
    /// frames and pending deferred actions, and notifies every listener
    /// exactly once.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();

        // Halves held by a worker are released by that worker.
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.inner.reader.try_lock() {
            reader.take();
        }

        *lock(&self.inner.state) = PersonalityState::Closed;
        lock(&self.inner.outgoing).clear();
        self.inner.deferred.clear();
        self.inner.ping.mark_closed();

        tracing::info!(conn_id = %self.id(), peer = %self.inner.peer, "connection closed");

        let listeners = std::mem::take(&mut *lock(&self.inner.listeners));
        for listener in listeners {
            listener.connection_closed(self);
        }
    }

    /// Sends an end-of-connection notice, flushes the queue, then closes.
    pub async fn shutdown(&self) {
        if self.is_closed() {
            return;
        }
        if self.queue_message(&SystemMessage::EndOfConnection).is_ok() {
            if let Err(e) = self.send_queued().await {
                tracing::debug!(conn_id = %self.id(), error = %e, "flush before close failed");
            }
        }
        self.close();
    }
}

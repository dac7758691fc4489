//! The per-endpoint connection: the "socket" of the full-duplex emulation.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use hyper::Body as HyperBody;
use hyper::Response;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::message::{DecoderRegistry, Message};
use crate::rt::Exec;
use crate::{receiver, sender};

/// The constant protocol name this transport reports itself as.
pub const PROTOCOL_NAME: &str = "http";

/// The response future donated from a sender's donation cycle to the receiver.
///
/// This is, concretely, the not-yet-awaited future returned by
/// `hyper::client::conn::http1::SendRequest::send_request` — the request has already been
/// written (the spawned `Connection` future is driving that concurrently); only the response is
/// still pending.
pub(crate) type PendingResponse =
    Pin<Box<dyn Future<Output = hyper::Result<Response<HyperBody>>> + Send>>;

/// An endpoint address. Equality and hashing follow the URI's external string form, per spec.
#[derive(Clone, Debug)]
pub struct Address(http::Uri);

impl Address {
    /// Wraps `uri` as an endpoint address.
    pub fn new(uri: http::Uri) -> Address {
        Address(uri)
    }

    pub(crate) fn uri(&self) -> &http::Uri {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_string() == other.0.to_string()
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_string().hash(state);
    }
}

/// The opaque, server-assigned connection identifier carried as `id=` in every POST.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wraps an already-assigned identifier. Assignment itself is out of this module's scope.
    pub fn new(id: impl Into<String>) -> ConnectionId {
        ConnectionId(id.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Timeouts and limits governing one connection's donation cycles.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Timeout for TCP connect + HTTP/1 handshake. Default 15s, per spec.
    pub connect_timeout: Duration,
    /// Timeout for awaiting the donated response (headers + body). Default 120s, per spec.
    pub read_timeout: Duration,
    /// Upper bound on the size of a response body the receiver will buffer before parsing.
    pub max_response_body_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(120),
            max_response_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// The single slot holding the one outstanding receive channel.
///
/// `Claimed` is distinct from `Empty` so that the sender, whose exit/park condition is phrased
/// in terms of "is a receive channel currently parked", sees the channel as still occupied while
/// the receiver is in the middle of reading and processing it (spec §4.3 step 2: "do NOT clear
/// the slot yet").
pub(crate) enum SlotState {
    Empty,
    Full(PendingResponse),
    Claimed,
}

impl SlotState {
    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, SlotState::Empty)
    }
}

pub(crate) struct MonitorState {
    pub(crate) queue: Option<VecDeque<Arc<dyn Message>>>,
    pub(crate) slot: SlotState,
    pub(crate) closed: bool,
}

/// The shared monitor coordinating the sender and receiver, modeled as a `tokio::sync::Mutex`
/// paired with a `tokio::sync::Notify` standing in for the source's intrinsic monitor.
pub(crate) struct Monitor {
    state: AsyncMutex<MonitorState>,
    notify: Notify,
}

impl Monitor {
    fn new() -> Monitor {
        Monitor {
            state: AsyncMutex::new(MonitorState {
                queue: None,
                slot: SlotState::Empty,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Waits until `pred` yields `Some`, re-checking after every wakeup. `pred` runs with the
    /// monitor locked and may mutate state as part of producing its result. Returns
    /// `Err(Error::new_closed())` if the connection is closed before `pred` is ever satisfied.
    ///
    /// Uses `Notified::enable()` to register as a waiter before releasing the lock and checking
    /// the predicate, which is tokio's documented race-free pattern for condvar-style waits (a
    /// `notify_waiters()` call racing with our check is never lost).
    pub(crate) async fn wait_until<T>(
        &self,
        mut pred: impl FnMut(&mut MonitorState) -> Option<T>,
    ) -> Result<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut guard = self.state.lock().await;
                if guard.closed {
                    return Err(Error::new_closed());
                }
                if let Some(t) = pred(&mut *guard) {
                    return Ok(t);
                }
            }

            notified.await;
        }
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().await
    }

    pub(crate) fn wake_all(&self) {
        self.notify.notify_waiters();
    }
}

struct InboundState {
    in_seq: u64,
    reorder: std::collections::BTreeMap<u64, Arc<dyn Message>>,
}

pub(crate) struct Callbacks {
    pub(crate) on_messages: Box<dyn Fn(&[Arc<dyn Message>]) + Send + Sync>,
    pub(crate) on_error: Box<dyn Fn(&Error) + Send + Sync>,
}

/// One full-duplex-over-HTTP connection to a single server endpoint.
///
/// Constructed via [`crate::Context::register`]. Always used behind an `Arc`, since the
/// sender/receiver worker tasks each hold a clone.
pub struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) address: Address,
    pub(crate) config: ConnectionConfig,
    pub(crate) decoders: DecoderRegistry,
    pub(crate) exec: Exec,
    pub(crate) monitor: Monitor,
    pub(crate) out_seq: AtomicU64,
    inbound: std::sync::Mutex<InboundState>,
    callbacks: std::sync::Mutex<Option<Callbacks>>,
    started: AtomicBool,
    closed: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    // A weak handle to itself, so `&self` methods can obtain an owned `Arc<Connection>` to move
    // into spawned worker tasks without requiring callers to route calls through `Arc<Self>`.
    self_weak: Weak<Connection>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        address: Address,
        config: ConnectionConfig,
        decoders: DecoderRegistry,
        exec: Exec,
    ) -> Arc<Connection> {
        Arc::new_cyclic(|self_weak| Connection {
            id,
            address,
            config,
            decoders,
            exec,
            monitor: Monitor::new(),
            out_seq: AtomicU64::new(1),
            inbound: std::sync::Mutex::new(InboundState {
                in_seq: 1,
                reorder: std::collections::BTreeMap::new(),
            }),
            callbacks: std::sync::Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
            self_weak: self_weak.clone(),
        })
    }

    /// An owned handle to this same connection, for code that needs to move a clone into a
    /// spawned task. Never fails in practice: a `Connection` only ever hands this out from
    /// methods called through an `Arc` it is itself kept alive by.
    fn arc(&self) -> Arc<Connection> {
        self.self_weak
            .upgrade()
            .expect("Connection::arc called while no Arc<Connection> was holding this value alive")
    }

    /// The endpoint address this connection was created for.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The server-assigned connection identifier.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// The constant protocol name for this transport.
    pub fn protocol(&self) -> &'static str {
        PROTOCOL_NAME
    }

    /// Idempotently starts the connection: spawns the receiver worker, which will itself
    /// bootstrap the first donation cycle. `on_start` runs once the worker has been scheduled;
    /// `on_messages`/`on_error` are the upward callbacks the receiver/sender report through for
    /// the lifetime of the connection.
    ///
    /// Returns `Err` synchronously only if the connection is already closed — calling `start`
    /// after `close` is a programmer error in the source this crate follows.
    pub fn start(
        &self,
        on_messages: impl Fn(&[Arc<dyn Message>]) + Send + Sync + 'static,
        on_start: impl FnOnce() + Send + 'static,
        on_error: impl Fn(&Error) + Send + Sync + 'static,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::new_closed());
        }
        if self.started.swap(true, Ordering::SeqCst) {
            // Idempotent: already started.
            on_start();
            return Ok(());
        }

        *self.callbacks.lock().unwrap() = Some(Callbacks {
            on_messages: Box::new(on_messages),
            on_error: Box::new(on_error),
        });

        let conn = self.arc();
        let handle = self
            .exec
            .spawn(async move { receiver::run(conn).await });
        self.tasks.lock().unwrap().push(handle);

        tracing::debug!(id = %self.id, address = %self.address, "connection started");
        on_start();
        Ok(())
    }

    /// Enqueues `messages` for transmission. Safe to call from any task at any time. A no-op
    /// after `close`. Creates the outbound queue and spawns the sender worker if none is active.
    pub async fn send(&self, messages: Vec<Arc<dyn Message>>) {
        self.send_messages_impl(messages).await
    }

    /// The internal enqueue primitive shared by the public `send` and the receiver's kicker.
    pub(crate) async fn send_messages_impl(&self, messages: Vec<Arc<dyn Message>>) {
        let mut guard = self.monitor.lock().await;
        if guard.closed {
            return;
        }
        let spawn_needed = guard.queue.is_none();
        let queue = guard.queue.get_or_insert_with(VecDeque::new);
        queue.extend(messages);
        drop(guard);

        if spawn_needed {
            self.spawn_sender();
        }
        self.monitor.wake_all();
    }

    pub(crate) fn spawn_sender(&self) {
        let conn = self.arc();
        let handle = self.exec.spawn(async move { sender::run(conn).await });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Inserts `(seq, message)` into the reorder buffer and drains the contiguous prefix that
    /// begins at the current inbound cursor, in order. Returns `Err` if `seq` duplicates or
    /// precedes the current cursor.
    pub(crate) fn reorder_and_drain(
        &self,
        arrivals: Vec<(u64, Arc<dyn Message>)>,
    ) -> Result<Vec<Arc<dyn Message>>> {
        let mut inbound = self.inbound.lock().unwrap();
        for (seq, message) in arrivals {
            if seq < inbound.in_seq || inbound.reorder.contains_key(&seq) {
                return Err(Error::new_sequence(inbound.in_seq, seq));
            }
            inbound.reorder.insert(seq, message);
        }

        let mut delivered = Vec::new();
        while let Some(message) = inbound.reorder.remove(&inbound.in_seq) {
            delivered.push(message);
            inbound.in_seq += 1;
        }
        Ok(delivered)
    }

    /// Invokes the upward `on_messages` callback, catching and logging any panic so it never
    /// propagates into worker control flow.
    pub(crate) fn deliver(&self, messages: &[Arc<dyn Message>]) {
        if messages.is_empty() {
            return;
        }
        let guard = self.callbacks.lock().unwrap();
        if let Some(callbacks) = guard.as_ref() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (callbacks.on_messages)(messages);
            }));
            if result.is_err() {
                tracing::error!(id = %self.id, "on_messages callback panicked");
            }
        }
    }

    /// Reports `err` through the upward `on_error` callback, catching and logging any panic.
    pub(crate) fn report_error(&self, err: &Error) {
        tracing::error!(id = %self.id, error = %err, "connection error");
        let guard = self.callbacks.lock().unwrap();
        if let Some(callbacks) = guard.as_ref() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (callbacks.on_error)(err);
            }));
            if result.is_err() {
                tracing::error!(id = %self.id, "on_error callback panicked");
            }
        }
    }

    /// Reports a fatal worker error and closes the connection, unless already closed.
    pub(crate) async fn fail(&self, err: Error) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.report_error(&err);
        self.close().await;
    }

    /// Marks the connection closed, wakes every task parked on the monitor, and aborts the
    /// worker tasks. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(id = %self.id, "closing connection");
        {
            let mut guard = self.monitor.lock().await;
            guard.closed = true;
        }
        self.monitor.wake_all();

        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        *self.callbacks.lock().unwrap() = None;
    }

    /// True once `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Exec {
    pub(crate) fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // `crate::rt::Executor` only exposes fire-and-forget `execute`, but the engine needs a
        // `JoinHandle` to abort workers on close; `tokio::spawn` gives us both for the shipped
        // default, so we bypass the trait object here rather than widen `Executor`'s contract
        // for every embedder.
        tokio::spawn(fut)
    }
}

//! Connection pool manager.
//!
//! Owns the live connections, the request queue and the reconnection
//! supervisors, and exposes the administrative broadcasts.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                ConnectionPool                 │
//! │                                               │
//! │  push_request ──► RequestQueue ◄── idle conns │
//! │                        │                      │
//! │                        ▼ pairing              │
//! │   members: conn-1 (busy)  conn-2 (idle) ...   │
//! │                                               │
//! │   supervisor × pool_size: connect → handshake │
//! │      → serve → backoff → reconnect            │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! # Request Flow
//!
//! 1. `push_request` registers the caller and enqueues the work item
//! 2. The next idle member takes it and runs the remote call
//! 3. On success the caller is resolved
//! 4. On failure the error is classified: retry at the queue tail, or
//!    resolve the caller with the error
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `queue` | FIFO, idle waiters, pending set, retry classifier |
//! | `backoff` | Reconnection delay |
//! | `response` | Caller-side result handle |

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::{Credentials, PoolConfig};
use crate::connection::{
    ConnectionEvents, ConnectionHandler, Handshake, HandshakeSettings, HandshakeStep,
};
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::Request;
use crate::transport::Connector;
use crate::version::ApiVersion;

// ============================================================================
// Submodules
// ============================================================================

/// Reconnection delay.
pub mod backoff;

/// Request queue and retry classification.
mod queue;

/// Caller-side result handle.
pub mod response;

// ============================================================================
// Re-exports
// ============================================================================

pub use backoff::Backoff;
pub use response::PendingResponse;

use queue::{Outcome, Pairing, QueuedRequest, RequestQueue};

// ============================================================================
// PoolState
// ============================================================================

/// Everything guarded by the pool lock.
#[derive(Debug, Default)]
struct PoolState {
    /// Connections that completed the handshake and have not gone away.
    members: FxHashMap<ConnectionId, Arc<ConnectionHandler>>,
    /// Work, idle waiters and pending callers.
    queue: RequestQueue,
}

// ============================================================================
// ConnectionPool
// ============================================================================

/// Pool of managed connections with a shared request queue.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use rpc_pool::{ConnectionPool, PoolConfig, WsConnector};
/// use serde_json::json;
///
/// let connector = Arc::new(WsConnector::new("ws://127.0.0.1:9160")?);
/// let config = PoolConfig::new().with_namespace("users").with_retries(2).with_pool_size(4);
/// let pool = ConnectionPool::connect(config, connector).await?;
///
/// let row = pool.call("get", vec![json!("alice")]).await?;
/// pool.shutdown();
/// ```
pub struct ConnectionPool {
    /// Weak self-reference handed to handlers and completion tasks.
    me: Weak<ConnectionPool>,

    /// Validated configuration.
    config: PoolConfig,

    /// Local API version to check, if checking is enabled.
    check_api_version: Option<ApiVersion>,

    /// Setup strategy for new connections.
    handshake: RwLock<Handshake>,

    /// Namespace selected on new connections.
    namespace: RwLock<Option<String>>,

    /// Members and queue.
    state: Mutex<PoolState>,

    /// First-outcome readiness signal.
    ready_tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
    ready_rx: Mutex<Option<oneshot::Receiver<Result<()>>>>,

    /// Shutdown flag.
    shutdown: AtomicBool,

    /// Wakes sleeping supervisors on shutdown.
    shutdown_notify: Notify,
}

// ============================================================================
// ConnectionPool - Constructor
// ============================================================================

impl ConnectionPool {
    /// Creates an empty pool without opening any connection.
    ///
    /// Connections join through [`ConnectionEvents`]; see [`start`](Self::start)
    /// for the self-managing variant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration does not validate.
    pub fn new(config: PoolConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let check_api_version = if config.check_api_version {
            Some(config.local_api_version()?)
        } else {
            None
        };
        let handshake = Handshake::from_credentials(config.credentials.clone());
        let namespace = config.namespace.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            check_api_version,
            handshake: RwLock::new(handshake),
            namespace: RwLock::new(namespace),
            state: Mutex::new(PoolState::default()),
            ready_tx: Mutex::new(Some(ready_tx)),
            ready_rx: Mutex::new(Some(ready_rx)),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        }))
    }

    /// Creates a pool and spawns one reconnecting supervisor per slot.
    ///
    /// Returns immediately; use [`wait_ready`](Self::wait_ready) to wait for
    /// the first connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration does not validate.
    pub fn start(config: PoolConfig, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        let pool = Self::new(config)?;

        for slot in 0..pool.config.pool_size {
            tokio::spawn(Arc::clone(&pool).supervise(Arc::clone(&connector), slot));
        }

        info!(
            pool_size = pool.config.pool_size,
            retries = pool.config.retries,
            authenticated = matches!(*pool.handshake.read(), Handshake::Authenticated(_)),
            "ConnectionPool started"
        );

        Ok(pool)
    }

    /// Starts a pool and waits until it is ready.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the configuration does not validate
    /// - The first connect or setup failure, if it happens before any
    ///   connection is established
    pub async fn connect(config: PoolConfig, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        let pool = Self::start(config, connector)?;

        if let Err(e) = pool.wait_ready().await {
            pool.shutdown();
            return Err(e);
        }

        Ok(pool)
    }
}

// ============================================================================
// ConnectionPool - Public API
// ============================================================================

impl ConnectionPool {
    /// Waits for the first lifecycle outcome.
    ///
    /// Succeeds when a connection is established. Fails with the first
    /// connect or setup error if that comes first.
    ///
    /// # Errors
    ///
    /// - [`Error::Setup`] / [`Error::Connection`] etc. from the first failure
    /// - [`Error::Config`] if readiness was already awaited
    pub async fn wait_ready(&self) -> Result<()> {
        let rx = self
            .ready_rx
            .lock()
            .take()
            .ok_or_else(|| Error::config("Pool readiness was already awaited"))?;

        rx.await?
    }

    /// Queues a remote call with the pool's default retry budget.
    ///
    /// Never blocks; the returned handle resolves exactly once.
    pub fn push_request(&self, method: impl Into<String>, params: Vec<Value>) -> PendingResponse {
        self.push_request_with_retries(method, params, self.config.retries)
    }

    /// Queues a remote call with an explicit retry budget.
    ///
    /// The call is attempted at most `retries + 1` times.
    pub fn push_request_with_retries(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
        retries: u32,
    ) -> PendingResponse {
        let request = Request::new(method, params);
        let request_id = request.id;
        let (tx, rx) = oneshot::channel();

        // Shutdown sets the flag and drains the pending set under this lock.
        let mut state = self.state.lock();
        if self.is_shutdown() {
            drop(state);
            let _ = tx.send(Err(Error::Shutdown));
            return PendingResponse::new(request_id, rx);
        }

        trace!(%request_id, method = %request.method, retries, "Request queued");

        state.queue.register(request_id, tx);
        let next = state.queue.put(QueuedRequest::new(request, retries));
        self.feed(&mut state, next);

        PendingResponse::new(request_id, rx)
    }

    /// Queues a remote call and waits for its outcome.
    ///
    /// # Errors
    ///
    /// The classified failure of the final attempt, or [`Error::Shutdown`].
    pub async fn call(&self, method: impl Into<String>, params: Vec<Value>) -> Result<Value> {
        self.push_request(method, params).await
    }

    /// Switches every connection, current and future, to `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Broadcast`] if any current connection fails; the
    /// others still switch.
    pub async fn set_namespace(&self, namespace: impl Into<String>) -> Result<()> {
        let namespace = namespace.into();
        *self.namespace.write() = Some(namespace.clone());

        let members = self.members_snapshot();
        info!(namespace = %namespace, connections = members.len(), "Switching namespace");

        let results = join_all(members.iter().map(|h| h.select_namespace(&namespace))).await;
        Self::aggregate("set_namespace", results)
    }

    /// Logs in again on every connection; future connections use
    /// `credentials` too.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Broadcast`] if any current connection fails.
    pub async fn reauthenticate(&self, credentials: Credentials) -> Result<()> {
        *self.handshake.write() = Handshake::Authenticated(credentials.clone());

        let members = self.members_snapshot();
        info!(connections = members.len(), "Re-authenticating connections");

        let results = join_all(members.iter().map(|h| h.login(&credentials))).await;
        Self::aggregate("reauthenticate", results)
    }

    /// Stops reconnecting, closes every connection and fails every
    /// unresolved request with [`Error::Shutdown`].
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        let (members, pending) = {
            let mut state = self.state.lock();
            if self.shutdown.swap(true, Ordering::SeqCst) {
                debug!("ConnectionPool already shut down");
                return;
            }

            let members: Vec<_> = state.members.drain().map(|(_, h)| h).collect();
            (members, state.queue.drain())
        };

        info!("ConnectionPool shutting down");
        self.shutdown_notify.notify_waiters();

        for handler in &members {
            handler.abort();
        }

        let failed = pending.len();
        for tx in pending {
            let _ = tx.send(Err(Error::Shutdown));
        }

        self.signal_ready(Err(Error::Shutdown));

        info!(
            connections = members.len(),
            failed_requests = failed,
            "ConnectionPool shutdown complete"
        );
    }

    /// Returns the number of established connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.lock().members.len()
    }

    /// Returns the number of requests waiting for a connection.
    #[inline]
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Returns the number of idle connections waiting for work.
    #[inline]
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.state.lock().queue.waiting()
    }

    /// Returns the number of unresolved requests.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().queue.pending_count()
    }

    /// Returns the namespace new connections select.
    #[inline]
    #[must_use]
    pub fn namespace(&self) -> Option<String> {
        self.namespace.read().clone()
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) was called.
    #[inline]
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Returns the pool configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

// ============================================================================
// ConnectionPool - Dispatch
// ============================================================================

impl ConnectionPool {
    /// Runs pairings until none is left.
    ///
    /// A pairing whose connection is no longer a member goes back to the
    /// queue tail untouched.
    fn feed(&self, state: &mut PoolState, mut next: Option<Pairing>) {
        while let Some((connection_id, item)) = next.take() {
            let Some(handler) = state.members.get(&connection_id).cloned() else {
                debug!(
                    %connection_id,
                    request_id = %item.request.id,
                    "Matched connection left the pool, requeueing"
                );
                next = state.queue.put(item);
                continue;
            };

            next = self.dispatch(state, &handler, item);
        }
    }

    /// Hands `item` to `handler`.
    ///
    /// A synchronous submit failure aborts the connection and counts as a
    /// failed attempt.
    fn dispatch(
        &self,
        state: &mut PoolState,
        handler: &Arc<ConnectionHandler>,
        item: QueuedRequest,
    ) -> Option<Pairing> {
        trace!(
            connection_id = %handler.id(),
            request_id = %item.request.id,
            retries_left = item.retries_left,
            "Dispatching request"
        );

        match handler.submit(Arc::clone(&item.request)) {
            Ok(call) => {
                let pool = self.me.clone();
                tokio::spawn(async move {
                    let result = call.await;
                    if let Some(pool) = pool.upgrade() {
                        pool.finish(item, result);
                    }
                });
                None
            }
            Err(e) => {
                warn!(
                    connection_id = %handler.id(),
                    request_id = %item.request.id,
                    error = %e,
                    "Submit failed, aborting connection"
                );
                handler.abort();
                self.settle(state, item, Err(e))
            }
        }
    }

    /// Completion path for a dispatched request.
    fn finish(&self, item: QueuedRequest, result: Result<Value>) {
        let mut state = self.state.lock();
        let next = self.settle(&mut state, item, result);
        self.feed(&mut state, next);
    }

    /// Resolves the caller or requeues for retry.
    fn settle(
        &self,
        state: &mut PoolState,
        item: QueuedRequest,
        result: Result<Value>,
    ) -> Option<Pairing> {
        let request_id = item.request.id;

        let error = match result {
            Ok(value) => {
                trace!(%request_id, "Request succeeded");
                state.queue.resolve(request_id, Ok(value));
                return None;
            }
            Err(error) => error,
        };

        match item.classify_failure(error) {
            Outcome::Retry(item) => {
                debug!(
                    %request_id,
                    retries_left = item.retries_left,
                    "Request failed, retrying"
                );
                state.queue.put(item)
            }
            Outcome::Fail(error) => {
                debug!(%request_id, error = %error, "Request failed");
                state.queue.resolve(request_id, Err(error));
                None
            }
        }
    }
}

// ============================================================================
// ConnectionPool - Lifecycle Events
// ============================================================================

impl ConnectionEvents for ConnectionPool {
    fn connection_established(&self, handler: Arc<ConnectionHandler>) {
        let connection_id = handler.id();
        let members = {
            let mut state = self.state.lock();
            if self.is_shutdown() {
                drop(state);
                debug!(%connection_id, "Connection established after shutdown");
                handler.abort();
                return;
            }

            state.members.insert(connection_id, handler);
            let next = state.queue.wait(connection_id);
            self.feed(&mut state, next);
            state.members.len()
        };

        info!(%connection_id, members, "Connection joined pool");
        self.signal_ready(Ok(()));
    }

    fn connection_idle(&self, handler: &ConnectionHandler) {
        let connection_id = handler.id();
        let mut state = self.state.lock();

        if !state.members.contains_key(&connection_id) {
            trace!(%connection_id, "Idle report from non-member ignored");
            return;
        }

        let next = state.queue.wait(connection_id);
        self.feed(&mut state, next);
    }

    fn setup_failed(&self, connection_id: ConnectionId, reason: Error) {
        warn!(%connection_id, error = %reason, "Connection discarded after setup failure");
        self.signal_ready(Err(reason));
    }

    fn connection_gone(&self, connection_id: ConnectionId, reason: Option<Error>) {
        let removed = {
            let mut state = self.state.lock();
            state.queue.forget(connection_id);
            state.members.remove(&connection_id).is_some()
        };

        match (removed, reason) {
            (true, Some(reason)) => {
                warn!(%connection_id, error = %reason, "Connection left pool unexpectedly");
            }
            (true, None) => debug!(%connection_id, "Connection left pool"),
            (false, _) => trace!(%connection_id, "Gone report for non-member"),
        }
    }
}

// ============================================================================
// ConnectionPool - Supervision
// ============================================================================

impl ConnectionPool {
    /// Keeps one pool slot connected until shutdown.
    async fn supervise(self: Arc<Self>, connector: Arc<dyn Connector>, slot: usize) {
        let mut backoff = Backoff::from_config(&self.config);
        debug!(slot, "Connection supervisor started");

        while !self.is_shutdown() {
            match connector.connect().await {
                Ok(client) => {
                    backoff.reset();

                    if self.is_shutdown() {
                        client.close();
                        break;
                    }

                    let handler = ConnectionHandler::new(client, self.events());
                    debug!(slot, connection_id = %handler.id(), "Transport connected");
                    handler.serve(&self.handshake_steps()).await;
                }
                Err(e) => {
                    warn!(slot, error = %e, "Connect failed");
                    self.signal_ready(Err(e));
                }
            }

            let delay = backoff.next_delay();
            debug!(slot, ?delay, "Reconnecting after delay");
            if !self.sleep_unless_shutdown(delay).await {
                break;
            }
        }

        debug!(slot, "Connection supervisor stopped");
    }

    /// Sleeps for `delay`; returns `false` if shutdown interrupted it.
    async fn sleep_unless_shutdown(&self, delay: Duration) -> bool {
        let notified = self.shutdown_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_shutdown() {
            return false;
        }

        tokio::select! {
            _ = &mut notified => false,
            _ = tokio::time::sleep(delay) => !self.is_shutdown(),
        }
    }

    /// Builds the handshake for a new connection from current settings.
    fn handshake_steps(&self) -> Vec<HandshakeStep> {
        let settings = HandshakeSettings {
            check_api_version: self.check_api_version,
            namespace: self.namespace.read().clone(),
        };
        self.handshake.read().steps(&settings)
    }

    /// Listener handle for handlers owned by this pool.
    pub(crate) fn events(&self) -> Weak<dyn ConnectionEvents> {
        self.me.clone()
    }

    fn members_snapshot(&self) -> Vec<Arc<ConnectionHandler>> {
        self.state.lock().members.values().cloned().collect()
    }

    /// Fires the readiness signal if nobody fired it yet.
    fn signal_ready(&self, outcome: Result<()>) {
        if let Some(tx) = self.ready_tx.lock().take() {
            let _ = tx.send(outcome);
        }
    }

    fn aggregate(operation: &str, results: Vec<Result<()>>) -> Result<()> {
        let total = results.len();
        let mut failed = 0;
        let mut first = None;

        for result in results {
            if let Err(e) = result {
                failed += 1;
                first.get_or_insert(e);
            }
        }

        match first {
            None => Ok(()),
            Some(source) => {
                warn!(operation, failed, total, error = %source, "Broadcast failed");
                Err(Error::broadcast(failed, total, source))
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Per-connection lifecycle.
//!
//! A [`ConnectionHandler`] wraps one physical connection. It runs the
//! handshake, carries at most one pool request at a time, and reports every
//! lifecycle change to its owner through [`ConnectionEvents`].
//!
//! # State Machine
//!
//! ```text
//! Connecting ─► Handshaking ─► Idle ⇄ Busy
//!                    │           │     │
//!                    ▼           ▼     ▼
//!               SetupFailed ───► Gone ◄┘
//! ```
//!
//! `Gone` is terminal. A reconnect creates a new handler.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `handshake` | Setup strategies and ordered setup steps |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, RequestId};
use crate::protocol::Request;
use crate::transport::RpcClient;

// ============================================================================
// Submodules
// ============================================================================

/// Connection setup strategies.
pub mod handshake;

// ============================================================================
// Re-exports
// ============================================================================

pub use handshake::{Handshake, HandshakeSettings, HandshakeStep};

// ============================================================================
// ConnectionState
// ============================================================================

/// Availability of a connection handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, handshake not started.
    Connecting,
    /// Running the handshake.
    Handshaking,
    /// Ready for one request.
    Idle,
    /// Carrying the given request.
    Busy(RequestId),
    /// Handshake failed; transport closing.
    SetupFailed,
    /// Transport closed.
    Gone,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Handshaking => f.write_str("handshaking"),
            Self::Idle => f.write_str("idle"),
            Self::Busy(id) => write!(f, "busy({id})"),
            Self::SetupFailed => f.write_str("setup-failed"),
            Self::Gone => f.write_str("gone"),
        }
    }
}

// ============================================================================
// ConnectionEvents
// ============================================================================

/// Receives lifecycle notifications from handlers.
///
/// Implemented by the pool. Callbacks run on the handler's task and must not
/// block.
pub trait ConnectionEvents: Send + Sync {
    /// Handshake succeeded; the handler is idle.
    fn connection_established(&self, handler: Arc<ConnectionHandler>);

    /// A request finished, successfully or not; the handler is idle again.
    fn connection_idle(&self, handler: &ConnectionHandler);

    /// Handshake failed; the handler never joined.
    fn setup_failed(&self, connection_id: ConnectionId, reason: Error);

    /// Transport closed. `reason` is `None` after an [`abort`].
    ///
    /// [`abort`]: ConnectionHandler::abort
    fn connection_gone(&self, connection_id: ConnectionId, reason: Option<Error>);
}

// ============================================================================
// CallHandle
// ============================================================================

/// Resolves with the outcome of one submitted request.
#[derive(Debug)]
pub struct CallHandle {
    rx: oneshot::Receiver<Result<Value>>,
}

impl Future for CallHandle {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        })
    }
}

// ============================================================================
// ConnectionHandler
// ============================================================================

/// Wraps one physical connection.
pub struct ConnectionHandler {
    /// Unique per physical connection.
    id: ConnectionId,
    /// Transport/stub for this connection.
    client: Arc<dyn RpcClient>,
    /// Lifecycle listener (the pool).
    events: Weak<dyn ConnectionEvents>,
    /// Current state; `Busy` doubles as the in-flight slot.
    state: Mutex<ConnectionState>,
    /// Set by [`abort`](Self::abort).
    aborted: AtomicBool,
    /// Namespace last selected on this connection.
    namespace: Mutex<Option<String>>,
}

impl fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ConnectionHandler - Constructor / Accessors
// ============================================================================

impl ConnectionHandler {
    /// Creates a handler for a freshly opened connection.
    #[must_use]
    pub fn new(client: Arc<dyn RpcClient>, events: Weak<dyn ConnectionEvents>) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            client,
            events,
            state: Mutex::new(ConnectionState::Connecting),
            aborted: AtomicBool::new(false),
            namespace: Mutex::new(None),
        })
    }

    /// Returns the connection ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Returns `true` once [`abort`](Self::abort) was called.
    #[inline]
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Returns the namespace last selected on this connection.
    #[inline]
    #[must_use]
    pub fn namespace(&self) -> Option<String> {
        self.namespace.lock().clone()
    }

    /// Returns `true` while the transport is open.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }
}

// ============================================================================
// ConnectionHandler - Lifecycle
// ============================================================================

impl ConnectionHandler {
    /// Runs the whole life of the connection: handshake, then wait for close.
    pub async fn serve(self: &Arc<Self>, steps: &[HandshakeStep]) {
        self.connection_made(steps).await;
        let reason = self.client.closed().await;
        self.connection_lost(reason);
    }

    /// Runs the handshake and reports the outcome.
    ///
    /// On success the handler becomes `Idle` and is handed to
    /// [`ConnectionEvents::connection_established`]. On failure the transport
    /// is closed and [`ConnectionEvents::setup_failed`] receives the error.
    pub async fn connection_made(self: &Arc<Self>, steps: &[HandshakeStep]) {
        self.set_state(ConnectionState::Handshaking);
        debug!(connection_id = %self.id, steps = steps.len(), "Handshake started");

        let outcome = handshake::run(self.id, self.client.as_ref(), steps).await;

        let Some(events) = self.events.upgrade() else {
            debug!(connection_id = %self.id, "Pool dropped during handshake");
            self.client.close();
            return;
        };

        match outcome {
            Ok(()) => {
                if let Some(namespace) = steps.iter().rev().find_map(|step| match step {
                    HandshakeStep::SelectNamespace(namespace) => Some(namespace.clone()),
                    _ => None,
                }) {
                    *self.namespace.lock() = Some(namespace);
                }

                self.set_state(ConnectionState::Idle);
                info!(connection_id = %self.id, "Connection ready");
                events.connection_established(Arc::clone(self));
            }
            Err(e) => {
                self.set_state(ConnectionState::SetupFailed);
                warn!(connection_id = %self.id, error = %e, "Connection setup failed");
                self.client.close();
                events.setup_failed(self.id, Error::setup(e));
            }
        }
    }

    /// Records the transport closing and notifies the owner.
    ///
    /// After an abort the reason is swallowed; otherwise it is passed on so
    /// unexpected closes stay visible.
    pub fn connection_lost(&self, reason: Error) {
        let previous = std::mem::replace(&mut *self.state.lock(), ConnectionState::Gone);

        let reason = if self.is_aborted() {
            debug!(connection_id = %self.id, %previous, "Aborted connection closed");
            None
        } else {
            warn!(connection_id = %self.id, %previous, error = %reason, "Connection lost");
            Some(reason)
        };

        if let Some(events) = self.events.upgrade() {
            events.connection_gone(self.id, reason);
        }
    }

    /// Marks the handler aborted and closes the transport.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        debug!(connection_id = %self.id, "Aborting connection");
        self.client.close();
    }

    fn set_state(&self, state: ConnectionState) {
        let mut guard = self.state.lock();
        if *guard != ConnectionState::Gone {
            *guard = state;
        }
    }
}

// ============================================================================
// ConnectionHandler - Requests
// ============================================================================

impl ConnectionHandler {
    /// Dispatches `request` if the handler is idle.
    ///
    /// The returned handle resolves with the remote outcome. Whatever that
    /// outcome, the handler reports itself idle first.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidMethod`] if the transport cannot express the method
    /// - [`Error::Busy`] if a request is already in flight
    /// - [`Error::ConnectionClosed`] if the handler is not in service
    pub fn submit(self: &Arc<Self>, request: Arc<Request>) -> Result<CallHandle> {
        if !self.client.supports(&request.method) {
            return Err(Error::invalid_method(request.method.clone()));
        }

        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Idle => *state = ConnectionState::Busy(request.id),
                ConnectionState::Busy(_) => return Err(Error::Busy),
                _ => return Err(Error::ConnectionClosed),
            }
        }

        trace!(connection_id = %self.id, request_id = %request.id, method = %request.method, "Request submitted");

        let (tx, rx) = oneshot::channel();
        let handler = Arc::clone(self);

        tokio::spawn(async move {
            let result = handler
                .client
                .call(&request.method, request.params.clone())
                .await;
            handler.complete();
            let _ = tx.send(result);
        });

        Ok(CallHandle { rx })
    }

    /// Clears the in-flight slot and reports idle.
    fn complete(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ConnectionState::Busy(_)) {
                *state = ConnectionState::Idle;
            }
        }

        if let Some(events) = self.events.upgrade() {
            events.connection_idle(self);
        }
    }

    /// Selects `namespace` on this connection outside the request slot.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the handler already left service
    /// - Whatever the server returns for the selection
    pub async fn select_namespace(&self, namespace: &str) -> Result<()> {
        self.ensure_in_service()?;
        self.client.set_namespace(namespace).await?;
        *self.namespace.lock() = Some(namespace.to_string());
        debug!(connection_id = %self.id, namespace, "Namespace selected");
        Ok(())
    }

    /// Logs in again on this connection outside the request slot.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the handler already left service
    /// - Whatever the server returns for the login
    pub async fn login(&self, credentials: &Credentials) -> Result<()> {
        self.ensure_in_service()?;
        self.client.login(credentials).await?;
        debug!(connection_id = %self.id, "Re-authenticated");
        Ok(())
    }

    fn ensure_in_service(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Idle | ConnectionState::Busy(_) if !self.is_aborted() => Ok(()),
            _ => Err(Error::ConnectionClosed),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

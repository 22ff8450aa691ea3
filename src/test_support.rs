//! Scripted collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use crate::config::Credentials;
use crate::connection::{ConnectionEvents, ConnectionHandler};
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::transport::{Connector, RpcClient, is_valid_method_name};

// ============================================================================
// MockClient
// ============================================================================

/// One scripted reply to `call`.
pub enum Reply {
    Value(Value),
    Fail(fn() -> Error),
}

/// In-memory [`RpcClient`] with scripted replies.
pub struct MockClient {
    version: String,
    login_fails: bool,
    namespace_fails: bool,
    replies: Mutex<VecDeque<Reply>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    methods: Mutex<Vec<String>>,
    namespace: Mutex<Option<String>>,
    calls: AtomicUsize,
    logins: AtomicUsize,
    closed_tx: watch::Sender<bool>,
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            version: crate::version::API_VERSION.to_string(),
            login_fails: false,
            namespace_fails: false,
            replies: Mutex::new(VecDeque::new()),
            gate: Mutex::new(None),
            methods: Mutex::new(Vec::new()),
            namespace: Mutex::new(None),
            calls: AtomicUsize::new(0),
            logins: AtomicUsize::new(0),
            closed_tx: watch::channel(false).0,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn failing_login(mut self) -> Self {
        self.login_fails = true;
        self
    }

    pub fn failing_namespace(mut self) -> Self {
        self.namespace_fails = true;
        self
    }

    pub fn with_replies(self, replies: Vec<Reply>) -> Self {
        self.replies.lock().extend(replies);
        self
    }

    /// Holds the next call until the returned sender fires or drops.
    pub fn gated(self) -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock() = Some(rx);
        (self, tx)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().clone()
    }

    pub fn namespace(&self) -> Option<String> {
        self.namespace.lock().clone()
    }
}

#[async_trait]
impl RpcClient for MockClient {
    fn supports(&self, method: &str) -> bool {
        is_valid_method_name(method)
    }

    async fn call(&self, method: &str, _params: Vec<Value>) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.methods.lock().push(method.to_string());

        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }

        let reply = self.replies.lock().pop_front();
        match reply {
            Some(Reply::Value(value)) => Ok(value),
            Some(Reply::Fail(make)) => Err(make()),
            None => Ok(Value::String(method.to_string())),
        }
    }

    async fn login(&self, _credentials: &Credentials) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        self.logins.fetch_add(1, Ordering::SeqCst);
        if self.login_fails {
            return Err(Error::authentication("bad credentials"));
        }
        Ok(())
    }

    async fn describe_version(&self) -> Result<String> {
        Ok(self.version.clone())
    }

    async fn set_namespace(&self, namespace: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        if self.namespace_fails {
            return Err(Error::invalid_request(format!("unknown namespace {namespace}")));
        }
        *self.namespace.lock() = Some(namespace.to_string());
        Ok(())
    }

    fn close(&self) {
        self.closed_tx.send_replace(true);
    }

    fn is_connected(&self) -> bool {
        !*self.closed_tx.borrow()
    }

    async fn closed(&self) -> Error {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
        Error::ConnectionClosed
    }
}

// ============================================================================
// MockConnector
// ============================================================================

/// Hands out fresh [`MockClient`]s; the first `failures` attempts fail.
pub struct MockConnector {
    failures: AtomicUsize,
    attempts: AtomicUsize,
    clients: Mutex<Vec<Arc<MockClient>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::failing(0)
    }

    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn clients(&self) -> Vec<Arc<MockClient>> {
        self.clients.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn RpcClient>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::connection("connection refused"));
        }

        let client = Arc::new(MockClient::new());
        self.clients.lock().push(Arc::clone(&client));
        Ok(client)
    }
}

// ============================================================================
// RecordingEvents
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Established(ConnectionId),
    Idle(ConnectionId),
    SetupFailed(ConnectionId),
    Gone(ConnectionId, bool),
}

/// [`ConnectionEvents`] sink that only records.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<Event>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl ConnectionEvents for RecordingEvents {
    fn connection_established(&self, handler: Arc<ConnectionHandler>) {
        self.events.lock().push(Event::Established(handler.id()));
    }

    fn connection_idle(&self, handler: &ConnectionHandler) {
        self.events.lock().push(Event::Idle(handler.id()));
    }

    fn setup_failed(&self, connection_id: ConnectionId, _reason: Error) {
        self.events.lock().push(Event::SetupFailed(connection_id));
    }

    fn connection_gone(&self, connection_id: ConnectionId, reason: Option<Error>) {
        self.events
            .lock()
            .push(Event::Gone(connection_id, reason.is_some()));
    }
}

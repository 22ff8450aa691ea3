//! Request queue, idle-connection waiters and the pending set.
//!
//! The queue is the pool's single serialization point. Work items and idle
//! connections meet here: a new item goes to the longest-waiting idle
//! connection, an idle connection takes the oldest queued item, and
//! whichever side arrives first waits for the other.
//!
//! The pending set owns every caller's result sender. A request is delivered
//! by removing its sender, so a second delivery has nothing to send on.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, RequestId};
use crate::protocol::Request;

// ============================================================================
// Types
// ============================================================================

/// Sender half of a caller's result handle.
pub(crate) type ResultSender = oneshot::Sender<Result<Value>>;

/// A queued item matched to the connection that should run it.
pub(crate) type Pairing = (ConnectionId, QueuedRequest);

// ============================================================================
// QueuedRequest
// ============================================================================

/// One unit of work waiting for (or running on) a connection.
#[derive(Debug, Clone)]
pub(crate) struct QueuedRequest {
    /// Method, arguments and the id of the caller's handle.
    pub request: Arc<Request>,
    /// Attempts still allowed after the current one fails.
    pub retries_left: u32,
}

/// What to do with a failed attempt.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Put back at the tail with one fewer retry.
    Retry(QueuedRequest),
    /// Deliver this error to the caller.
    Fail(Error),
}

impl QueuedRequest {
    pub(crate) fn new(request: Request, retries: u32) -> Self {
        Self {
            request: Arc::new(request),
            retries_left: retries,
        }
    }

    /// Classifies a failed attempt.
    ///
    /// Non-retryable errors and an exhausted budget fail the request;
    /// anything else costs one retry.
    pub(crate) fn classify_failure(mut self, error: Error) -> Outcome {
        if !error.is_retryable() || self.retries_left == 0 {
            return Outcome::Fail(error);
        }

        self.retries_left -= 1;
        Outcome::Retry(self)
    }
}

// ============================================================================
// RequestQueue
// ============================================================================

/// FIFO of work, FIFO of idle connections, and the pending set.
///
/// At most one of `items` and `waiters` is non-empty at a time.
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    items: VecDeque<QueuedRequest>,
    waiters: VecDeque<ConnectionId>,
    pending: FxHashMap<RequestId, ResultSender>,
}

impl RequestQueue {
    /// Adds a caller to the pending set.
    pub(crate) fn register(&mut self, id: RequestId, tx: ResultSender) {
        self.pending.insert(id, tx);
    }

    /// Returns `true` if `id` has not been delivered yet.
    pub(crate) fn is_pending(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    /// Delivers `result` to the caller and drops it from the pending set.
    ///
    /// Returns `false` if the request was already resolved.
    pub(crate) fn resolve(&mut self, id: RequestId, result: Result<Value>) -> bool {
        match self.pending.remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Enqueues `item`, or pairs it with the oldest idle connection.
    ///
    /// Items whose caller was already resolved are dropped.
    pub(crate) fn put(&mut self, item: QueuedRequest) -> Option<Pairing> {
        if !self.is_pending(&item.request.id) {
            return None;
        }

        match self.waiters.pop_front() {
            Some(connection_id) => Some((connection_id, item)),
            None => {
                self.items.push_back(item);
                None
            }
        }
    }

    /// Registers `connection_id` as idle, or pairs it with the oldest item.
    ///
    /// A connection already waiting is not added twice.
    pub(crate) fn wait(&mut self, connection_id: ConnectionId) -> Option<Pairing> {
        match self.items.pop_front() {
            Some(item) => Some((connection_id, item)),
            None => {
                if !self.waiters.contains(&connection_id) {
                    self.waiters.push_back(connection_id);
                }
                None
            }
        }
    }

    /// Drops `connection_id` from the idle waiters.
    pub(crate) fn forget(&mut self, connection_id: ConnectionId) {
        self.waiters.retain(|waiting| *waiting != connection_id);
    }

    /// Number of queued items.
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Number of idle connections waiting for work.
    pub(crate) fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Number of unresolved callers.
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drops all queued items and waiters, returning every pending sender.
    pub(crate) fn drain(&mut self) -> Vec<ResultSender> {
        self.items.clear();
        self.waiters.clear();
        self.pending.drain().map(|(_, tx)| tx).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Pending-request table
//!
//! Maps correlation ids to one-shot waiters. An entry resolves at most once;
//! after `close` every waiter is dropped and later acknowledgments are ignored.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::message::RequestId;

#[derive(Default)]
struct Table {
    waiters: HashMap<RequestId, oneshot::Sender<Value>>,
    closed: bool,
}

#[derive(Default)]
pub struct PendingRequests {
    next_id: AtomicU64,
    table: Mutex<Table>,
}

impl PendingRequests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a correlation id and its waiter. `None` once the table is closed.
    pub fn register(&self) -> Option<(RequestId, oneshot::Receiver<Value>)> {
        let mut table = self.table.lock();
        if table.closed {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        table.waiters.insert(id, tx);
        trace!(request_id = id, "Registered pending request");
        Some((id, rx))
    }

    /// Deliver an acknowledgment. Returns whether a waiter received it.
    pub fn resolve(&self, id: RequestId, reply: Value) -> bool {
        let waiter = self.table.lock().waiters.remove(&id);
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                debug!(request_id = id, "Dropping acknowledgment with no pending request");
                false
            }
        }
    }

    /// Forget a request, e.g. after its timeout fired.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.table.lock().waiters.remove(&id).is_some()
    }

    /// Tie the entry for `id` to the lifetime of the returned guard.
    pub fn guard(&self, id: RequestId) -> PendingGuard<'_> {
        PendingGuard {
            pending: self,
            id: Some(id),
        }
    }

    /// Discard every waiter and refuse new registrations.
    pub fn close(&self) -> usize {
        let mut table = self.table.lock();
        table.closed = true;
        let dropped = table.waiters.len();
        table.waiters.clear();
        dropped
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().waiters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.table.lock().closed
    }
}

/// Cancels its entry when dropped, unless the waiter already got an answer.
///
/// A caller that gives up on a request (an outer timeout, a `select!` losing
/// branch) drops its future; the guard keeps the table from growing.
#[must_use]
pub struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: Option<RequestId>,
}

impl PendingGuard<'_> {
    /// The entry was resolved or dropped by the table itself.
    pub fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if self.pending.cancel(id) {
                trace!(request_id = id, "Abandoned pending request");
            }
        }
    }
}

//! Request id allocation and the table of in-flight requests.
//!
//! Every call registers a single-use slot under a fresh id before its
//! request is queued for the writer. The reader completes slots by id as
//! responses arrive, in whatever order the server answers. When the reader
//! stops, the table is closed and every remaining caller is released with a
//! transport error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::rpc::error::RpcError;
use crate::rpc::protocol::{RequestId, Response};

type SlotResult = Result<Response, RpcError>;

/// Lock a mutex, recovering the data if another thread panicked while
/// holding it. All guarded state here stays consistent between statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// IdAllocator
// =============================================================================

/// Monotonically increasing request id source, starting at 1.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicI64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    /// Generate the next request ID.
    pub fn next(&self) -> RequestId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// PendingTable
// =============================================================================

#[derive(Default)]
struct PendingState {
    slots: HashMap<RequestId, SyncSender<SlotResult>>,
    /// Set once the reader has stopped; no further registrations succeed.
    closed: Option<String>,
}

/// In-flight requests keyed by correlation id.
#[derive(Default)]
pub struct PendingTable {
    state: Arc<Mutex<PendingState>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new in-flight request and return the caller's half.
    ///
    /// # Errors
    ///
    /// - `RpcError::DuplicateRequestId` if `id` is already pending
    /// - `RpcError::Transport` if the table was closed by `fail_all`
    pub fn register(&self, id: RequestId, method: &str) -> Result<Ticket, RpcError> {
        let mut state = lock(&self.state);

        if let Some(reason) = &state.closed {
            return Err(RpcError::Transport(reason.clone()));
        }
        if state.slots.contains_key(&id) {
            return Err(RpcError::DuplicateRequestId(id));
        }

        let (tx, rx) = mpsc::sync_channel(1);
        state.slots.insert(id, tx);

        Ok(Ticket {
            id,
            method: method.to_string(),
            rx,
            table: Arc::downgrade(&self.state),
        })
    }

    /// Deliver a response to the caller waiting on its id.
    ///
    /// Returns `false` if no request with that id is pending.
    pub fn complete(&self, response: Response) -> bool {
        let slot = lock(&self.state).slots.remove(&response.id);

        match slot {
            Some(tx) => {
                // The caller may have dropped its ticket; that is not an error.
                if tx.send(Ok(response)).is_err() {
                    debug!("Response arrived for an abandoned ticket");
                }
                true
            }
            None => false,
        }
    }

    /// Resolve a single pending request with an error.
    pub fn fail(&self, id: RequestId, error: RpcError) -> bool {
        let slot = lock(&self.state).slots.remove(&id);

        match slot {
            Some(tx) => {
                let _ = tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Forget a pending request without delivering anything.
    ///
    /// The waiting ticket observes `RpcError::Closed`.
    pub fn cancel(&self, id: RequestId) -> bool {
        lock(&self.state).slots.remove(&id).is_some()
    }

    /// Release every pending caller with a transport error and refuse new
    /// registrations. Returns the number of callers released.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = {
            let mut state = lock(&self.state);
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
            state.slots.drain().collect()
        };

        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::Transport(reason.to_string())));
        }
        count
    }

    /// Number of requests awaiting a response.
    pub fn len(&self) -> usize {
        lock(&self.state).slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed.is_some()
    }
}

// =============================================================================
// Ticket
// =============================================================================

/// A call that has been sent but not yet awaited.
///
/// Dropping a ticket (including after a timed-out wait) abandons the call:
/// its slot leaves the table, and a response that still arrives is treated
/// as one for an unknown id.
#[derive(Debug)]
#[must_use = "a ticket does nothing unless waited on"]
pub struct Ticket {
    id: RequestId,
    method: String,
    rx: Receiver<SlotResult>,
    table: Weak<Mutex<PendingState>>,
}

impl Ticket {
    /// Correlation id of the underlying request.
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Block until the response arrives and return its result.
    ///
    /// # Errors
    ///
    /// - `RpcError::Server` if the server answered with an error
    /// - `RpcError::Transport` if the connection failed before the answer
    /// - `RpcError::Closed` if the request was withdrawn
    pub fn wait(self) -> Result<Value, RpcError> {
        match self.rx.recv() {
            Ok(result) => result?.into_result(),
            Err(_) => Err(RpcError::Closed),
        }
    }

    /// Like [`Ticket::wait`], giving up after `timeout`.
    ///
    /// The request itself cannot be retracted. On timeout the slot is
    /// released, so a late response is dropped by the reader.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Value, RpcError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result?.into_result(),
            Err(RecvTimeoutError::Timeout) => Err(RpcError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(RpcError::Closed),
        }
    }

    /// Await the response from async code without blocking a runtime worker.
    pub async fn wait_async(self) -> Result<Value, RpcError> {
        tokio::task::spawn_blocking(move || self.wait())
            .await
            .map_err(|e| RpcError::Transport(format!("Ticket wait task failed: {}", e)))?
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        // Answered slots are already gone; this only releases abandoned ones.
        if let Some(state) = self.table.upgrade() {
            if lock(&state).slots.remove(&self.id).is_some() {
                debug!("Released abandoned request {} ({})", self.id, self.method);
            }
        }
    }
}

//! Per-account event queues and the router loop that fills them.
//!
//! The server only hands out events as the result of a blocking
//! `get_next_event` call. The router thread issues that call back-to-back
//! through the normal dispatch path and appends each event to the FIFO of
//! the account it belongs to. Consumers block on one account's queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::rpc::error::RpcError;
use crate::rpc::pending::lock;
use crate::rpc::protocol::{AccountId, Event, EventEnvelope};

// =============================================================================
// Queues
// =============================================================================

/// Why the queues stopped accepting events.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum QueueClosed {
    /// The transport was closed by its owner.
    Shutdown,
    /// The router stopped because the connection failed.
    Failed(String),
}

impl QueueClosed {
    fn to_error(&self) -> RpcError {
        match self {
            QueueClosed::Shutdown => RpcError::Closed,
            QueueClosed::Failed(reason) => RpcError::Transport(reason.clone()),
        }
    }
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<Event>,
    closed: Option<QueueClosed>,
}

#[derive(Default)]
struct AccountQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

#[derive(Default)]
struct Registry {
    queues: HashMap<AccountId, Arc<AccountQueue>>,
    closed: Option<QueueClosed>,
}

/// FIFO event queues keyed by account id, created on first reference.
#[derive(Default)]
pub(crate) struct EventQueues {
    registry: Mutex<Registry>,
}

impl EventQueues {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn queue(&self, account_id: AccountId) -> Arc<AccountQueue> {
        let mut registry = lock(&self.registry);
        let closed = registry.closed.clone();
        let queue = registry.queues.entry(account_id).or_insert_with(|| {
            Arc::new(AccountQueue {
                state: Mutex::new(QueueState {
                    events: VecDeque::new(),
                    closed,
                }),
                ready: Condvar::new(),
            })
        });
        Arc::clone(queue)
    }

    /// Append an event to the account's queue and wake one consumer.
    pub(crate) fn push(&self, account_id: AccountId, event: Event) {
        let queue = self.queue(account_id);
        lock(&queue.state).events.push_back(event);
        queue.ready.notify_one();
    }

    /// Block until the account has an event.
    ///
    /// Events queued before the queues were closed are still delivered; an
    /// empty closed queue returns the close reason as an error.
    pub(crate) fn wait(&self, account_id: AccountId) -> Result<Event, RpcError> {
        let queue = self.queue(account_id);
        let mut state = lock(&queue.state);
        loop {
            if let Some(event) = state.events.pop_front() {
                return Ok(event);
            }
            if let Some(closed) = &state.closed {
                return Err(closed.to_error());
            }
            state = queue
                .ready
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Like `wait`, returning `Ok(None)` once `timeout` has elapsed.
    pub(crate) fn wait_timeout(
        &self,
        account_id: AccountId,
        timeout: Duration,
    ) -> Result<Option<Event>, RpcError> {
        let deadline = Instant::now() + timeout;
        let queue = self.queue(account_id);
        let mut state = lock(&queue.state);
        loop {
            if let Some(event) = state.events.pop_front() {
                return Ok(Some(event));
            }
            if let Some(closed) = &state.closed {
                return Err(closed.to_error());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            state = queue
                .ready
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Drop every queued event of one account. Returns how many were dropped.
    pub(crate) fn clear(&self, account_id: AccountId) -> usize {
        let queue = self.queue(account_id);
        let mut state = lock(&queue.state);
        let count = state.events.len();
        state.events.clear();
        count
    }

    /// Stop accepting waits on empty queues and wake every blocked consumer.
    /// The first close reason wins.
    pub(crate) fn close(&self, reason: QueueClosed) {
        let queues: Vec<_> = {
            let mut registry = lock(&self.registry);
            if registry.closed.is_none() {
                registry.closed = Some(reason.clone());
            }
            registry.queues.values().cloned().collect()
        };

        for queue in queues {
            let mut state = lock(&queue.state);
            if state.closed.is_none() {
                state.closed = Some(reason.clone());
            }
            drop(state);
            queue.ready.notify_all();
        }
    }
}

// =============================================================================
// Router
// =============================================================================

pub(crate) fn spawn_event_router<F>(
    fetch: F,
    queues: Arc<EventQueues>,
    closing: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnMut() -> Result<Value, RpcError> + Send + 'static,
{
    thread::Builder::new()
        .name("rpc-events".to_string())
        .spawn(move || route_events(fetch, &queues, &closing))
}

/// Poll for events until `closing` is set or the connection fails.
///
/// `closing` is only checked between round-trips: shutdown has to make the
/// outstanding `fetch` return (stop-I/O call or server exit) before this loop
/// can observe it.
pub(crate) fn route_events<F>(mut fetch: F, queues: &EventQueues, closing: &AtomicBool)
where
    F: FnMut() -> Result<Value, RpcError>,
{
    let closed = loop {
        if closing.load(Ordering::SeqCst) {
            break QueueClosed::Shutdown;
        }

        match fetch() {
            Ok(value) => match serde_json::from_value::<EventEnvelope>(value) {
                Ok(envelope) => {
                    debug!(
                        "account_id={} got an event {}",
                        envelope.context_id,
                        envelope.event.kind()
                    );
                    queues.push(envelope.context_id, envelope.event);
                }
                Err(e) => warn!("Skipping malformed event envelope: {}", e),
            },
            Err(_) if closing.load(Ordering::SeqCst) => break QueueClosed::Shutdown,
            Err(e) if e.is_transport() => {
                error!("Event router stopping: {}", e);
                break QueueClosed::Failed(e.to_string());
            }
            Err(e) => warn!("Event retrieval failed: {}", e),
        }
    };

    info!("Event router exiting");
    queues.close(closed);
}

//! Transport facade: call dispatch, event access, and lifecycle.
//!
//! # Threads
//!
//! ```text
//!  callers ──call()──► PendingTable.register ──► writer queue ──► [rpc-writer] ──► server stdin
//!     ▲                                                                              │
//!     └──── Ticket::wait ◄── PendingTable.complete ◄── [rpc-reader] ◄── server stdout ◄┘
//!
//!  [rpc-events]: loop { call(get_next_event) → per-account queue } ──► wait_for_event()
//! ```
//!
//! # Shutdown
//!
//! `close()` runs the steps below in order, each bounded by
//! `TransportOptions::shutdown_timeout`:
//!
//! 1. set the closing flag (the event router checks it between round-trips)
//! 2. best-effort stop-I/O call so the server answers the outstanding
//!    `get_next_event`
//! 3. join the event router
//! 4. close the server's stdin and reap the process (kill on timeout)
//! 5. join the reader, which sees EOF once the server is gone
//! 6. send the writer its sentinel and join it

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::rpc::config::{ServerConfig, TransportOptions};
use crate::rpc::error::RpcError;
use crate::rpc::events::{spawn_event_router, EventQueues, QueueClosed};
use crate::rpc::pending::{lock, IdAllocator, PendingTable, Ticket};
use crate::rpc::process::{spawn_server, ServerProcess};
use crate::rpc::protocol::{AccountId, Event, Request};
use crate::rpc::reader::spawn_reader;
use crate::rpc::writer::{spawn_writer, Outgoing, SharedInput};

/// Interval between `is_finished` polls while joining a worker thread.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of a [`Transport`]. Transitions are linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Worker threads are being started.
    Created,
    /// Calls and events flow.
    Started,
    /// `close()` is running.
    Closing,
    /// Everything has been torn down.
    Closed,
}

// =============================================================================
// Core (shared with the event router)
// =============================================================================

struct Core {
    ids: IdAllocator,
    pending: Arc<PendingTable>,
    outgoing: Sender<Outgoing>,
    events: Arc<EventQueues>,
    closing: Arc<AtomicBool>,
}

impl Core {
    /// Generic dispatch: allocate an id, register it, queue the request.
    fn submit(&self, method: &str, params: Vec<Value>) -> Result<Ticket, RpcError> {
        let id = self.ids.next();
        let ticket = self.pending.register(id, method)?;

        let request = Request::new(method, params, id);
        if self.outgoing.send(Outgoing::Request(request)).is_err() {
            // Writer is gone; nothing will ever answer this id.
            self.pending.cancel(id);
            return Err(RpcError::Closed);
        }

        Ok(ticket)
    }
}

#[derive(Default)]
struct Workers {
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    events: Option<JoinHandle<()>>,
}

// =============================================================================
// Transport
// =============================================================================

/// Client side of a line-delimited JSON-RPC 2.0 server running as a
/// subprocess (or any pair of byte streams).
///
/// `Transport` is `Send + Sync`; share it behind an `Arc` to issue calls
/// from many threads. Dropping it runs [`Transport::close`].
///
/// # Example
///
/// ```ignore
/// use rpc_transport::{ServerConfig, Transport};
/// use serde_json::json;
///
/// let transport = Transport::spawn(&ServerConfig::from_env())?;
/// let accounts = transport.call("get_all_account_ids", vec![])?;
///
/// // Send now, wait later
/// let ticket = transport.call_async("get_info", vec![json!(1)])?;
/// let info = ticket.wait()?;
///
/// let event = transport.wait_for_event(1)?;
/// println!("{}: {:?}", event.kind(), event.fields());
/// transport.close()?;
/// ```
pub struct Transport {
    core: Arc<Core>,
    input: SharedInput,
    process: Mutex<Option<ServerProcess>>,
    workers: Mutex<Workers>,
    state: Mutex<TransportState>,
    options: TransportOptions,
}

impl Transport {
    /// Spawn the RPC server described by `config` and start the transport.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Spawn` if the server cannot be launched, or
    /// `RpcError::Io` if a worker thread cannot be started.
    pub fn spawn(config: &ServerConfig) -> Result<Self, RpcError> {
        let server = spawn_server(config)?;
        Self::start(
            server.stdout,
            server.stdin,
            Some(server.process),
            config.transport.clone(),
        )
    }

    /// Start a transport over an already-connected pair of streams.
    ///
    /// `output` is what the server writes (its stdout), `input` is what it
    /// reads (its stdin). Closing the transport drops `input`, which the
    /// peer must treat as the signal to finish.
    pub fn from_streams<R, W>(output: R, input: W, options: TransportOptions) -> Result<Self, RpcError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::start(output, input, None, options)
    }

    fn start<R, W>(
        output: R,
        input: W,
        process: Option<ServerProcess>,
        options: TransportOptions,
    ) -> Result<Self, RpcError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (outgoing, queue) = mpsc::channel();
        let boxed: Box<dyn Write + Send> = Box::new(input);

        let core = Arc::new(Core {
            ids: IdAllocator::new(),
            pending: Arc::new(PendingTable::new()),
            outgoing,
            events: Arc::new(EventQueues::new()),
            closing: Arc::new(AtomicBool::new(false)),
        });

        // Build the facade first so a failed thread spawn still tears down
        // whatever was already started (via Drop).
        let transport = Self {
            core: Arc::clone(&core),
            input: Arc::new(Mutex::new(Some(boxed))),
            process: Mutex::new(process),
            workers: Mutex::new(Workers::default()),
            state: Mutex::new(TransportState::Created),
            options,
        };

        {
            let mut workers = lock(&transport.workers);
            workers.writer = Some(spawn_writer(
                queue,
                Arc::clone(&transport.input),
                Arc::clone(&core.pending),
            )?);
            workers.reader = Some(spawn_reader(output, Arc::clone(&core.pending))?);

            let router_core = Arc::clone(&core);
            let event_method = transport.options.event_method.clone();
            workers.events = Some(spawn_event_router(
                move || router_core.submit(&event_method, Vec::new())?.wait(),
                Arc::clone(&core.events),
                Arc::clone(&core.closing),
            )?);
        }

        *lock(&transport.state) = TransportState::Started;
        info!("RPC transport started");
        Ok(transport)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Send a request and block until its response arrives.
    ///
    /// Any method name is accepted; typed wrappers live above this layer.
    ///
    /// # Errors
    ///
    /// - `RpcError::Server` if the server answered with an error
    /// - `RpcError::Transport` if the server went away
    /// - `RpcError::Closed` if the transport is closing or closed
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result = transport.call("echo", vec![json!({"limit": 100})])?;
    /// ```
    pub fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.call_async(method, params)?.wait()
    }

    /// Send a request now and return a [`Ticket`] to wait on later.
    pub fn call_async(&self, method: &str, params: Vec<Value>) -> Result<Ticket, RpcError> {
        if self.core.closing.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        let ticket = self.core.submit(method, params)?;
        debug!("Queued {} (id {})", method, ticket.id());
        Ok(ticket)
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Block until the next event for `account_id` arrives.
    ///
    /// # Errors
    ///
    /// Once the transport is closed (or the event router stopped because the
    /// server went away) and the account's queue is empty, returns
    /// `RpcError::Closed` or `RpcError::Transport`.
    pub fn wait_for_event(&self, account_id: AccountId) -> Result<Event, RpcError> {
        self.core.events.wait(account_id)
    }

    /// Like [`Transport::wait_for_event`], returning `Ok(None)` after `timeout`.
    pub fn wait_for_event_timeout(
        &self,
        account_id: AccountId,
        timeout: Duration,
    ) -> Result<Option<Event>, RpcError> {
        self.core.events.wait_timeout(account_id, timeout)
    }

    /// Discard every queued event of `account_id`. Returns how many were dropped.
    pub fn clear_events(&self, account_id: AccountId) -> usize {
        self.core.events.clear(account_id)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn state(&self) -> TransportState {
        *lock(&self.state)
    }

    /// Number of calls sent and not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.core.pending.len()
    }

    /// Process id of the spawned server, if this transport owns one.
    pub fn server_pid(&self) -> Option<u32> {
        lock(&self.process).as_ref().map(ServerProcess::id)
    }

    /// Shut down the server and every worker thread. Idempotent.
    ///
    /// All steps run even if an earlier one times out; the first timeout is
    /// returned. Callers still blocked in `call`/`wait_for_event` are
    /// released with an error.
    pub fn close(&self) -> Result<(), RpcError> {
        let previous = {
            let mut state = lock(&self.state);
            let previous = *state;
            if matches!(previous, TransportState::Closing | TransportState::Closed) {
                return Ok(());
            }
            *state = TransportState::Closing;
            previous
        };

        info!("Closing RPC transport");
        let timeout = self.options.shutdown_timeout;
        let mut first_error: Option<RpcError> = None;
        let mut record = |error: RpcError| {
            warn!("{}", error);
            first_error.get_or_insert(error);
        };

        // 1. Stop the event router after its current round-trip.
        self.core.closing.store(true, Ordering::SeqCst);

        // 2. Ask the server to stop background I/O; it answers the
        //    outstanding get_next_event as a consequence.
        if previous == TransportState::Started {
            if let Some(method) = &self.options.stop_io_method {
                match self
                    .core
                    .submit(method, Vec::new())
                    .and_then(|ticket| ticket.wait_timeout(timeout))
                {
                    Ok(_) => debug!("{} succeeded", method),
                    Err(e) => warn!("{} failed during shutdown: {}", method, e),
                }
            }
        }

        let mut workers = std::mem::take(&mut *lock(&self.workers));

        // 3. Join the event router.
        if let Some(handle) = workers.events.take() {
            workers.events = join_with_timeout(handle, timeout, "join event router")
                .map_err(|(handle, e)| {
                    record(e);
                    handle
                })
                .err();
        }

        // 4. Close the server's stdin, then wait for the server to exit. A
        //    writer stuck on a full pipe holds the input lock; killing the
        //    server in reap breaks the pipe and frees it.
        if !self.close_input(timeout) {
            record(RpcError::ShutdownTimeout {
                step: "close server input",
                timeout,
            });
        }
        if let Some(mut process) = lock(&self.process).take() {
            if let Err(e) = process.reap(timeout) {
                record(e);
            }
        }

        // 5. Join the reader.
        if let Some(handle) = workers.reader.take() {
            if let Err((_, e)) = join_with_timeout(handle, timeout, "join reader") {
                record(e);
            }
        }

        // 6. Stop and join the writer.
        let _ = self.core.outgoing.send(Outgoing::Shutdown);
        if let Some(handle) = workers.writer.take() {
            if let Err((_, e)) = join_with_timeout(handle, timeout, "join writer") {
                record(e);
            }
        }

        // The reader's fail_all has released a router that missed step 3.
        if let Some(handle) = workers.events.take() {
            if let Err((_, e)) = join_with_timeout(handle, timeout, "join event router") {
                record(e);
            }
        }

        if !self.close_input(Duration::ZERO) {
            warn!("Server input still held by the writer");
        }
        self.core.pending.fail_all("Transport is closed");
        self.core.events.close(QueueClosed::Shutdown);

        *lock(&self.state) = TransportState::Closed;
        info!("RPC transport closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop the server's input stream, waiting at most `timeout` for the
    /// writer to let go of it. Returns false if the writer still holds it.
    fn close_input(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            match self.input.try_lock() {
                Ok(mut input) => {
                    drop(input.take());
                    return true;
                }
                Err(TryLockError::Poisoned(poisoned)) => {
                    drop(poisoned.into_inner().take());
                    return true;
                }
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => {
                    thread::sleep(JOIN_POLL_INTERVAL);
                }
                Err(TryLockError::WouldBlock) => return false,
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error while closing RPC transport: {}", e);
        }
    }
}

/// Join a worker thread, giving up after `timeout`.
///
/// On timeout the handle is returned so the caller can retry later; a
/// detached thread keeps running until its blocking call returns.
fn join_with_timeout(
    handle: JoinHandle<()>,
    timeout: Duration,
    step: &'static str,
) -> Result<(), (JoinHandle<()>, RpcError)> {
    let deadline = Instant::now() + timeout;

    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err((handle, RpcError::ShutdownTimeout { step, timeout }));
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }

    if handle.join().is_err() {
        warn!("Worker thread panicked ({})", step);
    }
    Ok(())
}

//! Writer thread: the only code path that writes to the server's stdin.
//!
//! Requests are queued on an mpsc channel and written one per line in
//! submission order. The stream itself is shared with the process
//! supervisor, which closes it during shutdown by taking it out of the
//! `Option`; the writer never closes it.

use std::io::Write;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use crate::rpc::error::RpcError;
use crate::rpc::framing::write_line_message;
use crate::rpc::pending::{lock, PendingTable};
use crate::rpc::protocol::Request;

/// The server's input stream, shared between the writer and the supervisor.
pub(crate) type SharedInput = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

/// Items on the writer queue.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Request(Request),
    /// Sentinel: stop draining and exit.
    Shutdown,
}

pub(crate) fn spawn_writer(
    queue: Receiver<Outgoing>,
    input: SharedInput,
    pending: Arc<PendingTable>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rpc-writer".to_string())
        .spawn(move || writer_loop(queue, input, pending))
}

/// Drain the queue until the sentinel arrives or every sender is gone.
///
/// A request that cannot be written fails its own pending entry and the
/// loop keeps draining.
fn writer_loop(queue: Receiver<Outgoing>, input: SharedInput, pending: Arc<PendingTable>) {
    while let Ok(item) = queue.recv() {
        let request = match item {
            Outgoing::Request(request) => request,
            Outgoing::Shutdown => {
                debug!("Writer received shutdown signal, exiting");
                break;
            }
        };

        if let Err(e) = write_request(&input, &request) {
            warn!(
                "Failed to send request {} ({}): {}",
                request.id, request.method, e
            );
            pending.fail(request.id, e);
        }
    }

    debug!("Writer loop exiting");
}

fn write_request(input: &SharedInput, request: &Request) -> Result<(), RpcError> {
    let body = serde_json::to_string(request)?;

    let mut guard = lock(input);
    let Some(stream) = guard.as_mut() else {
        return Err(RpcError::Transport("Server input is closed".to_string()));
    };

    write_line_message(&mut **stream, &body).map_err(|e| {
        error!("Write to server stdin failed: {:#}", e);
        RpcError::Transport(format!("Failed to send request: {:#}", e))
    })?;

    debug!("-> {} (id {})", request.method, request.id);
    Ok(())
}

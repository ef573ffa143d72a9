//! Reader thread: the only code path that reads the server's stdout.
//!
//! Each line is one JSON-RPC response, routed to its caller by id. EOF, a
//! read error, or a line that is not JSON ends the loop; the pending table
//! is then closed so every waiting caller is released with the reason.

use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::rpc::framing::read_line_message;
use crate::rpc::pending::PendingTable;
use crate::rpc::protocol::{parse_incoming, Incoming};

pub(crate) fn spawn_reader<R: Read + Send + 'static>(
    output: R,
    pending: Arc<PendingTable>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rpc-reader".to_string())
        .spawn(move || {
            let reason = reader_loop(BufReader::new(output), &pending);
            let released = pending.fail_all(&reason);
            if released > 0 {
                warn!("Released {} pending request(s): {}", released, reason);
            }
        })
}

/// Route responses until the stream ends. Returns why it ended.
pub(crate) fn reader_loop<R: BufRead>(mut reader: R, pending: &PendingTable) -> String {
    loop {
        let line = match read_line_message(&mut reader) {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("RPC server stdout closed");
                return "RPC server closed its output".to_string();
            }
            Err(e) => {
                error!("Failed to read from RPC server: {:#}", e);
                return format!("Failed to read from RPC server: {:#}", e);
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match parse_incoming(&line) {
            Ok(Incoming::Response(response)) => {
                let id = response.id;
                debug!("<- response (id {})", id);
                // Unknown ids are dropped: the table cannot correlate them and
                // no caller is waiting.
                if !pending.complete(response) {
                    warn!("Dropping response for unknown request id {}", id);
                }
            }
            Ok(Incoming::Unidentified(message)) => {
                warn!("Dropping server message without a request id: {}", message);
            }
            Err(e) => {
                error!("{}", e);
                return e.to_string();
            }
        }
    }
}

//! Line-delimited JSON-RPC 2.0 stub server used by the integration tests.
//!
//! Reads one request per line from stdin and writes responses to stdout.
//! Single-threaded: "concurrency" comes from deferring responses (`hold`,
//! `get_next_event`) and answering them later in a chosen order.
//!
//! Methods:
//!
//! - `echo [x]` returns `x` (or the whole params array unless there is exactly one)
//! - `fail` answers with the error `{"message": "boom"}`
//! - `hold [x]` defers the response; `release [[ids]]` answers held requests
//!   in the given order (default: reverse arrival order) with their `x`
//! - `held_ids` returns the ids of the requests currently held
//! - `seen_ids` returns every request id received so far
//! - `push_event [contextId, event]` queues an event for `get_next_event`
//! - `get_next_event` returns the next queued event or parks until one exists
//! - `stop_io_for_all_accounts` wakes parked `get_next_event` calls
//! - `accounts_dir` returns `$DC_ACCOUNTS_PATH`
//! - `unknown_id` / `no_id` send a stray message before the real reply
//! - `crash` exits immediately with status 3
//!
//! Flags: `--ignore-stop-io` never answers the stop call, `--hang-on-eof`
//! keeps running after stdin is closed.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Default)]
struct Flags {
    ignore_stop_io: bool,
    hang_on_eof: bool,
}

impl Flags {
    fn from_args() -> Result<Self> {
        let mut flags = Self::default();
        for arg in std::env::args().skip(1) {
            match arg.as_str() {
                "--ignore-stop-io" => flags.ignore_stop_io = true,
                "--hang-on-eof" => flags.hang_on_eof = true,
                other => anyhow::bail!("Unknown argument: {}", other),
            }
        }
        Ok(flags)
    }
}

struct Stub<W: Write> {
    out: W,
    flags: Flags,
    seen_ids: Vec<Value>,
    held: Vec<(Value, Value)>,
    events: VecDeque<Value>,
    parked: Vec<Value>,
    io_stopped: bool,
}

impl<W: Write> Stub<W> {
    fn new(out: W, flags: Flags) -> Self {
        Self {
            out,
            flags,
            seen_ids: Vec::new(),
            held: Vec::new(),
            events: VecDeque::new(),
            parked: Vec::new(),
            io_stopped: false,
        }
    }

    fn send(&mut self, message: &Value) -> Result<()> {
        let line = serde_json::to_string(message)?;
        writeln!(self.out, "{}", line).context("Failed to write response")?;
        self.out.flush().context("Failed to flush stdout")
    }

    fn reply(&mut self, id: Value, result: Value) -> Result<()> {
        self.send(&json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }

    fn reply_error(&mut self, id: Value, error: Value) -> Result<()> {
        self.send(&json!({"jsonrpc": "2.0", "id": id, "error": error}))
    }

    fn handle(&mut self, request: Value) -> Result<()> {
        let id = request["id"].clone();
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = match &request["params"] {
            Value::Array(params) => params.clone(),
            _ => Vec::new(),
        };
        debug!("-> {} (id {})", method, id);
        self.seen_ids.push(id.clone());

        match method.as_str() {
            "echo" => {
                let result = if params.len() == 1 {
                    params[0].clone()
                } else {
                    Value::Array(params)
                };
                self.reply(id, result)
            }
            "fail" => self.reply_error(id, json!({"message": "boom"})),
            "hold" => {
                let value = params.first().cloned().unwrap_or(Value::Null);
                self.held.push((id, value));
                Ok(())
            }
            "release" => self.release(id, params.first()),
            "held_ids" => {
                let ids = self.held.iter().map(|(held_id, _)| held_id.clone()).collect();
                self.reply(id, Value::Array(ids))
            }
            "seen_ids" => {
                let seen = Value::Array(self.seen_ids.clone());
                self.reply(id, seen)
            }
            "push_event" => {
                let envelope = json!({
                    "contextId": params.first().cloned().unwrap_or(json!(0)),
                    "event": params.get(1).cloned().unwrap_or(json!({"kind": "Info"})),
                });
                match self.parked.pop() {
                    Some(getter) => self.reply(getter, envelope)?,
                    None => self.events.push_back(envelope),
                }
                self.reply(id, Value::Null)
            }
            "get_next_event" => match self.events.pop_front() {
                Some(envelope) => self.reply(id, envelope),
                None if self.io_stopped => self.reply(id, io_stopped_event()),
                None => {
                    self.parked.push(id);
                    Ok(())
                }
            },
            "stop_io_for_all_accounts" => {
                if self.flags.ignore_stop_io {
                    info!("Ignoring {}", method);
                    return Ok(());
                }
                self.io_stopped = true;
                for getter in std::mem::take(&mut self.parked) {
                    self.reply(getter, io_stopped_event())?;
                }
                self.reply(id, Value::Null)
            }
            "accounts_dir" => {
                let dir = std::env::var("DC_ACCOUNTS_PATH")
                    .map(Value::String)
                    .unwrap_or(Value::Null);
                self.reply(id, dir)
            }
            "unknown_id" => {
                self.reply(json!(999_999), json!("stray"))?;
                self.reply(id, json!("ok"))
            }
            "no_id" => {
                self.send(&json!({"jsonrpc": "2.0", "method": "notice", "params": []}))?;
                self.reply(id, json!("ok"))
            }
            "crash" => {
                warn!("Crashing on request");
                std::process::exit(3);
            }
            _ => self.reply_error(
                id,
                json!({"code": -32601, "message": format!("Method not found: {}", method)}),
            ),
        }
    }

    fn release(&mut self, id: Value, order: Option<&Value>) -> Result<()> {
        let mut held = std::mem::take(&mut self.held);
        let released = match order.and_then(Value::as_array) {
            Some(ids) => {
                let mut ordered = Vec::new();
                for wanted in ids {
                    if let Some(pos) = held.iter().position(|(held_id, _)| held_id == wanted) {
                        ordered.push(held.remove(pos));
                    }
                }
                // Anything not named stays held.
                self.held = held;
                ordered
            }
            None => {
                held.reverse();
                held
            }
        };

        let count = released.len();
        for (held_id, value) in released {
            self.reply(held_id, value)?;
        }
        self.reply(id, json!(count))
    }
}

fn io_stopped_event() -> Value {
    json!({"contextId": 0, "event": {"kind": "ConnectivityChanged"}})
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "rpc_stub_server=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    let flags = Flags::from_args()?;
    info!("Stub server starting ({:?})", flags);
    let hang_on_eof = flags.hang_on_eof;

    let mut stub = Stub::new(io::stdout().lock(), flags);
    for line in io::stdin().lock().lines() {
        let line = line.context("Failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(request) => stub.handle(request)?,
            Err(e) => warn!("Ignoring malformed request: {}", e),
        }
    }

    info!("stdin closed");
    if hang_on_eof {
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }
    Ok(())
}

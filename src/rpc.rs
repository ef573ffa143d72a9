//! JSON-RPC 2.0 client transport for a server subprocess speaking over stdio.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐        stdin / stdout        ┌─────────────────────┐
//! │   Transport     │  ◄──────────────────────────►│  RPC server         │
//! │  (any thread)   │   one JSON object per line   │  (subprocess)       │
//! └─────────────────┘                              └─────────────────────┘
//! ```
//!
//! Three worker threads sit behind the [`Transport`] facade:
//!
//! - `rpc-writer` serializes queued requests onto the server's stdin
//! - `rpc-reader` reads responses and wakes the caller waiting on each id
//! - `rpc-events` polls `get_next_event` and fans events out per account
//!
//! # Protocol
//!
//! Requests and responses are JSON-RPC 2.0 objects terminated by `\n`:
//!
//! ```text
//! {"jsonrpc":"2.0","method":"get_system_info","params":[],"id":1}\n
//! {"jsonrpc":"2.0","id":1,"result":{"deltachat_core_version":"..."}}\n
//! ```
//!
//! Responses may arrive in any order; the `id` correlates them.
//!
//! # Usage
//!
//! ```ignore
//! use rpc_transport::rpc::{ServerConfig, Transport};
//! use serde_json::json;
//!
//! let transport = Transport::spawn(&ServerConfig::from_env())?;
//! let info = transport.call("get_system_info", vec![])?;
//! let event = transport.wait_for_event(1)?;
//! transport.close()?;
//! ```

mod config;
mod error;
mod events;
mod framing;
mod pending;
mod process;
mod protocol;
mod reader;
mod transport;
mod writer;

pub use config::{
    default_accounts_dir, ServerConfig, TransportOptions, ACCOUNTS_PATH_ENV,
    DEFAULT_EVENT_METHOD, DEFAULT_SERVER_PROGRAM, DEFAULT_STOP_IO_METHOD, SERVER_PATH_ENV,
};
pub use error::RpcError;
pub use pending::{IdAllocator, PendingTable, Ticket};
pub use protocol::{
    parse_incoming, AccountId, Event, EventEnvelope, Incoming, Request, RequestId, Response,
};
pub use transport::{Transport, TransportState};

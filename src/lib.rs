//! Client transport for line-delimited JSON-RPC 2.0 servers over stdio.
//!
//! This library provides:
//!
//! - `rpc` - the transport core: request dispatch, response routing,
//!   per-account event queues, and subprocess lifecycle
//!
//! # Example
//!
//! ```ignore
//! use rpc_transport::{ServerConfig, Transport};
//! use serde_json::json;
//!
//! let transport = Transport::spawn(&ServerConfig::from_env())?;
//!
//! let ticket = transport.call_async("get_chatlist_entries", vec![json!(1)])?;
//! let entries = ticket.wait()?;
//!
//! while let Ok(event) = transport.wait_for_event(1) {
//!     println!("{}", event.kind());
//! }
//! ```

pub mod rpc;

pub use rpc::{
    default_accounts_dir, AccountId, Event, EventEnvelope, RequestId, RpcError, ServerConfig,
    Ticket, Transport, TransportOptions, TransportState,
};

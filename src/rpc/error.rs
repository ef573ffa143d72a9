//! Error type shared by every transport component.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::rpc::protocol::RequestId;

/// Transport error types.
///
/// Variants fall into three groups:
/// - transport failures (`Spawn`, `Transport`, `Closed`, `Io`): systemic,
///   every in-flight call is affected
/// - protocol violations (`Protocol`, `DuplicateRequestId`)
/// - application errors (`Server`): local to the one call that produced it
#[derive(Debug, Error)]
pub enum RpcError {
    /// Failed to spawn the RPC server process.
    #[error("Failed to spawn RPC server `{program}`: {source}")]
    Spawn {
        /// Program that was launched
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The connection to the server is gone (EOF, broken pipe, unparsable line).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport has been closed and accepts no more work.
    #[error("Transport is closed")]
    Closed,

    /// Protocol-level error (malformed response, missing result).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A request id was registered twice while still in flight.
    #[error("Request id {0} is already pending")]
    DuplicateRequestId(RequestId),

    /// Server returned a JSON-RPC error response.
    #[error("Server error: {message}")]
    Server {
        /// JSON-RPC error code, when the server supplied one
        code: Option<i64>,
        /// Error message
        message: String,
        /// The complete `error` value from the response
        payload: Value,
    },

    /// A local wait exceeded its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// A shutdown step did not finish within the shutdown timeout.
    #[error("Shutdown step `{step}` did not finish within {timeout:?}")]
    ShutdownTimeout {
        /// Name of the step that timed out
        step: &'static str,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// JSON (de)serialization of a value failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error outside the message loops.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Build an application error from the `error` member of a response.
    ///
    /// `code` and `message` are extracted when the payload is a JSON-RPC
    /// error object; any other payload is kept verbatim and rendered as the
    /// message.
    pub fn server(payload: Value) -> Self {
        let code = payload.get("code").and_then(Value::as_i64);
        let message = match payload.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => payload.to_string(),
        };

        RpcError::Server {
            code,
            message,
            payload,
        }
    }

    /// True for errors that mean the connection itself is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::Spawn { .. } | RpcError::Transport(_) | RpcError::Closed | RpcError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_rpc_error_display() {
        let timeout_err = RpcError::Timeout(Duration::from_secs(30));
        assert_eq!(timeout_err.to_string(), "Timed out after 30s");

        let server_err = RpcError::server(json!({"code": -32000, "message": "Database error"}));
        assert_eq!(server_err.to_string(), "Server error: Database error");

        let protocol_err = RpcError::Protocol("Invalid JSON".to_string());
        assert_eq!(protocol_err.to_string(), "Protocol error: Invalid JSON");

        let shutdown_err = RpcError::ShutdownTimeout {
            step: "join reader",
            timeout: Duration::from_millis(500),
        };
        assert_eq!(
            shutdown_err.to_string(),
            "Shutdown step `join reader` did not finish within 500ms"
        );
    }

    #[test]
    fn test_server_error_extracts_code_and_message() {
        match RpcError::server(json!({"code": -32601, "message": "Method not found", "data": 1})) {
            RpcError::Server {
                code,
                message,
                payload,
            } => {
                assert_eq!(code, Some(-32601));
                assert_eq!(message, "Method not found");
                assert_eq!(payload["data"], json!(1));
            }
            other => panic!("Expected Server error, got: {:?}", other),
        }
    }

    #[test]
    fn test_server_error_without_message_keeps_payload() {
        match RpcError::server(json!("plain failure")) {
            RpcError::Server {
                code,
                message,
                payload,
            } => {
                assert_eq!(code, None);
                assert_eq!(message, "\"plain failure\"");
                assert_eq!(payload, json!("plain failure"));
            }
            other => panic!("Expected Server error, got: {:?}", other),
        }
    }

    #[test]
    fn test_is_transport_classification() {
        assert!(RpcError::Closed.is_transport());
        assert!(RpcError::Transport("eof".into()).is_transport());
        assert!(!RpcError::server(json!({"message": "boom"})).is_transport());
        assert!(!RpcError::Protocol("x".into()).is_transport());
        assert!(!RpcError::Timeout(Duration::from_secs(1)).is_transport());
    }
}

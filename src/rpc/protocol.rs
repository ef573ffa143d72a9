//! JSON-RPC 2.0 message types exchanged with the RPC server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::rpc::error::RpcError;

/// Correlation id linking a request to its response.
pub type RequestId = i64;

/// Server-side identifier of an account, used to route events.
pub type AccountId = u32;

// =============================================================================
// Requests and Responses
// =============================================================================

/// A JSON-RPC 2.0 request as written to the server's stdin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    jsonrpc: &'static str,
    /// Method name; not validated by the transport
    pub method: String,
    /// Positional parameters
    pub params: Vec<Value>,
    /// Correlation id
    pub id: RequestId,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Vec<Value>, id: RequestId) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 response read from the server's stdout.
///
/// `result` keeps presence information: `Some(Value::Null)` is a successful
/// `"result": null`, `None` means the member was absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl Response {
    /// Extract the result or error of this response.
    pub fn into_result(self) -> Result<Value, RpcError> {
        if let Some(error) = self.error {
            return Err(RpcError::server(error));
        }

        self.result.ok_or_else(|| {
            RpcError::Protocol(format!(
                "Response {} missing both result and error",
                self.id
            ))
        })
    }
}

/// Classification of one line read from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// A response correlated by integer id.
    Response(Response),
    /// A well-formed JSON message without a usable id.
    Unidentified(Value),
}

/// Parse one line from the server into a message.
///
/// # Errors
///
/// Returns `RpcError::Transport` when the line is not valid JSON; the
/// reader treats that as a broken stream.
pub fn parse_incoming(line: &str) -> Result<Incoming, RpcError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| RpcError::Transport(format!("Failed to parse server message: {}", e)))?;

    let Some(id) = value.get("id").and_then(Value::as_i64) else {
        return Ok(Incoming::Unidentified(value));
    };

    Ok(Incoming::Response(Response {
        id,
        result: value.get("result").cloned(),
        error: value.get("error").cloned(),
    }))
}

// =============================================================================
// Events
// =============================================================================

/// The result of one `get_next_event` call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "contextId")]
    pub context_id: AccountId,
    pub event: Event,
}

/// An event emitted by the server for one account.
///
/// The discriminant is taken from `kind`, falling back to `type`; all other
/// members are kept as kind-specific fields.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Event {
    kind: String,
    fields: Map<String, Value>,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Attach a kind-specific field.
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Event discriminant, e.g. `"IncomingMsg"`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Look up a kind-specific field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Convert back to the wire representation (`{"kind": .., ...fields}`).
    pub fn into_value(self) -> Value {
        let mut object = self.fields;
        object.insert("kind".to_string(), Value::String(self.kind));
        Value::Object(object)
    }
}

impl TryFrom<Value> for Event {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut fields) = value else {
            return Err(format!("event must be a JSON object, got {}", value));
        };

        let kind = match fields.remove("kind") {
            Some(Value::String(kind)) => kind,
            Some(other) => return Err(format!("event kind must be a string, got {}", other)),
            None => match fields.remove("type") {
                Some(Value::String(kind)) => kind,
                _ => return Err("event has no `kind` or `type` discriminant".to_string()),
            },
        };

        Ok(Self { kind, fields })
    }
}

impl From<Event> for Value {
    fn from(event: Event) -> Self {
        event.into_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let request = Request::new("echo", vec![json!(1), json!("two")], 7);
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(
            wire,
            json!({"jsonrpc": "2.0", "method": "echo", "params": [1, "two"], "id": 7})
        );
    }

    #[test]
    fn test_request_without_params_serializes_empty_array() {
        let request = Request::new("get_next_event", Vec::new(), 1);
        let wire = serde_json::to_string(&request).unwrap();
        assert!(wire.contains(r#""params":[]"#), "Got: {}", wire);
    }

    #[test]
    fn test_parse_success_response() {
        let incoming = parse_incoming(r#"{"jsonrpc":"2.0","result":{"a":1},"id":3}"#).unwrap();
        assert_eq!(
            incoming,
            Incoming::Response(Response {
                id: 3,
                result: Some(json!({"a": 1})),
                error: None,
            })
        );
    }

    #[test]
    fn test_parse_null_result_is_present() {
        let incoming = parse_incoming(r#"{"jsonrpc":"2.0","result":null,"id":4}"#).unwrap();
        match incoming {
            Incoming::Response(response) => {
                assert_eq!(response.into_result().unwrap(), Value::Null);
            }
            other => panic!("Expected response, got: {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_response() {
        let incoming =
            parse_incoming(r#"{"jsonrpc":"2.0","error":{"message":"boom"},"id":1}"#).unwrap();
        let Incoming::Response(response) = incoming else {
            panic!("Expected response");
        };
        match response.into_result() {
            Err(RpcError::Server { message, payload, .. }) => {
                assert_eq!(message, "boom");
                assert_eq!(payload, json!({"message": "boom"}));
            }
            other => panic!("Expected Server error, got: {:?}", other),
        }
    }

    #[test]
    fn test_response_missing_result_and_error() {
        let response = Response {
            id: 9,
            result: None,
            error: None,
        };
        assert!(matches!(response.into_result(), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_parse_message_without_id() {
        let incoming = parse_incoming(r#"{"jsonrpc":"2.0","method":"log","params":[]}"#).unwrap();
        assert!(matches!(incoming, Incoming::Unidentified(_)));

        let string_id = parse_incoming(r#"{"jsonrpc":"2.0","result":1,"id":"abc"}"#).unwrap();
        assert!(matches!(string_id, Incoming::Unidentified(_)));
    }

    #[test]
    fn test_parse_invalid_json_is_transport_error() {
        let err = parse_incoming("not json").unwrap_err();
        assert!(err.is_transport(), "Got: {:?}", err);
    }

    #[test]
    fn test_event_envelope_deserialize() {
        let envelope: EventEnvelope = serde_json::from_value(json!({
            "contextId": 7,
            "event": {"kind": "IncomingMsg", "chatId": 10, "msgId": 42}
        }))
        .unwrap();

        assert_eq!(envelope.context_id, 7);
        assert_eq!(envelope.event.kind(), "IncomingMsg");
        assert_eq!(envelope.event.get("msgId"), Some(&json!(42)));
        assert_eq!(envelope.event.get("kind"), None);
    }

    #[test]
    fn test_event_type_discriminant_fallback() {
        let event = Event::try_from(json!({"type": "Info", "msg": "hello"})).unwrap();
        assert_eq!(event.kind(), "Info");
        assert_eq!(event.get("msg"), Some(&json!("hello")));
    }

    #[test]
    fn test_event_rejects_missing_discriminant() {
        assert!(Event::try_from(json!({"msg": "hello"})).is_err());
        assert!(Event::try_from(json!([1, 2])).is_err());
        assert!(Event::try_from(json!({"kind": 5})).is_err());
    }

    #[test]
    fn test_event_into_value() {
        let event = Event::new("MsgsChanged").with_field("chatId", json!(3));
        assert_eq!(
            event.into_value(),
            json!({"kind": "MsgsChanged", "chatId": 3})
        );
    }
}

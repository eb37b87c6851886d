//! Framed protocol messages.
//!
//! The proxy never interprets payloads beyond the JSON-RPC envelope: it needs
//! to know whether a frame is a request, a notification or a response so it
//! can route replies, and nothing more.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// JSON-RPC error code used when the proxy itself cannot deliver a request.
pub const PROXY_ERROR_CODE: i64 = -32001;

/// An opaque JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Value);

impl Message {
    /// Wrap a raw JSON value.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Parse a single frame from text.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text).map(Self)
    }

    /// Parse a body that may hold a single message or a batch.
    pub fn parse_batch(text: &str) -> serde_json::Result<Vec<Self>> {
        Ok(Self::split_batch(serde_json::from_str(text)?))
    }

    /// Split an already-decoded value into messages.
    pub fn split_batch(value: Value) -> Vec<Self> {
        match value {
            Value::Array(items) => items.into_iter().map(Self).collect(),
            other => vec![Self(other)],
        }
    }

    /// Out-of-band notification carrying a chunk of a server's standard error.
    pub fn stderr(data: impl Into<String>) -> Self {
        Self(json!({
            "jsonrpc": "2.0",
            "method": "stderr",
            "params": { "data": data.into() },
        }))
    }

    /// JSON-RPC error response for the given request id.
    pub fn error_response(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message.into() },
        }))
    }

    /// The request/response id, if any.
    pub fn id(&self) -> Option<&Value> {
        self.0.get("id").filter(|id| !id.is_null())
    }

    /// The method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        self.0.get("method").and_then(Value::as_str)
    }

    /// A call that expects a response.
    pub fn is_request(&self) -> bool {
        self.method().is_some() && self.id().is_some()
    }

    /// A call that expects no response.
    pub fn is_notification(&self) -> bool {
        self.method().is_some() && self.id().is_none()
    }

    /// A result or error answering an earlier request.
    pub fn is_response(&self) -> bool {
        self.method().is_none()
            && self.id().is_some()
            && (self.0.get("result").is_some() || self.0.get("error").is_some())
    }

    /// Key used to correlate a response with its request.
    pub fn correlation_key(&self) -> Option<String> {
        self.id().map(Value::to_string)
    }

    /// Borrow the underlying value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Take the underlying value.
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Serialize to compact JSON text.
    pub fn to_json(&self) -> String {
        self.0.to_string()
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

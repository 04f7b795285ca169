/// JSON-RPC 2.0 message structures
///
/// Every payload carried over the MQTT topics is a JSON-encoded JSON-RPC 2.0
/// message: a request (with an id), a response (result or error, echoing the
/// request id), or a notification (no id). This module defines those
/// envelopes and the error codes used across the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC version string, required on every message
pub const JSONRPC_VERSION: &str = "2.0";

/// Request correlation id - a string or an integer
///
/// Requests generated by this crate use string UUIDs, but peers are allowed
/// to send integer ids and responses must echo whatever shape arrived.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{}", s),
            RequestId::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

/// JSON-RPC 2.0 request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Unique identifier correlating the response to this request
    pub id: RequestId,
    /// The method to invoke (e.g. "tools/call")
    pub method: String,
    /// Parameters for the method call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new request with the given id, method and parameters
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message
///
/// Carries either a successful `result` or an `error`, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Request id this response answers
    pub id: RequestId,
    /// Successful result (if no error occurred)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error information (if something went wrong)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a successful response
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: RequestId, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code (see [`error_codes`])
    pub code: i64,
    /// Human-readable error message
    pub message: String,
    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 notification - a method call with no id and no response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Notification method (e.g. "notifications/disconnected")
    pub method: String,
    /// Notification parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new notification
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Any inbound JSON-RPC message, classified on decode
///
/// The variant order matters for untagged deserialization: a request has
/// both `id` and `method`, a response has `id` with `result` or `error`,
/// and a notification has only `method`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Decode a message from raw payload bytes
    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Standard JSON-RPC and MCP-specific error codes
pub mod error_codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error (also used for handler failures)
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The message could not be interpreted as a valid MCP exchange
    pub const INVALID_MESSAGE: i64 = -32000;
    /// The named tool is not registered on the server
    pub const TOOL_NOT_FOUND: i64 = -32001;
    /// The resource uri is not registered on the server
    pub const RESOURCE_NOT_FOUND: i64 = -32002;
}

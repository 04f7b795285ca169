/// Error taxonomy for the MCP-over-MQTT transport
///
/// Transport failures surface to the caller that triggered them; protocol
/// failures on the ingress path are logged and dropped unless they map to a
/// pending request; JSON-RPC failures come back to the request's awaiter.

use serde_json::Value;
use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::JsonRpcError;
use crate::transport::TransportError;

/// Everything that can go wrong in the transport core
#[derive(Error, Debug)]
pub enum Error {
    /// MQTT connect/subscribe/publish failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Envelope parse or validation failure
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC level failure returned by the remote peer
    #[error("MCP error {code}: {message}")]
    Mcp {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The pending request exceeded its deadline
    #[error("request '{method}' timed out after {elapsed_ms} ms")]
    RequestTimeout { method: String, elapsed_ms: u64 },

    /// RPC invoked against a server that is not connected (or before connect)
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Pending request aborted by shutdown
    #[error("request cancelled by shutdown")]
    Cancelled,

    /// Invalid configuration detected at construction
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// JSON serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Convert a JSON-RPC error object into the caller-facing error
    pub fn from_rpc_error(error: JsonRpcError) -> Self {
        Error::Mcp {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }

    /// The MCP error code, if this is an `Mcp` error
    pub fn mcp_code(&self) -> Option<i64> {
        match self {
            Error::Mcp { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// MCP message structures and JSON-RPC handling
///
/// This module defines the JSON-RPC envelopes that travel over the MQTT
/// topics and the MCP data model exchanged inside them.

pub mod jsonrpc;
pub mod types;

pub use jsonrpc::*;
pub use types::*;

/// MCP-over-MQTT transport library
///
/// Carries the Model Context Protocol - a JSON-RPC 2.0 request/response and
/// notification dialogue - over an MQTT 5.0 broker. Two peers are provided:
/// [`McpServer`] publishes tools and resources for remote invocation, and
/// [`McpClient`] discovers servers through retained presence topics and
/// invokes their capabilities. The broker is the only collaborator; there
/// is no direct peer-to-peer channel.

// Internal modules
mod error;
mod pending;

// Public modules
pub mod client;
pub mod config;
pub mod protocol;
pub mod server;
pub mod testutil;
pub mod topics;
pub mod transport;

// Re-export the main types at the crate root
pub use client::{ClientEvent, McpClient};
pub use config::{BrokerAddress, ClientConfig, ConfigError, MqttConfig, ServerConfig};
pub use error::Error;
pub use pending::default_timeout;
pub use protocol::*;
pub use server::{
    HandlerError, McpServer, ResourceHandler, ResourceOptions, ServerEvent, ServerTopics,
    ToolHandler,
};
pub use transport::{MqttTransport, RumqttcTransport, TransportError};

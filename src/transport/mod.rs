/// Transport adapter over an MQTT 5.0 client
///
/// The peers talk to the broker only through the [`MqttTransport`] trait:
/// connect, disconnect, subscribe (with options), unsubscribe, publish
/// (with qos, retain and user properties), plus an inbound message stream
/// and the CONNACK properties returned by the broker. The production
/// implementation lives in [`mqtt`]; tests swap in the in-memory transport
/// from `testutil`.

pub mod mqtt;

pub use mqtt::RumqttcTransport;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// User property naming the publisher's component type
pub const COMPONENT_TYPE_PROPERTY: &str = "MCP-COMPONENT-TYPE";
/// User property carrying the publisher's MQTT client id
pub const CLIENT_ID_PROPERTY: &str = "MCP-MQTT-CLIENT-ID";
/// Connect-time user property carrying peer metadata as a JSON string
pub const META_PROPERTY: &str = "MCP-META";
/// CONNACK user property suggesting a server-name filter to clients
pub const SERVER_NAME_FILTERS_PROPERTY: &str = "MCP-SERVER-NAME-FILTERS";
/// CONNACK user property carrying broker-side RBAC information
pub const RBAC_PROPERTY: &str = "MCP-RBAC";

/// Component-type value for server peers
pub const COMPONENT_SERVER: &str = "mcp-server";
/// Component-type value for client peers
pub const COMPONENT_CLIENT: &str = "mcp-client";

/// Failure of an MQTT operation
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("disconnect failed: {0}")]
    Disconnect(String),

    #[error("transport is not connected")]
    NotConnected,
}

/// MQTT quality-of-service level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Default for QoS {
    /// Both subscribes and publishes default to QoS 1
    fn default() -> Self {
        QoS::AtLeastOnce
    }
}

/// Options for a single publish
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
    pub user_properties: Vec<(String, String)>,
}

/// Options for a single subscribe
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub qos: QoS,
    /// MQTT 5.0 No-Local: suppress delivery of this session's own publishes
    pub no_local: bool,
}

/// Last-will message registered at connect time
#[derive(Debug, Clone)]
pub struct WillConfig {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Connect-time options a peer supplies to the transport
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Last-will published by the broker if the session dies ungracefully
    pub will: Option<WillConfig>,
    /// User properties attached to the CONNECT packet
    pub user_properties: Vec<(String, String)>,
}

/// Broker acknowledgement data exposed after connect
#[derive(Debug, Clone, Default)]
pub struct ConnackInfo {
    pub session_present: bool,
    pub user_properties: Vec<(String, String)>,
}

impl ConnackInfo {
    /// Look up a CONNACK user property by name (case-sensitive)
    pub fn user_property(&self, name: &str) -> Option<&str> {
        self.user_properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// A message delivered by the broker on a subscribed topic
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub user_properties: Vec<(String, String)>,
}

impl InboundMessage {
    /// Look up a user property by name (case-sensitive)
    pub fn user_property(&self, name: &str) -> Option<&str> {
        self.user_properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Thin abstraction over an MQTT 5.0 client session
///
/// Implementations must force protocol version 5.0 and session expiry 0,
/// and deliver inbound messages in broker order on the returned stream.
#[async_trait]
pub trait MqttTransport: Send + Sync {
    /// Connect to the broker. Returns the CONNACK data and the inbound
    /// message stream for this session.
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> Result<(ConnackInfo, mpsc::UnboundedReceiver<InboundMessage>), TransportError>;

    /// Gracefully disconnect (the broker discards the last-will)
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Subscribe to a topic filter
    async fn subscribe(
        &self,
        filter: &str,
        options: SubscribeOptions,
    ) -> Result<(), TransportError>;

    /// Remove a subscription
    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Publish a payload to a topic
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError>;
}

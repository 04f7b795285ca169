/// Shared helpers for the integration tests
///
/// Every scenario runs both peers against the in-memory broker from
/// `mcp_mqtt::testutil`, so the full wire path (topics, retained presence,
/// user properties, No-Local) is exercised without a network.

use std::sync::Arc;
use std::time::Duration;

use mcp_mqtt::testutil::MemoryBroker;
use mcp_mqtt::{
    ClientConfig, ClientEvent, McpClient, McpServer, MqttConfig, ServerConfig, ToolsCapability,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub const SERVER_ID: &str = "S1";
pub const SERVER_NAME: &str = "demo/calc";
pub const CLIENT_ID: &str = "C1";

pub fn calc_server_config() -> ServerConfig {
    ServerConfig {
        mqtt: MqttConfig::default(),
        server_id: SERVER_ID.to_string(),
        server_name: SERVER_NAME.to_string(),
        name: "Calc".to_string(),
        version: "1.0.0".to_string(),
        description: Some("Simple calculator".to_string()),
        capabilities: Default::default(),
        rbac: None,
    }
}

/// Server config that declares tools.listChanged = true
pub fn notifying_server_config() -> ServerConfig {
    let mut config = calc_server_config();
    config.capabilities.tools = Some(ToolsCapability { list_changed: true });
    config
}

pub fn test_client_config(client_id: &str) -> ClientConfig {
    ClientConfig {
        mqtt: MqttConfig::default(),
        client_id: Some(client_id.to_string()),
        name: "test-client".to_string(),
        version: "0.1.0".to_string(),
        capabilities: Default::default(),
    }
}

pub async fn start_server(broker: &MemoryBroker, config: ServerConfig) -> McpServer {
    let transport = Arc::new(broker.transport(config.server_id.clone()));
    let server = McpServer::with_transport(config, transport).expect("server config must be valid");
    server.start().await.expect("server must start");
    server
}

pub async fn connect_client(broker: &MemoryBroker, client_id: &str) -> McpClient {
    let transport = Arc::new(broker.transport(client_id));
    let client = McpClient::with_transport(test_client_config(client_id), transport)
        .expect("client config must be valid");
    client.connect().await.expect("client must connect");
    client
}

/// Await the first event matching the predicate, with a hard deadline
pub async fn wait_for_event(
    events: &mut UnboundedReceiver<ClientEvent>,
    description: &str,
    predicate: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", description))
}

/// Poll a condition until it holds or a deadline passes
pub async fn eventually(description: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", description);
}

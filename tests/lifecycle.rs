/// Lifecycle, shutdown and failure-path scenarios
///
/// Timeouts, cancellation at disconnect, the graceful disconnect dialogue,
/// retained-presence discipline, and the per-client subscription set.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use mcp_mqtt::testutil::MemoryBroker;
use mcp_mqtt::transport::{ConnectOptions, MqttTransport, PublishOptions};
use mcp_mqtt::{topics, ClientEvent, Error, HandlerError, McpClient, McpServer};
use serde_json::{json, Value};

async fn initialized_pair(broker: &MemoryBroker) -> (McpServer, McpClient) {
    let server = start_server(broker, calc_server_config()).await;
    let client = connect_client(broker, CLIENT_ID).await;
    let mut events = client.events().expect("event stream");
    wait_for_event(&mut events, "server_discovered", |event| {
        matches!(event, ClientEvent::ServerDiscovered(_))
    })
    .await;
    client.initialize_server(SERVER_ID).await.expect("handshake");
    (server, client)
}

#[tokio::test]
async fn slow_server_times_out_and_empties_the_registry() {
    let broker = MemoryBroker::new();
    let (server, client) = initialized_pair(&broker).await;
    server
        .register_tool(
            "slow",
            None,
            json!({"type": "object"}),
            |_args: HashMap<String, Value>| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, HandlerError>(json!(null))
            },
        )
        .await
        .unwrap();

    let err = client
        .call_tool_with_timeout(SERVER_ID, "slow", None, Some(Duration::from_millis(50)))
        .await
        .expect_err("deadline must fire");
    match err {
        Error::RequestTimeout { method, elapsed_ms } => {
            assert_eq!(method, "tools/call");
            assert!(elapsed_ms >= 50);
        }
        other => panic!("expected RequestTimeout, got {:?}", other),
    }
    assert_eq!(client.pending_request_count(), 0);

    // The late response must not disturb later requests
    assert!(client.ping(SERVER_ID).await.unwrap());
}

#[tokio::test]
async fn disconnect_cancels_outstanding_requests() {
    let broker = MemoryBroker::new();
    let (server, client) = initialized_pair(&broker).await;
    server
        .register_tool(
            "slow",
            None,
            json!({"type": "object"}),
            |_args: HashMap<String, Value>| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, HandlerError>(json!(null))
            },
        )
        .await
        .unwrap();

    let client = Arc::new(client);
    let caller = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.call_tool(SERVER_ID, "slow", None).await })
    };
    // Let the request reach the wire, then shut down
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.disconnect().await.unwrap();

    let outcome = caller.await.unwrap();
    assert!(matches!(outcome, Err(Error::Cancelled)));
    assert_eq!(client.pending_request_count(), 0);
}

#[tokio::test]
async fn graceful_client_disconnect() {
    let broker = MemoryBroker::new();
    let (server, client) = initialized_pair(&broker).await;

    // The server is watching this client's presence and capability topics
    eventually("per-client subscriptions", || {
        let subscriptions = broker.subscriptions(SERVER_ID);
        subscriptions.contains(&topics::client_presence(CLIENT_ID))
            && subscriptions.contains(&topics::client_capability(CLIENT_ID))
    })
    .await;

    client.disconnect().await.unwrap();

    // Both disconnect notifications went out
    let is_disconnected_notification = |payload: &[u8]| {
        serde_json::from_slice::<Value>(payload)
            .map(|body| body["method"] == "notifications/disconnected")
            .unwrap_or(false)
    };
    let publishes = broker.publishes();
    assert!(publishes.iter().any(|record| {
        record.topic == topics::rpc(CLIENT_ID, SERVER_ID, SERVER_NAME)
            && record.publisher == CLIENT_ID
            && is_disconnected_notification(&record.payload)
    }));
    assert!(publishes.iter().any(|record| {
        record.topic == topics::client_presence(CLIENT_ID)
            && is_disconnected_notification(&record.payload)
    }));

    // The server evicts the client and drops the per-client subscriptions
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if server.connected_clients().await.is_empty() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "server never evicted the client"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    eventually("subscriptions removed", || {
        let subscriptions = broker.subscriptions(SERVER_ID);
        !subscriptions.contains(&topics::client_presence(CLIENT_ID))
            && !subscriptions.contains(&topics::client_capability(CLIENT_ID))
    })
    .await;

    // A second disconnect is a no-op
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn retained_presence_discipline() {
    let broker = MemoryBroker::new();
    let presence_topic = topics::server_presence(SERVER_ID, SERVER_NAME);
    let server = start_server(&broker, calc_server_config()).await;

    let retained = broker
        .retained_payload(&presence_topic)
        .expect("presence must be retained after start");
    let body: Value = serde_json::from_slice(&retained).unwrap();
    assert_eq!(body["method"], "notifications/server/online");
    assert_eq!(body["params"]["server_name"], SERVER_NAME);

    server.stop().await.unwrap();
    assert_eq!(broker.retained_payload(&presence_topic), None);

    // Exactly one non-empty presence publish per lifetime
    let presence_publishes: Vec<bool> = broker
        .publishes()
        .iter()
        .filter(|record| record.topic == presence_topic)
        .map(|record| record.payload.is_empty())
        .collect();
    assert_eq!(presence_publishes, vec![false, true]);

    // Stopping twice never raises
    server.stop().await.unwrap();
}

#[tokio::test]
async fn every_publish_carries_the_identity_properties() {
    let broker = MemoryBroker::new();
    let (server, client) = initialized_pair(&broker).await;
    server
        .register_tool(
            "echo",
            None,
            json!({"type": "object"}),
            |args: HashMap<String, Value>| async move { Ok::<_, HandlerError>(json!(args)) },
        )
        .await
        .unwrap();
    client.call_tool(SERVER_ID, "echo", None).await.unwrap();
    client.disconnect().await.unwrap();
    server.stop().await.unwrap();

    for record in broker.publishes() {
        let component = record
            .user_properties
            .iter()
            .find(|(key, _)| key == "MCP-COMPONENT-TYPE");
        let client_id = record
            .user_properties
            .iter()
            .find(|(key, _)| key == "MCP-MQTT-CLIENT-ID");
        assert!(
            component.is_some() && client_id.is_some(),
            "publish on {} lacks identity properties",
            record.topic
        );
        let (_, client_id) = client_id.unwrap();
        assert_eq!(client_id, &record.publisher);
    }
}

#[tokio::test]
async fn control_messages_without_client_id_are_dropped() {
    let broker = MemoryBroker::new();
    let server = start_server(&broker, calc_server_config()).await;

    // A peer that omits the MCP-MQTT-CLIENT-ID property
    let rogue = broker.transport("rogue");
    let (_, _rx) = rogue.connect(ConnectOptions::default()).await.unwrap();
    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {}
    });
    rogue
        .publish(
            &topics::server_control(SERVER_ID, SERVER_NAME),
            serde_json::to_vec(&request).unwrap(),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.connected_clients().await.is_empty());

    // A well-behaved client still initializes fine afterwards
    let client = connect_client(&broker, CLIENT_ID).await;
    let mut events = client.events().expect("event stream");
    wait_for_event(&mut events, "server_discovered", |event| {
        matches!(event, ClientEvent::ServerDiscovered(_))
    })
    .await;
    client.initialize_server(SERVER_ID).await.unwrap();
}

#[tokio::test]
async fn malformed_rpc_payloads_are_dropped() {
    let broker = MemoryBroker::new();
    let (_server, client) = initialized_pair(&broker).await;

    // Inject junk on the client's rpc topic
    let rogue = broker.transport("rogue");
    let (_, _rx) = rogue.connect(ConnectOptions::default()).await.unwrap();
    rogue
        .publish(
            &topics::rpc(CLIENT_ID, SERVER_ID, SERVER_NAME),
            b"not json at all".to_vec(),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    // The event loop survived and requests still work
    assert!(client.ping(SERVER_ID).await.unwrap());
}

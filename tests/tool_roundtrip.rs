/// Tool and resource round-trips over the RPC channel
///
/// Covers the dispatcher method table: tools/list, tools/call,
/// resources/list, resources/read, ping, and the error codes for unknown
/// tools, resources and methods.

mod common;

use std::collections::HashMap;

use common::*;
use mcp_mqtt::testutil::MemoryBroker;
use mcp_mqtt::{
    ClientEvent, Error, HandlerError, McpClient, McpServer, ResourceOptions, ToolCallResult,
};
use serde_json::{json, Value};

async fn add_tool(server: &McpServer) {
    server
        .register_tool(
            "add",
            Some("Add two numbers".to_string()),
            json!({
                "type": "object",
                "properties": {
                    "a": {"type": "number"},
                    "b": {"type": "number"}
                },
                "required": ["a", "b"]
            }),
            |args: HashMap<String, Value>| async move {
                let a = args
                    .get("a")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| HandlerError::from("missing argument 'a'"))?;
                let b = args
                    .get("b")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| HandlerError::from("missing argument 'b'"))?;
                let result = ToolCallResult::success((a + b).to_string());
                serde_json::to_value(result).map_err(|err| HandlerError(err.to_string()))
            },
        )
        .await
        .expect("tool registration");
}

async fn initialized_pair(broker: &MemoryBroker) -> (McpServer, McpClient) {
    let server = start_server(broker, calc_server_config()).await;
    add_tool(&server).await;
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
async fn tool_round_trip() {
    let broker = MemoryBroker::new();
    let (_server, client) = initialized_pair(&broker).await;

    let tools = client.list_tools(SERVER_ID).await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "add");
    assert_eq!(tools[0].input_schema["required"], json!(["a", "b"]));

    let arguments = HashMap::from([
        ("a".to_string(), json!(1)),
        ("b".to_string(), json!(2)),
    ]);
    let result = client
        .call_tool(SERVER_ID, "add", Some(arguments))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "3");
    assert_eq!(result["isError"], json!(false));
}

#[tokio::test]
async fn unknown_tool_yields_tool_not_found() {
    let broker = MemoryBroker::new();
    let (_server, client) = initialized_pair(&broker).await;

    let err = client
        .call_tool(SERVER_ID, "nope", Some(HashMap::new()))
        .await
        .expect_err("unknown tool must fail");
    assert_eq!(err.mcp_code(), Some(-32001));
}

#[tokio::test]
async fn failing_handler_yields_internal_error() {
    let broker = MemoryBroker::new();
    let (server, client) = initialized_pair(&broker).await;
    server
        .register_tool(
            "explode",
            None,
            json!({"type": "object"}),
            |_args: HashMap<String, Value>| async move {
                Err::<Value, _>(HandlerError::from("the boiler burst"))
            },
        )
        .await
        .unwrap();

    let err = client
        .call_tool(SERVER_ID, "explode", None)
        .await
        .expect_err("failing handler must surface");
    match err {
        Error::Mcp { code, message, .. } => {
            assert_eq!(code, -32603);
            assert_eq!(message, "the boiler burst");
        }
        other => panic!("expected Mcp error, got {:?}", other),
    }
}

#[tokio::test]
async fn tool_error_results_are_not_rpc_errors() {
    let broker = MemoryBroker::new();
    let (server, client) = initialized_pair(&broker).await;
    server
        .register_tool(
            "grumpy",
            None,
            json!({"type": "object"}),
            |_args: HashMap<String, Value>| async move {
                serde_json::to_value(ToolCallResult::error("no"))
                    .map_err(|err| HandlerError(err.to_string()))
            },
        )
        .await
        .unwrap();

    // isError = true is a successful response with a negative outcome
    let result = client.call_tool(SERVER_ID, "grumpy", None).await.unwrap();
    assert_eq!(result["isError"], json!(true));
}

#[tokio::test]
async fn resource_round_trip() {
    let broker = MemoryBroker::new();
    let (server, client) = initialized_pair(&broker).await;
    server
        .register_resource(
            "memo://greeting",
            "greeting",
            |uri: String| async move {
                Ok::<_, HandlerError>(json!({
                    "contents": [{"uri": uri, "text": "hello"}]
                }))
            },
            ResourceOptions {
                description: Some("A greeting".to_string()),
                mime_type: Some("text/plain".to_string()),
            },
        )
        .await
        .unwrap();

    let resources = client.list_resources(SERVER_ID).await.unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].uri, "memo://greeting");
    assert_eq!(resources[0].mime_type.as_deref(), Some("text/plain"));

    let result = client
        .read_resource(SERVER_ID, "memo://greeting")
        .await
        .unwrap();
    assert_eq!(result["contents"][0]["text"], "hello");

    let err = client
        .read_resource(SERVER_ID, "memo://missing")
        .await
        .expect_err("unknown resource must fail");
    assert_eq!(err.mcp_code(), Some(-32002));
}

#[tokio::test]
async fn unknown_method_yields_method_not_found() {
    let broker = MemoryBroker::new();
    let (_server, client) = initialized_pair(&broker).await;

    let err = client
        .request_with_timeout(SERVER_ID, "prompts/list", json!({}), None)
        .await
        .expect_err("unhandled method must fail");
    assert_eq!(err.mcp_code(), Some(-32601));
}

#[tokio::test]
async fn ping_round_trip() {
    let broker = MemoryBroker::new();
    let (_server, client) = initialized_pair(&broker).await;
    assert!(client.ping(SERVER_ID).await.unwrap());
}

#[tokio::test]
async fn repeated_listing_is_stable() {
    let broker = MemoryBroker::new();
    let (_server, client) = initialized_pair(&broker).await;

    let first: Vec<String> = client
        .list_tools(SERVER_ID)
        .await
        .unwrap()
        .into_iter()
        .map(|tool| tool.name)
        .collect();
    let second: Vec<String> = client
        .list_tools(SERVER_ID)
        .await
        .unwrap()
        .into_iter()
        .map(|tool| tool.name)
        .collect();
    assert_eq!(first, second);
}

#[tokio::test]
async fn rpc_before_initialize_is_rejected() {
    let broker = MemoryBroker::new();
    let _server = start_server(&broker, calc_server_config()).await;
    let client = connect_client(&broker, CLIENT_ID).await;
    let mut events = client.events().expect("event stream");
    wait_for_event(&mut events, "server_discovered", |event| {
        matches!(event, ClientEvent::ServerDiscovered(_))
    })
    .await;

    // Discovered but not initialized: requests must be refused locally
    let err = client
        .list_tools(SERVER_ID)
        .await
        .expect_err("rpc before initialize must fail");
    assert!(matches!(err, Error::NotConnected(_)));
}

#[tokio::test]
async fn list_changed_gating() {
    let broker = MemoryBroker::new();

    // A server that never declared tools.listChanged stays silent
    let silent = start_server(&broker, calc_server_config()).await;
    add_tool(&silent).await;
    let client = connect_client(&broker, CLIENT_ID).await;
    let mut events = client.events().expect("event stream");
    wait_for_event(&mut events, "server_discovered", |event| {
        matches!(event, ClientEvent::ServerDiscovered(_))
    })
    .await;
    client.initialize_server(SERVER_ID).await.unwrap();

    silent
        .register_tool("late", None, json!({"type": "object"}), noop_tool)
        .await
        .unwrap();
    let notified = broker.publishes().iter().any(|record| {
        serde_json::from_slice::<Value>(&record.payload)
            .map(|body| body["method"] == "notifications/tools/list_changed")
            .unwrap_or(false)
    });
    assert!(!notified, "undeclared capability must never notify");

    // A declaring server notifies for post-initialization registrations
    let mut config = notifying_server_config();
    config.server_id = "S2".to_string();
    config.server_name = "demo/notifier".to_string();
    let notifier = start_server(&broker, config).await;

    // Registration before any initialize is silent
    notifier
        .register_tool("early", None, json!({"type": "object"}), noop_tool)
        .await
        .unwrap();

    wait_for_event(&mut events, "discovery of S2", |event| {
        matches!(event, ClientEvent::ServerDiscovered(info) if info.server_id == "S2")
    })
    .await;
    client.initialize_server("S2").await.unwrap();

    notifier
        .register_tool("late", None, json!({"type": "object"}), noop_tool)
        .await
        .unwrap();

    let changed = wait_for_event(&mut events, "capability change", |event| {
        matches!(event, ClientEvent::ServerCapabilityChanged { .. })
    })
    .await;
    match changed {
        ClientEvent::ServerCapabilityChanged { server_id, method } => {
            assert_eq!(server_id, "S2");
            assert_eq!(method, "notifications/tools/list_changed");
        }
        _ => unreachable!(),
    }

    let notifications: Vec<_> = broker
        .publishes()
        .iter()
        .filter(|record| {
            record.publisher == "S2"
                && serde_json::from_slice::<Value>(&record.payload)
                    .map(|body| body["method"] == "notifications/tools/list_changed")
                    .unwrap_or(false)
        })
        .map(|record| record.topic.clone())
        .collect();
    assert_eq!(
        notifications,
        vec!["$mcp-server/capability/S2/demo/notifier".to_string()]
    );
}

async fn noop_tool(_args: HashMap<String, Value>) -> Result<Value, HandlerError> {
    Ok(json!(null))
}

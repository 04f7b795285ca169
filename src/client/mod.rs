/// Client peer
///
/// Discovers servers through their retained presence topics, drives the
/// initialize handshake, and invokes tools and resources over per-server
/// RPC topics. Everything observable surfaces on the [`ClientEvent`]
/// stream; request methods await their correlated response through the
/// pending-request registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::pending::{default_timeout, PendingRequests};
use crate::protocol::{
    error_codes, methods, notifications, Implementation, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ResourceDefinition, ServerInfo,
    ServerOnlineParams, ToolDefinition, MCP_PROTOCOL_VERSION,
};
use crate::topics::{self, TopicKind};
use crate::transport::{
    ConnectOptions, InboundMessage, MqttTransport, PublishOptions, RumqttcTransport,
    SubscribeOptions, WillConfig, CLIENT_ID_PROPERTY, COMPONENT_CLIENT, COMPONENT_TYPE_PROPERTY,
    META_PROPERTY, RBAC_PROPERTY, SERVER_NAME_FILTERS_PROPERTY,
};

/// Observable client lifecycle and discovery events
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connected to the broker and subscribed for discovery
    Connected,
    /// Graceful shutdown finished
    Disconnected,
    /// A server's retained presence was received
    ServerDiscovered(ServerInfo),
    /// The initialize handshake with a server completed
    ServerInitialized(ServerInfo),
    /// A server went offline (presence cleared or disconnect notification)
    ServerDisconnected { server_id: String },
    /// A server announced a capability change (e.g. tools/list_changed)
    ServerCapabilityChanged { server_id: String, method: String },
    /// Any other notification a server pushed on the RPC topic
    ServerNotification {
        server_id: String,
        notification: JsonRpcNotification,
    },
    /// Broker-provided RBAC information from the CONNACK
    BrokerRbacInfo(Value),
    /// A non-fatal error on the ingress path
    Error(String),
}

struct ClientState {
    server_name_filter: String,
    discovered: HashMap<String, ServerInfo>,
    connected: HashSet<String>,
    running: bool,
}

struct ClientShared {
    config: ClientConfig,
    client_id: String,
    transport: Arc<dyn MqttTransport>,
    state: Mutex<ClientState>,
    pending: PendingRequests,
    events: mpsc::UnboundedSender<ClientEvent>,
}

/// MCP client peer over MQTT
pub struct McpClient {
    shared: Arc<ClientShared>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
}

impl McpClient {
    /// Create a client over the production MQTT transport
    ///
    /// When no `client_id` is configured a fresh one is generated, since a
    /// client re-initializing against the same server needs a distinct
    /// identity.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        let client_id = effective_client_id(&config);
        let transport: Arc<dyn MqttTransport> =
            Arc::new(RumqttcTransport::new(config.mqtt.clone(), client_id.clone()));
        Self::build(config, client_id, transport)
    }

    /// Create a client over a caller-supplied transport
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn MqttTransport>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let client_id = effective_client_id(&config);
        Self::build(config, client_id, transport)
    }

    fn build(
        config: ClientConfig,
        client_id: String,
        transport: Arc<dyn MqttTransport>,
    ) -> Result<Self, Error> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ClientShared {
            config,
            client_id,
            transport,
            state: Mutex::new(ClientState {
                server_name_filter: "#".to_string(),
                discovered: HashMap::new(),
                connected: HashSet::new(),
                running: false,
            }),
            pending: PendingRequests::new(),
            events: events_tx,
        });
        Ok(Self {
            shared,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        })
    }

    /// The MQTT client id this peer uses
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Take the event stream. Returns `None` after the first call.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events_rx.lock().ok().and_then(|mut guard| guard.take())
    }

    /// The server-name filter in effect (broker-suggested or `#`)
    pub async fn server_name_filter(&self) -> String {
        self.shared.state.lock().await.server_name_filter.clone()
    }

    /// Connect to the broker and start discovering servers
    pub async fn connect(&self) -> Result<(), Error> {
        {
            let state = self.shared.state.lock().await;
            if state.running {
                return Ok(());
            }
        }
        let shared = &self.shared;
        let config = &shared.config;

        // 1. Last-will tells servers this client died ungracefully
        let disconnected = JsonRpcNotification::new(notifications::DISCONNECTED, None);
        let will = WillConfig {
            topic: topics::client_presence(&shared.client_id),
            payload: serde_json::to_vec(&disconnected)?,
            qos: Default::default(),
            retain: false,
        };

        // 2. Connect, advertising identity and metadata
        let meta = json!({
            "version": MCP_PROTOCOL_VERSION,
            "implementation": {
                "name": config.name,
                "version": config.version,
            },
            "capabilities": config.capabilities,
        });
        let connect_options = ConnectOptions {
            will: Some(will),
            user_properties: vec![
                (
                    COMPONENT_TYPE_PROPERTY.to_string(),
                    COMPONENT_CLIENT.to_string(),
                ),
                (CLIENT_ID_PROPERTY.to_string(), shared.client_id.clone()),
                (META_PROPERTY.to_string(), meta.to_string()),
            ],
        };
        let (connack, messages) = shared.transport.connect(connect_options).await?;

        // 3. Broker suggestions from the CONNACK; malformed values are
        //    ignored and the defaults kept
        let filter = {
            let mut state = shared.state.lock().await;
            if let Some(raw) = connack.user_property(SERVER_NAME_FILTERS_PROPERTY) {
                match serde_json::from_str::<Vec<String>>(raw) {
                    Ok(filters) if !filters.is_empty() => {
                        info!(filter = %filters[0], "using broker-suggested server name filter");
                        state.server_name_filter = filters[0].clone();
                    }
                    Ok(_) => warn!("empty MCP-SERVER-NAME-FILTERS, keeping '#'"),
                    Err(err) => {
                        warn!(error = %err, "unparsable MCP-SERVER-NAME-FILTERS, keeping '#'")
                    }
                }
            }
            state.server_name_filter.clone()
        };
        if let Some(raw) = connack.user_property(RBAC_PROPERTY) {
            match serde_json::from_str::<Value>(raw) {
                Ok(rbac) => {
                    let _ = shared.events.send(ClientEvent::BrokerRbacInfo(rbac));
                }
                Err(err) => warn!(error = %err, "unparsable MCP-RBAC, ignoring"),
            }
        }

        // 4. Discovery and RPC subscriptions; No-Local on the RPC filter so
        //    our own requests are not echoed back
        shared
            .transport
            .subscribe(
                &topics::discovery_presence_filter(&filter),
                SubscribeOptions::default(),
            )
            .await?;
        shared
            .transport
            .subscribe(
                &topics::discovery_capability_filter(&filter),
                SubscribeOptions::default(),
            )
            .await?;
        shared
            .transport
            .subscribe(
                &topics::client_rpc_filter(&shared.client_id, &filter),
                SubscribeOptions {
                    no_local: true,
                    ..Default::default()
                },
            )
            .await?;

        {
            let mut state = shared.state.lock().await;
            state.running = true;
        }

        let ingress_shared = Arc::clone(shared);
        tokio::spawn(async move {
            ingress_loop(ingress_shared, messages).await;
        });

        info!(client_id = %shared.client_id, "client connected");
        let _ = shared.events.send(ClientEvent::Connected);
        Ok(())
    }

    /// Initialize a discovered server, transitioning it into a
    /// bidirectional RPC relationship
    pub async fn initialize_server(&self, server_id: &str) -> Result<ServerInfo, Error> {
        let shared = &self.shared;
        let server_name = {
            let state = shared.state.lock().await;
            if !state.running {
                return Err(Error::NotConnected("client is not connected".to_string()));
            }
            match state.discovered.get(server_id) {
                Some(info) => info.server_name.clone(),
                None => {
                    return Err(Error::NotConnected(format!(
                        "server '{}' has not been discovered",
                        server_id
                    )))
                }
            }
        };

        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: shared.config.capabilities.clone(),
            client_info: Implementation {
                name: shared.config.name.clone(),
                version: shared.config.version.clone(),
            },
        };
        let control_topic = topics::server_control(server_id, &server_name);
        let result = self
            .send_request(
                &control_topic,
                Some(server_id),
                methods::INITIALIZE,
                serde_json::to_value(&params)?,
                None,
            )
            .await?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|err| Error::Protocol(format!("invalid initialize result: {}", err)))?;

        // Merge the handshake result into the stored info; the server may
        // have vanished while we were waiting
        let info = {
            let mut state = shared.state.lock().await;
            let info = match state.discovered.get_mut(server_id) {
                Some(info) => {
                    info.display_name = Some(result.server_info.name.clone());
                    info.version = Some(result.server_info.version.clone());
                    info.capabilities = result.capabilities.clone();
                    info.clone()
                }
                None => {
                    return Err(Error::NotConnected(format!(
                        "server '{}' disappeared during initialization",
                        server_id
                    )))
                }
            };
            state.connected.insert(server_id.to_string());
            info
        };

        // Required follow-up so the server knows the handshake completed
        let initialized = JsonRpcNotification::new(notifications::INITIALIZED, None);
        let rpc_topic = topics::rpc(&shared.client_id, server_id, &server_name);
        self.publish_json(&rpc_topic, &initialized).await?;

        info!(server_id = %server_id, "server initialized");
        let _ = shared.events.send(ClientEvent::ServerInitialized(info.clone()));
        Ok(info)
    }

    /// List the tools of a connected server
    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<ToolDefinition>, Error> {
        let result = self
            .rpc_request(server_id, methods::TOOLS_LIST, json!({}), None)
            .await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| Error::Protocol("tools/list result lacks 'tools'".to_string()))?;
        serde_json::from_value(tools)
            .map_err(|err| Error::Protocol(format!("invalid tools/list result: {}", err)))
    }

    /// Invoke a tool on a connected server. Returns the full result object
    /// including `content` and `isError`.
    pub async fn call_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: Option<HashMap<String, Value>>,
    ) -> Result<Value, Error> {
        self.call_tool_with_timeout(server_id, name, arguments, None)
            .await
    }

    /// Invoke a tool with an explicit timeout override
    pub async fn call_tool_with_timeout(
        &self,
        server_id: &str,
        name: &str,
        arguments: Option<HashMap<String, Value>>,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        let params = json!({
            "name": name,
            "arguments": arguments.unwrap_or_default(),
        });
        self.rpc_request(server_id, methods::TOOLS_CALL, params, timeout)
            .await
    }

    /// List the resources of a connected server
    pub async fn list_resources(&self, server_id: &str) -> Result<Vec<ResourceDefinition>, Error> {
        let result = self
            .rpc_request(server_id, methods::RESOURCES_LIST, json!({}), None)
            .await?;
        let resources = result.get("resources").cloned().ok_or_else(|| {
            Error::Protocol("resources/list result lacks 'resources'".to_string())
        })?;
        serde_json::from_value(resources)
            .map_err(|err| Error::Protocol(format!("invalid resources/list result: {}", err)))
    }

    /// Read a resource by uri from a connected server
    pub async fn read_resource(&self, server_id: &str, uri: &str) -> Result<Value, Error> {
        self.rpc_request(server_id, methods::RESOURCES_READ, json!({ "uri": uri }), None)
            .await
    }

    /// Liveness probe; true iff the server answered `{pong: true}`
    pub async fn ping(&self, server_id: &str) -> Result<bool, Error> {
        let result = self
            .rpc_request(server_id, methods::PING, json!({}), None)
            .await?;
        Ok(result.get("pong").and_then(Value::as_bool) == Some(true))
    }

    /// Send an arbitrary request to a connected server with an optional
    /// timeout override
    pub async fn request_with_timeout(
        &self,
        server_id: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        self.rpc_request(server_id, method, params, timeout).await
    }

    /// Servers currently known through retained presence
    pub async fn discovered_servers(&self) -> Vec<ServerInfo> {
        let state = self.shared.state.lock().await;
        let mut servers: Vec<ServerInfo> = state.discovered.values().cloned().collect();
        servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        servers
    }

    /// Servers with a completed initialize handshake
    pub async fn connected_servers(&self) -> Vec<ServerInfo> {
        let state = self.shared.state.lock().await;
        let mut servers: Vec<ServerInfo> = state
            .connected
            .iter()
            .filter_map(|server_id| state.discovered.get(server_id).cloned())
            .collect();
        servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        servers
    }

    /// Whether the server is in the connected set
    pub async fn is_server_connected(&self, server_id: &str) -> bool {
        self.shared.state.lock().await.connected.contains(server_id)
    }

    /// Number of requests still awaiting a response (diagnostics)
    pub fn pending_request_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Gracefully disconnect: notify every connected server, clear our
    /// presence, cancel outstanding requests, and drop the session.
    /// Calling `disconnect` twice is a no-op on the second call.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let connected: Vec<(String, String)> = {
            let mut state = self.shared.state.lock().await;
            if !state.running {
                return Ok(());
            }
            state.running = false;
            state
                .connected
                .iter()
                .filter_map(|server_id| {
                    state
                        .discovered
                        .get(server_id)
                        .map(|info| (server_id.clone(), info.server_name.clone()))
                })
                .collect()
        };

        let disconnected = JsonRpcNotification::new(notifications::DISCONNECTED, None);
        for (server_id, server_name) in &connected {
            let rpc_topic = topics::rpc(&self.shared.client_id, server_id, server_name);
            if let Err(err) = self.publish_json(&rpc_topic, &disconnected).await {
                warn!(server_id = %server_id, error = %err, "failed to notify server of disconnect");
            }
        }
        let presence_topic = topics::client_presence(&self.shared.client_id);
        if let Err(err) = self.publish_json(&presence_topic, &disconnected).await {
            warn!(error = %err, "failed to publish disconnect presence");
        }

        self.shared.pending.cancel_all();
        self.shared.transport.disconnect().await?;

        info!(client_id = %self.shared.client_id, "client disconnected");
        let _ = self.shared.events.send(ClientEvent::Disconnected);
        Ok(())
    }

    async fn publish_json(&self, topic: &str, body: &impl serde::Serialize) -> Result<(), Error> {
        publish_json(&self.shared, topic, body).await
    }

    /// Resolve the RPC topic for a connected server and send a request
    async fn rpc_request(
        &self,
        server_id: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        let server_name = {
            let state = self.shared.state.lock().await;
            if !state.running {
                return Err(Error::NotConnected("client is not connected".to_string()));
            }
            if !state.connected.contains(server_id) {
                return Err(Error::NotConnected(format!(
                    "server '{}' is not connected",
                    server_id
                )));
            }
            match state.discovered.get(server_id) {
                Some(info) => info.server_name.clone(),
                None => {
                    return Err(Error::NotConnected(format!(
                        "server '{}' is not connected",
                        server_id
                    )))
                }
            }
        };
        let topic = topics::rpc(&self.shared.client_id, server_id, &server_name);
        self.send_request(&topic, Some(server_id), method, params, timeout)
            .await
    }

    /// Publish a request and await its correlated response under the
    /// per-method deadline
    async fn send_request(
        &self,
        topic: &str,
        server_id: Option<&str>,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        let shared = &self.shared;
        let correlation_id = Uuid::new_v4().to_string();
        let receiver = shared.pending.insert(
            correlation_id.clone(),
            method,
            server_id.map(|s| s.to_string()),
        );

        let request = JsonRpcRequest::new(correlation_id.clone(), method, Some(params));
        if let Err(err) = self.publish_json(topic, &request).await {
            shared.pending.remove(&correlation_id);
            return Err(err);
        }

        let deadline = timeout.unwrap_or_else(|| default_timeout(method));
        match tokio::time::timeout(deadline, receiver).await {
            Ok(Ok(outcome)) => outcome,
            // Completion slot dropped: shutdown raced us
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                shared.pending.remove(&correlation_id);
                Err(Error::RequestTimeout {
                    method: method.to_string(),
                    elapsed_ms: deadline.as_millis() as u64,
                })
            }
        }
    }
}

fn effective_client_id(config: &ClientConfig) -> String {
    config
        .client_id
        .clone()
        .unwrap_or_else(|| format!("mcp-client-{}", Uuid::new_v4()))
}

fn standard_properties(client_id: &str) -> Vec<(String, String)> {
    vec![
        (
            COMPONENT_TYPE_PROPERTY.to_string(),
            COMPONENT_CLIENT.to_string(),
        ),
        (CLIENT_ID_PROPERTY.to_string(), client_id.to_string()),
    ]
}

async fn publish_json(
    shared: &Arc<ClientShared>,
    topic: &str,
    body: &impl serde::Serialize,
) -> Result<(), Error> {
    let payload = serde_json::to_vec(body)?;
    shared
        .transport
        .publish(
            topic,
            payload,
            PublishOptions {
                user_properties: standard_properties(&shared.client_id),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

async fn ingress_loop(
    shared: Arc<ClientShared>,
    mut messages: mpsc::UnboundedReceiver<InboundMessage>,
) {
    while let Some(message) = messages.recv().await {
        if let Err(err) = route(&shared, message).await {
            warn!(error = %err, "ingress error");
            let _ = shared.events.send(ClientEvent::Error(err.to_string()));
        }
    }
    debug!("client ingress loop ended");
}

async fn route(shared: &Arc<ClientShared>, message: InboundMessage) -> Result<(), Error> {
    match TopicKind::parse(&message.topic) {
        Some(TopicKind::ServerPresence { server_id, .. }) => {
            handle_presence(shared, &server_id, &message).await
        }
        Some(TopicKind::ServerCapability { server_id, .. }) => {
            match serde_json::from_slice::<JsonRpcNotification>(&message.payload) {
                Ok(notification) => {
                    let _ = shared.events.send(ClientEvent::ServerCapabilityChanged {
                        server_id,
                        method: notification.method,
                    });
                }
                Err(err) => {
                    warn!(server_id = %server_id, error = %err, "malformed capability change, dropping")
                }
            }
            Ok(())
        }
        Some(TopicKind::Rpc {
            client_id,
            server_id,
            ..
        }) if client_id == shared.client_id => handle_rpc(shared, &server_id, &message).await,
        _ => {
            debug!(topic = %message.topic, "unrecognized topic, dropping");
            Ok(())
        }
    }
}

/// Handle a message on a server's presence topic
async fn handle_presence(
    shared: &Arc<ClientShared>,
    server_id: &str,
    message: &InboundMessage,
) -> Result<(), Error> {
    // Retained-empty is the offline sentinel; it is not valid JSON
    if message.payload.is_empty() {
        let known = {
            let mut state = shared.state.lock().await;
            let discovered = state.discovered.remove(server_id).is_some();
            let connected = state.connected.remove(server_id);
            discovered || connected
        };
        if known {
            info!(server_id = %server_id, "server went offline");
            let _ = shared.events.send(ClientEvent::ServerDisconnected {
                server_id: server_id.to_string(),
            });
        }
        return Ok(());
    }

    let notification: JsonRpcNotification = match serde_json::from_slice(&message.payload) {
        Ok(notification) => notification,
        Err(err) => {
            warn!(server_id = %server_id, error = %err, "malformed presence payload, dropping");
            return Ok(());
        }
    };
    if notification.method != notifications::SERVER_ONLINE {
        debug!(server_id = %server_id, method = %notification.method, "ignoring presence notification");
        return Ok(());
    }
    let params: ServerOnlineParams = match notification
        .params
        .ok_or_else(|| Error::Protocol("online notification lacks params".to_string()))
        .and_then(|params| serde_json::from_value(params).map_err(Error::from))
    {
        Ok(params) => params,
        Err(err) => {
            warn!(server_id = %server_id, error = %err, "invalid online notification, dropping");
            return Ok(());
        }
    };

    let info = ServerInfo {
        server_id: server_id.to_string(),
        server_name: params.server_name,
        description: params.description,
        display_name: None,
        version: None,
        capabilities: Default::default(),
        rbac: params.meta.and_then(|meta| meta.rbac),
    };
    {
        let mut state = shared.state.lock().await;
        state.discovered.insert(server_id.to_string(), info.clone());
    }
    info!(server_id = %server_id, server_name = %info.server_name, "server discovered");
    let _ = shared.events.send(ClientEvent::ServerDiscovered(info));
    Ok(())
}

/// Handle a message on our RPC topic: correlate responses, recognize
/// disconnect notifications, surface everything else as an event
async fn handle_rpc(
    shared: &Arc<ClientShared>,
    server_id: &str,
    message: &InboundMessage,
) -> Result<(), Error> {
    let body: Value = match serde_json::from_slice(&message.payload) {
        Ok(body) => body,
        Err(err) => {
            warn!(server_id = %server_id, error = %err, "malformed rpc payload, dropping");
            return Ok(());
        }
    };

    if let Some(id) = body.get("id").filter(|id| !id.is_null()) {
        let correlation_id = match id {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => {
                warn!(server_id = %server_id, "rpc message with malformed id, dropping");
                return Ok(());
            }
        };
        if !shared.pending.contains(&correlation_id) {
            debug!(id = %correlation_id, "response for unknown request, dropping");
            return Ok(());
        }
        let outcome = match serde_json::from_value::<JsonRpcResponse>(body) {
            Ok(response) => match (response.result, response.error) {
                (_, Some(error)) => Err(Error::from_rpc_error(error)),
                (Some(result), None) => Ok(result),
                (None, None) => Err(Error::Mcp {
                    code: error_codes::INVALID_MESSAGE,
                    message: "response carries neither result nor error".to_string(),
                    data: None,
                }),
            },
            Err(err) => Err(Error::Mcp {
                code: error_codes::INVALID_MESSAGE,
                message: format!("unparsable response: {}", err),
                data: None,
            }),
        };
        shared.pending.complete(&correlation_id, outcome);
        return Ok(());
    }

    let notification: JsonRpcNotification = match serde_json::from_value(body) {
        Ok(notification) => notification,
        Err(err) => {
            warn!(server_id = %server_id, error = %err, "malformed rpc notification, dropping");
            return Ok(());
        }
    };
    if notification.method == notifications::DISCONNECTED {
        let was_connected = {
            let mut state = shared.state.lock().await;
            state.connected.remove(server_id)
        };
        if was_connected {
            info!(server_id = %server_id, "server sent disconnect");
            let _ = shared.events.send(ClientEvent::ServerDisconnected {
                server_id: server_id.to_string(),
            });
        }
        return Ok(());
    }
    debug!(server_id = %server_id, method = %notification.method, "server notification");
    let _ = shared.events.send(ClientEvent::ServerNotification {
        server_id: server_id.to_string(),
        notification,
    });
    Ok(())
}

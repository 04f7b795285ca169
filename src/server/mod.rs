/// Server peer
///
/// Publishes tools and resources for remote invocation. The server owns a
/// retained presence topic (cleared by its last-will if the session dies),
/// listens for `initialize` requests on its control topic, and serves every
/// other method on per-client RPC topics. Per-client subscriptions are added
/// only after the initialize response is published and removed when the
/// client goes away, so the subscription set stays bounded by the set of
/// connected clients.

mod registry;

pub use registry::{HandlerError, ResourceHandler, ToolHandler};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::Error;
use crate::protocol::{
    error_codes, methods, notifications, Implementation, InitializeResult, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ResourceDefinition, ServerOnlineMeta,
    ServerOnlineParams, ToolDefinition, MCP_PROTOCOL_VERSION,
};
use crate::topics::{self, TopicKind};
use crate::transport::{
    ConnectOptions, InboundMessage, MqttTransport, PublishOptions, RumqttcTransport,
    SubscribeOptions, WillConfig, CLIENT_ID_PROPERTY, COMPONENT_SERVER, COMPONENT_TYPE_PROPERTY,
    META_PROPERTY,
};

use registry::{ResourceRegistry, ToolRegistry};

/// Observable server lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Startup finished: presence is retained on the broker
    Ready,
    /// A non-fatal error on the ingress path
    Error(String),
    /// The server has shut down
    Closed,
}

/// The four topics computed from the server's identifiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTopics {
    pub control: String,
    pub capability: String,
    pub presence: String,
    pub rpc_pattern: String,
}

impl ServerTopics {
    fn compute(server_id: &str, server_name: &str) -> Self {
        Self {
            control: topics::server_control(server_id, server_name),
            capability: topics::server_capability(server_id, server_name),
            presence: topics::server_presence(server_id, server_name),
            rpc_pattern: topics::server_rpc_filter(server_id, server_name),
        }
    }
}

/// Optional fields of a resource registration
#[derive(Debug, Clone, Default)]
pub struct ResourceOptions {
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

struct ServerState {
    tools: ToolRegistry,
    resources: ResourceRegistry,
    connected_clients: HashSet<String>,
    initialized: bool,
    running: bool,
}

struct ServerShared {
    config: ServerConfig,
    topics: ServerTopics,
    transport: Arc<dyn MqttTransport>,
    state: Mutex<ServerState>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

/// MCP server peer over MQTT
pub struct McpServer {
    shared: Arc<ServerShared>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
}

impl McpServer {
    /// Create a server over the production MQTT transport. The server's
    /// `server_id` doubles as the MQTT client id.
    pub fn new(config: ServerConfig) -> Result<Self, Error> {
        config.validate()?;
        let transport: Arc<dyn MqttTransport> = Arc::new(RumqttcTransport::new(
            config.mqtt.clone(),
            config.server_id.clone(),
        ));
        Self::with_transport(config, transport)
    }

    /// Create a server over a caller-supplied transport
    pub fn with_transport(
        config: ServerConfig,
        transport: Arc<dyn MqttTransport>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let topics = ServerTopics::compute(&config.server_id, &config.server_name);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ServerShared {
            config,
            topics,
            transport,
            state: Mutex::new(ServerState {
                tools: ToolRegistry::default(),
                resources: ResourceRegistry::default(),
                connected_clients: HashSet::new(),
                initialized: false,
                running: false,
            }),
            events: events_tx,
        });
        Ok(Self {
            shared,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        })
    }

    /// Take the event stream. Returns `None` after the first call.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.events_rx.lock().ok().and_then(|mut guard| guard.take())
    }

    /// The topics this server uses on the wire
    pub fn topics(&self) -> &ServerTopics {
        &self.shared.topics
    }

    /// Connect to the broker, announce presence, and start serving
    ///
    /// The startup order is load-bearing: the last-will is registered
    /// before connecting, subscriptions are in place before the retained
    /// presence is published, so no initialize request can be lost.
    pub async fn start(&self) -> Result<(), Error> {
        {
            let state = self.shared.state.lock().await;
            if state.running {
                return Ok(());
            }
        }
        let shared = &self.shared;
        let config = &shared.config;

        // 1. Last-will clears the retained presence if the session dies
        let will = WillConfig {
            topic: shared.topics.presence.clone(),
            payload: Vec::new(),
            qos: Default::default(),
            retain: true,
        };

        // 2. Connect, advertising identity and metadata
        let meta = json!({
            "version": MCP_PROTOCOL_VERSION,
            "implementation": {
                "name": config.name,
                "version": config.version,
            },
            "serverName": config.server_name,
            "description": config.description,
            "rbac": config.rbac,
        });
        let connect_options = ConnectOptions {
            will: Some(will),
            user_properties: vec![
                (
                    COMPONENT_TYPE_PROPERTY.to_string(),
                    COMPONENT_SERVER.to_string(),
                ),
                (CLIENT_ID_PROPERTY.to_string(), config.server_id.clone()),
                (META_PROPERTY.to_string(), meta.to_string()),
            ],
        };
        let (_connack, messages) = shared.transport.connect(connect_options).await?;

        // 3. Control topic carries initialize requests
        shared
            .transport
            .subscribe(&shared.topics.control, SubscribeOptions::default())
            .await?;

        // 4. RPC pattern with No-Local so we never see our own responses
        shared
            .transport
            .subscribe(
                &shared.topics.rpc_pattern,
                SubscribeOptions {
                    no_local: true,
                    ..Default::default()
                },
            )
            .await?;

        // 5. Retained presence announces this server to current and future
        //    subscribers
        let online = JsonRpcNotification::new(
            notifications::SERVER_ONLINE,
            Some(serde_json::to_value(ServerOnlineParams {
                server_name: config.server_name.clone(),
                description: config.description.clone(),
                meta: config.rbac.clone().map(|rbac| ServerOnlineMeta { rbac: Some(rbac) }),
            })?),
        );
        publish_json(shared, &shared.topics.presence, &online, true).await?;

        {
            let mut state = shared.state.lock().await;
            state.running = true;
        }

        let ingress_shared = Arc::clone(shared);
        tokio::spawn(async move {
            ingress_loop(ingress_shared, messages).await;
        });

        info!(server_id = %config.server_id, server_name = %config.server_name, "server online");
        let _ = shared.events.send(ServerEvent::Ready);
        Ok(())
    }

    /// Register a tool
    ///
    /// After initialization this publishes `notifications/tools/list_changed`
    /// on the capability topic iff the server declared that capability.
    pub async fn register_tool<H>(
        &self,
        name: impl Into<String>,
        description: Option<String>,
        input_schema: Value,
        handler: H,
    ) -> Result<(), Error>
    where
        H: ToolHandler + 'static,
    {
        let definition = ToolDefinition {
            name: name.into(),
            description,
            input_schema,
        };
        let name = definition.name.clone();
        let notify = {
            let mut state = self.shared.state.lock().await;
            state.tools.insert(definition, Arc::new(handler));
            state.running
                && state.initialized
                && self.shared.config.capabilities.tools_list_changed()
        };
        debug!(tool = %name, notify, "tool registered");
        if notify {
            let notification =
                JsonRpcNotification::new(notifications::TOOLS_LIST_CHANGED, None);
            publish_json(&self.shared, &self.shared.topics.capability, &notification, false)
                .await?;
        }
        Ok(())
    }

    /// Register a resource, addressed by uri
    pub async fn register_resource<H>(
        &self,
        uri: impl Into<String>,
        name: impl Into<String>,
        handler: H,
        options: ResourceOptions,
    ) -> Result<(), Error>
    where
        H: ResourceHandler + 'static,
    {
        let definition = ResourceDefinition {
            uri: uri.into(),
            name: name.into(),
            description: options.description,
            mime_type: options.mime_type,
        };
        let uri = definition.uri.clone();
        let notify = {
            let mut state = self.shared.state.lock().await;
            state.resources.insert(definition, Arc::new(handler));
            state.running
                && state.initialized
                && self.shared.config.capabilities.resources_list_changed()
        };
        debug!(resource = %uri, notify, "resource registered");
        if notify {
            let notification =
                JsonRpcNotification::new(notifications::RESOURCES_LIST_CHANGED, None);
            publish_json(&self.shared, &self.shared.topics.capability, &notification, false)
                .await?;
        }
        Ok(())
    }

    /// Client ids with an established RPC relationship
    pub async fn connected_clients(&self) -> Vec<String> {
        let state = self.shared.state.lock().await;
        let mut clients: Vec<String> = state.connected_clients.iter().cloned().collect();
        clients.sort();
        clients
    }

    /// Clear the retained presence and disconnect. Calling `stop` on a
    /// stopped server is a no-op.
    pub async fn stop(&self) -> Result<(), Error> {
        {
            let mut state = self.shared.state.lock().await;
            if !state.running {
                return Ok(());
            }
            state.running = false;
        }

        // Retained-empty payload is the offline sentinel
        self.shared
            .transport
            .publish(
                &self.shared.topics.presence,
                Vec::new(),
                PublishOptions {
                    retain: true,
                    user_properties: standard_properties(&self.shared.config.server_id),
                    ..Default::default()
                },
            )
            .await?;
        self.shared.transport.disconnect().await?;
        info!(server_id = %self.shared.config.server_id, "server stopped");
        let _ = self.shared.events.send(ServerEvent::Closed);
        Ok(())
    }
}

fn standard_properties(server_id: &str) -> Vec<(String, String)> {
    vec![
        (
            COMPONENT_TYPE_PROPERTY.to_string(),
            COMPONENT_SERVER.to_string(),
        ),
        (CLIENT_ID_PROPERTY.to_string(), server_id.to_string()),
    ]
}

async fn publish_json(
    shared: &Arc<ServerShared>,
    topic: &str,
    body: &impl serde::Serialize,
    retain: bool,
) -> Result<(), Error> {
    let payload = serde_json::to_vec(body)?;
    shared
        .transport
        .publish(
            topic,
            payload,
            PublishOptions {
                retain,
                user_properties: standard_properties(&shared.config.server_id),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

async fn ingress_loop(
    shared: Arc<ServerShared>,
    mut messages: mpsc::UnboundedReceiver<InboundMessage>,
) {
    while let Some(message) = messages.recv().await {
        if let Err(err) = route(&shared, message).await {
            warn!(error = %err, "ingress error");
            let _ = shared.events.send(ServerEvent::Error(err.to_string()));
        }
    }
    debug!("server ingress loop ended");
}

async fn route(shared: &Arc<ServerShared>, message: InboundMessage) -> Result<(), Error> {
    match TopicKind::parse(&message.topic) {
        Some(TopicKind::ServerControl {
            server_id,
            server_name,
        }) if server_id == shared.config.server_id
            && server_name == shared.config.server_name =>
        {
            handle_initialize(shared, message).await
        }
        Some(TopicKind::Rpc {
            client_id,
            server_id,
            ..
        }) if server_id == shared.config.server_id => {
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                if let Err(err) = dispatch_rpc(&shared, &client_id, message).await {
                    warn!(error = %err, "rpc dispatch error");
                    let _ = shared.events.send(ServerEvent::Error(err.to_string()));
                }
            });
            Ok(())
        }
        Some(TopicKind::ClientCapability { client_id }) => {
            debug!(client_id = %client_id, "client capability change observed");
            Ok(())
        }
        Some(TopicKind::ClientPresence { client_id }) => {
            handle_client_presence(shared, &client_id, &message).await
        }
        _ => {
            debug!(topic = %message.topic, "unrecognized topic, dropping");
            Ok(())
        }
    }
}

/// Handle an `initialize` request arriving on the control topic
///
/// The client id comes from the `MCP-MQTT-CLIENT-ID` user property, not
/// the topic. The response is published before the per-client topics are
/// subscribed so the client can start using RPC immediately.
async fn handle_initialize(
    shared: &Arc<ServerShared>,
    message: InboundMessage,
) -> Result<(), Error> {
    let client_id = match message.user_property(CLIENT_ID_PROPERTY) {
        Some(client_id) => client_id.to_string(),
        None => {
            warn!("control message without MCP-MQTT-CLIENT-ID, dropping");
            return Ok(());
        }
    };
    let request: JsonRpcRequest = match serde_json::from_slice(&message.payload) {
        Ok(request) => request,
        Err(err) => {
            warn!(client_id = %client_id, error = %err, "malformed control message, dropping");
            return Ok(());
        }
    };
    if request.method != methods::INITIALIZE {
        warn!(client_id = %client_id, method = %request.method, "unexpected method on control topic, dropping");
        return Ok(());
    }

    {
        let mut state = shared.state.lock().await;
        state.initialized = true;
    }

    let result = InitializeResult {
        protocol_version: MCP_PROTOCOL_VERSION.to_string(),
        capabilities: shared.config.capabilities.clone(),
        server_info: Implementation {
            name: shared.config.name.clone(),
            version: shared.config.version.clone(),
        },
    };
    let response = JsonRpcResponse::success(request.id, serde_json::to_value(result)?);
    let rpc_topic = topics::rpc(
        &client_id,
        &shared.config.server_id,
        &shared.config.server_name,
    );
    publish_json(shared, &rpc_topic, &response, false).await?;

    // Only after the response: per-client subscriptions for later
    // unilateral events
    shared
        .transport
        .subscribe(
            &topics::client_capability(&client_id),
            SubscribeOptions::default(),
        )
        .await?;
    shared
        .transport
        .subscribe(
            &topics::client_presence(&client_id),
            SubscribeOptions::default(),
        )
        .await?;

    {
        let mut state = shared.state.lock().await;
        state.connected_clients.insert(client_id.clone());
    }
    info!(client_id = %client_id, "client initialized");
    Ok(())
}

async fn dispatch_rpc(
    shared: &Arc<ServerShared>,
    client_id: &str,
    message: InboundMessage,
) -> Result<(), Error> {
    let parsed = match JsonRpcMessage::from_slice(&message.payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            // No id to respond to; drop per the ingress error policy
            warn!(client_id = %client_id, error = %err, "malformed rpc payload, dropping");
            return Ok(());
        }
    };
    let request = match parsed {
        JsonRpcMessage::Request(request) => request,
        JsonRpcMessage::Notification(notification) => {
            debug!(client_id = %client_id, method = %notification.method, "rpc notification observed");
            return Ok(());
        }
        JsonRpcMessage::Response(_) => {
            debug!(client_id = %client_id, "stray response on rpc topic, dropping");
            return Ok(());
        }
    };

    let response = handle_request(shared, request).await;
    let rpc_topic = topics::rpc(
        client_id,
        &shared.config.server_id,
        &shared.config.server_name,
    );
    publish_json(shared, &rpc_topic, &response, false).await
}

async fn handle_request(shared: &Arc<ServerShared>, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone();
    match request.method.as_str() {
        methods::TOOLS_LIST => {
            let definitions = {
                let state = shared.state.lock().await;
                state.tools.definitions()
            };
            JsonRpcResponse::success(id, json!({ "tools": definitions }))
        }
        methods::TOOLS_CALL => handle_tools_call(shared, request).await,
        methods::RESOURCES_LIST => {
            let definitions = {
                let state = shared.state.lock().await;
                state.resources.definitions()
            };
            JsonRpcResponse::success(id, json!({ "resources": definitions }))
        }
        methods::RESOURCES_READ => handle_resources_read(shared, request).await,
        methods::PING => JsonRpcResponse::success(id, json!({ "pong": true })),
        other => JsonRpcResponse::error(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("Method '{}' not found", other),
            None,
        ),
    }
}

async fn handle_tools_call(
    shared: &Arc<ServerShared>,
    request: JsonRpcRequest,
) -> JsonRpcResponse {
    let id = request.id.clone();
    let params = request.params.unwrap_or_else(|| json!({}));
    let name = match params.get("name").and_then(Value::as_str) {
        Some(name) => name.to_string(),
        None => {
            return JsonRpcResponse::error(
                id,
                error_codes::INVALID_PARAMS,
                "Missing tool name".to_string(),
                None,
            )
        }
    };
    let arguments: HashMap<String, Value> = match params.get("arguments") {
        None | Some(Value::Null) => HashMap::new(),
        Some(value) => match serde_json::from_value(value.clone()) {
            Ok(arguments) => arguments,
            Err(err) => {
                return JsonRpcResponse::error(
                    id,
                    error_codes::INVALID_PARAMS,
                    format!("Invalid arguments: {}", err),
                    None,
                )
            }
        },
    };

    let handler = {
        let state = shared.state.lock().await;
        state.tools.handler(&name)
    };
    let handler = match handler {
        Some(handler) => handler,
        None => {
            return JsonRpcResponse::error(
                id,
                error_codes::TOOL_NOT_FOUND,
                format!("Tool not found: {}", name),
                None,
            )
        }
    };

    match handler.call(arguments).await {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(err) => JsonRpcResponse::error(
            id,
            error_codes::INTERNAL_ERROR,
            err.to_string(),
            None,
        ),
    }
}

async fn handle_resources_read(
    shared: &Arc<ServerShared>,
    request: JsonRpcRequest,
) -> JsonRpcResponse {
    let id = request.id.clone();
    let params = request.params.unwrap_or_else(|| json!({}));
    let uri = match params.get("uri").and_then(Value::as_str) {
        Some(uri) => uri.to_string(),
        None => {
            return JsonRpcResponse::error(
                id,
                error_codes::INVALID_PARAMS,
                "Missing resource uri".to_string(),
                None,
            )
        }
    };

    let handler = {
        let state = shared.state.lock().await;
        state.resources.handler(&uri)
    };
    let handler = match handler {
        Some(handler) => handler,
        None => {
            return JsonRpcResponse::error(
                id,
                error_codes::RESOURCE_NOT_FOUND,
                format!("Resource not found: {}", uri),
                None,
            )
        }
    };

    match handler.read(&uri).await {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(err) => JsonRpcResponse::error(
            id,
            error_codes::INTERNAL_ERROR,
            err.to_string(),
            None,
        ),
    }
}

/// Handle a message on a connected client's presence topic
///
/// An empty payload or a `notifications/disconnected` both evict the
/// client; a payload that fails to parse still evicts it.
async fn handle_client_presence(
    shared: &Arc<ServerShared>,
    client_id: &str,
    message: &InboundMessage,
) -> Result<(), Error> {
    if message.payload.is_empty() {
        return evict_client(shared, client_id).await;
    }
    match serde_json::from_slice::<JsonRpcNotification>(&message.payload) {
        Ok(notification) if notification.method == notifications::DISCONNECTED => {
            evict_client(shared, client_id).await
        }
        Ok(notification) => {
            warn!(client_id = %client_id, method = %notification.method, "unexpected presence payload, evicting");
            evict_client(shared, client_id).await
        }
        Err(err) => {
            warn!(client_id = %client_id, error = %err, "unparsable presence payload, evicting");
            evict_client(shared, client_id).await
        }
    }
}

async fn evict_client(shared: &Arc<ServerShared>, client_id: &str) -> Result<(), Error> {
    let was_connected = {
        let mut state = shared.state.lock().await;
        state.connected_clients.remove(client_id)
    };
    if !was_connected {
        return Ok(());
    }
    info!(client_id = %client_id, "client disconnected");
    shared
        .transport
        .unsubscribe(&topics::client_capability(client_id))
        .await?;
    shared
        .transport
        .unsubscribe(&topics::client_presence(client_id))
        .await?;
    Ok(())
}

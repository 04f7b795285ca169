/// MCP data model types
///
/// Tool and resource definitions, the capability records exchanged during
/// initialization, and the server metadata a client accumulates about each
/// discovered server. Wire field names follow the MCP JSON conventions
/// (camelCase), so every struct here carries explicit serde renames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol version sent by the client and returned by the server
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Definition of a tool exposed by a server
///
/// `input_schema` is an opaque JSON Schema value passed through verbatim;
/// the transport never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name, unique within a server
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema describing the tool arguments
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Definition of a resource exposed by a server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDefinition {
    /// Resource uri, unique within a server
    pub uri: String,
    /// Human-readable name
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the resource content
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A single content item in a tool result (text content)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContent {
    /// Content type discriminator, usually "text"
    #[serde(rename = "type")]
    pub content_type: String,
    /// The actual content
    pub text: String,
}

impl ToolContent {
    /// Create a text content item
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: text.into(),
        }
    }
}

/// Structured result of a tool invocation
///
/// `is_error = true` marks a negative application outcome. This is NOT a
/// JSON-RPC error: the response is still a successful one, it just carries
/// a failed business result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Tool output content items
    pub content: Vec<ToolContent>,
    /// Whether the tool reported an application-level failure
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Build a successful text result
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: false,
        }
    }

    /// Build an application-level error result
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: true,
        }
    }
}

/// Capability record with list-change notification support
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsCapability {
    /// Whether the server emits `notifications/tools/list_changed`
    #[serde(rename = "listChanged", default)]
    pub list_changed: bool,
}

/// Resource capability record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcesCapability {
    /// Whether the server supports `resources/subscribe`
    #[serde(default)]
    pub subscribe: bool,
    /// Whether the server emits `notifications/resources/list_changed`
    #[serde(rename = "listChanged", default)]
    pub list_changed: bool,
}

/// Prompt capability record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptsCapability {
    #[serde(rename = "listChanged", default)]
    pub list_changed: bool,
}

/// Logging capability marker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingCapability {}

/// Roots capability record (client side)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootsCapability {
    #[serde(rename = "listChanged", default)]
    pub list_changed: bool,
}

/// Sampling capability marker (client side)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingCapability {}

/// Capabilities a server declares during initialization
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

impl ServerCapabilities {
    /// Whether tools/list_changed notifications are declared
    pub fn tools_list_changed(&self) -> bool {
        self.tools.as_ref().map(|t| t.list_changed).unwrap_or(false)
    }

    /// Whether resources/list_changed notifications are declared
    pub fn resources_list_changed(&self) -> bool {
        self.resources
            .as_ref()
            .map(|r| r.list_changed)
            .unwrap_or(false)
    }
}

/// Capabilities a client declares during initialization
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingCapability>,
}

/// Name and version of a peer implementation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

/// Parameters of an `initialize` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
}

/// Result of a successful `initialize` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: Implementation,
}

/// List of tool or resource names, or the literal "all"
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllowList {
    /// The literal keyword "all"
    Keyword(String),
    /// An explicit list of names
    List(Vec<String>),
}

impl AllowList {
    /// Whether the given name is allowed by this list
    pub fn allows(&self, name: &str) -> bool {
        match self {
            AllowList::Keyword(k) => k == "all",
            AllowList::List(names) => names.iter().any(|n| n == name),
        }
    }
}

/// A named RBAC role enumerating what its holders may invoke
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RbacRole {
    pub name: String,
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<AllowList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_resources: Option<AllowList>,
}

/// Optional RBAC metadata a server advertises alongside its presence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RbacConfig {
    pub roles: Vec<RbacRole>,
}

/// Everything a client knows about a discovered server
///
/// `display_name`, `version` and the real `capabilities` are only filled in
/// after a successful initialize handshake; until then the capabilities are
/// all defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rbac: Option<RbacConfig>,
}

/// Parameters of the retained `notifications/server/online` presence payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOnlineParams {
    pub server_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ServerOnlineMeta>,
}

/// Optional metadata block of the online notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOnlineMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rbac: Option<RbacConfig>,
}

/// MCP method names used on the wire
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
}

/// MCP notification names used on the wire
pub mod notifications {
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const DISCONNECTED: &str = "notifications/disconnected";
    pub const SERVER_ONLINE: &str = "notifications/server/online";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_definition_uses_camel_case_schema_key() {
        let tool = ToolDefinition {
            name: "add".to_string(),
            description: Some("Add two numbers".to_string()),
            input_schema: json!({"type": "object"}),
        };
        let encoded = serde_json::to_value(&tool).unwrap();
        assert!(encoded.get("inputSchema").is_some());
        assert!(encoded.get("input_schema").is_none());
    }

    #[test]
    fn capability_booleans_default_to_false() {
        let caps: ServerCapabilities = serde_json::from_value(json!({
            "tools": {},
            "resources": {"subscribe": true}
        }))
        .unwrap();
        assert!(!caps.tools_list_changed());
        assert!(!caps.resources_list_changed());
        assert!(caps.resources.as_ref().unwrap().subscribe);
        assert!(caps.logging.is_none());
    }

    #[test]
    fn allow_list_accepts_keyword_and_list() {
        let all: AllowList = serde_json::from_value(json!("all")).unwrap();
        assert!(all.allows("anything"));

        let some: AllowList = serde_json::from_value(json!(["add", "sub"])).unwrap();
        assert!(some.allows("add"));
        assert!(!some.allows("mul"));

        // A keyword other than "all" allows nothing
        let none: AllowList = serde_json::from_value(json!("none")).unwrap();
        assert!(!none.allows("add"));
    }

    #[test]
    fn tool_call_result_round_trip() {
        let result = ToolCallResult::error("boom");
        let encoded = serde_json::to_value(&result).unwrap();
        assert_eq!(encoded["isError"], json!(true));
        assert_eq!(encoded["content"][0]["type"], json!("text"));

        // isError defaults to false when absent
        let decoded: ToolCallResult =
            serde_json::from_value(json!({"content": [{"type": "text", "text": "3"}]})).unwrap();
        assert!(!decoded.is_error);
    }
}

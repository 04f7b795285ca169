/// Topic scheme for the MCP-over-MQTT wire
///
/// All MCP traffic lives under three reserved prefixes: `$mcp-server` for
/// control, capability and presence topics, `$mcp-client` for per-client
/// capability and presence topics, and `$mcp-rpc` for the per-(client,
/// server) request/response channel. This module computes the canonical
/// topic strings and parses inbound topics into a tagged [`TopicKind`] so
/// the ingress routers never re-split strings.

/// Reserved prefix for server-owned topics
pub const SERVER_PREFIX: &str = "$mcp-server";
/// Reserved prefix for client-owned topics
pub const CLIENT_PREFIX: &str = "$mcp-client";
/// Reserved prefix for RPC channels
pub const RPC_PREFIX: &str = "$mcp-rpc";

/// Segment introducing capability-change topics under both prefixes
const CAPABILITY_SEGMENT: &str = "capability";
/// Segment introducing presence topics under both prefixes
const PRESENCE_SEGMENT: &str = "presence";

/// Server control topic: `$mcp-server/{server_id}/{server_name}`
pub fn server_control(server_id: &str, server_name: &str) -> String {
    format!("{}/{}/{}", SERVER_PREFIX, server_id, server_name)
}

/// Server capability-change topic: `$mcp-server/capability/{server_id}/{server_name}`
pub fn server_capability(server_id: &str, server_name: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        SERVER_PREFIX, CAPABILITY_SEGMENT, server_id, server_name
    )
}

/// Server presence topic (retained): `$mcp-server/presence/{server_id}/{server_name}`
pub fn server_presence(server_id: &str, server_name: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        SERVER_PREFIX, PRESENCE_SEGMENT, server_id, server_name
    )
}

/// Client capability-change topic: `$mcp-client/capability/{client_id}`
pub fn client_capability(client_id: &str) -> String {
    format!("{}/{}/{}", CLIENT_PREFIX, CAPABILITY_SEGMENT, client_id)
}

/// Client presence topic: `$mcp-client/presence/{client_id}`
pub fn client_presence(client_id: &str) -> String {
    format!("{}/{}/{}", CLIENT_PREFIX, PRESENCE_SEGMENT, client_id)
}

/// RPC channel topic: `$mcp-rpc/{client_id}/{server_id}/{server_name}`
pub fn rpc(client_id: &str, server_id: &str, server_name: &str) -> String {
    format!("{}/{}/{}/{}", RPC_PREFIX, client_id, server_id, server_name)
}

/// Subscription filter a server uses to receive RPC traffic from any client
pub fn server_rpc_filter(server_id: &str, server_name: &str) -> String {
    format!("{}/+/{}/{}", RPC_PREFIX, server_id, server_name)
}

/// Subscription filter a client uses to discover server presence
pub fn discovery_presence_filter(server_name_filter: &str) -> String {
    format!(
        "{}/{}/+/{}",
        SERVER_PREFIX, PRESENCE_SEGMENT, server_name_filter
    )
}

/// Subscription filter a client uses to observe server capability changes
pub fn discovery_capability_filter(server_name_filter: &str) -> String {
    format!(
        "{}/{}/+/{}",
        SERVER_PREFIX, CAPABILITY_SEGMENT, server_name_filter
    )
}

/// Subscription filter a client uses to receive its own RPC traffic
pub fn client_rpc_filter(client_id: &str, server_name_filter: &str) -> String {
    format!("{}/{}/+/{}", RPC_PREFIX, client_id, server_name_filter)
}

/// Whether an identifier contains an MQTT wildcard character
pub fn contains_wildcard(s: &str) -> bool {
    s.contains('+') || s.contains('#')
}

/// A parsed inbound topic, routed by prefix
///
/// The `capability` and `presence` segments are matched before the control
/// template, which makes them reserved words as server ids; config
/// validation rejects them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    /// `$mcp-server/{server_id}/{server_name}`
    ServerControl {
        server_id: String,
        server_name: String,
    },
    /// `$mcp-server/capability/{server_id}/{server_name}`
    ServerCapability {
        server_id: String,
        server_name: String,
    },
    /// `$mcp-server/presence/{server_id}/{server_name}`
    ServerPresence {
        server_id: String,
        server_name: String,
    },
    /// `$mcp-client/capability/{client_id}`
    ClientCapability { client_id: String },
    /// `$mcp-client/presence/{client_id}`
    ClientPresence { client_id: String },
    /// `$mcp-rpc/{client_id}/{server_id}/{server_name}`
    Rpc {
        client_id: String,
        server_id: String,
        server_name: String,
    },
}

impl TopicKind {
    /// Parse a concrete topic into its kind, or `None` for foreign topics
    pub fn parse(topic: &str) -> Option<TopicKind> {
        let mut segments = topic.split('/');
        match segments.next()? {
            SERVER_PREFIX => {
                let second = segments.next()?;
                match second {
                    CAPABILITY_SEGMENT => {
                        let server_id = segments.next()?.to_string();
                        if server_id.is_empty() {
                            return None;
                        }
                        let server_name = join_rest(segments)?;
                        Some(TopicKind::ServerCapability {
                            server_id,
                            server_name,
                        })
                    }
                    PRESENCE_SEGMENT => {
                        let server_id = segments.next()?.to_string();
                        if server_id.is_empty() {
                            return None;
                        }
                        let server_name = join_rest(segments)?;
                        Some(TopicKind::ServerPresence {
                            server_id,
                            server_name,
                        })
                    }
                    server_id => {
                        if server_id.is_empty() {
                            return None;
                        }
                        let server_name = join_rest(segments)?;
                        Some(TopicKind::ServerControl {
                            server_id: server_id.to_string(),
                            server_name,
                        })
                    }
                }
            }
            CLIENT_PREFIX => {
                let second = segments.next()?;
                let client_id = segments.next()?.to_string();
                if client_id.is_empty() || segments.next().is_some() {
                    return None;
                }
                match second {
                    CAPABILITY_SEGMENT => Some(TopicKind::ClientCapability { client_id }),
                    PRESENCE_SEGMENT => Some(TopicKind::ClientPresence { client_id }),
                    _ => None,
                }
            }
            RPC_PREFIX => {
                let client_id = segments.next()?.to_string();
                let server_id = segments.next()?.to_string();
                let server_name = join_rest(segments)?;
                if client_id.is_empty() || server_id.is_empty() {
                    return None;
                }
                Some(TopicKind::Rpc {
                    client_id,
                    server_id,
                    server_name,
                })
            }
            _ => None,
        }
    }
}

/// Join the remaining segments back into a slash-separated server name
fn join_rest<'a>(segments: impl Iterator<Item = &'a str>) -> Option<String> {
    let rest: Vec<&str> = segments.collect();
    if rest.is_empty() || rest.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(rest.join("/"))
}

/// MQTT 5.0 topic filter matching
///
/// `+` matches exactly one level, `#` matches any number of trailing levels
/// including zero (so `a/#` matches `a` itself).
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut filter_segments = filter.split('/').peekable();
    let mut topic_segments = topic.split('/').peekable();

    loop {
        match (filter_segments.next(), topic_segments.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            (None, _) | (_, None) => {
                return false;
            }
            _ => return false,
        }
        // A trailing "#" matches the parent level too: "a/#" matches "a"
        if topic_segments.peek().is_none() && filter_segments.peek() == Some(&"#") {
            return true;
        }
    }
}

/// Tool and resource registries
///
/// Handlers are user-supplied async callbacks behind small traits, so a
/// server can register plain async closures as well as hand-written handler
/// types. The registries are plain maps; the peer's single lock serializes
/// access to them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{ResourceDefinition, ToolDefinition};

/// Failure reported by a user-supplied handler
///
/// Converted into an `INTERNAL_ERROR` JSON-RPC response; the message is
/// forwarded to the caller verbatim.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError(message.to_string())
    }
}

/// User-supplied callback invoked for `tools/call`
///
/// The returned value becomes the JSON-RPC result verbatim; return a
/// serialized [`crate::protocol::ToolCallResult`] for the structured
/// content shape.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: HashMap<String, Value>) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(HashMap<String, Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn call(&self, arguments: HashMap<String, Value>) -> Result<Value, HandlerError> {
        (self)(arguments).await
    }
}

/// User-supplied callback invoked for `resources/read`
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn read(&self, uri: &str) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> ResourceHandler for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn read(&self, uri: &str) -> Result<Value, HandlerError> {
        (self)(uri.to_string()).await
    }
}

pub(crate) struct RegisteredTool {
    pub definition: ToolDefinition,
    pub handler: Arc<dyn ToolHandler>,
}

/// Tool table, keyed by tool name
#[derive(Default)]
pub(crate) struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Register a tool; a duplicate name replaces the previous entry
    pub fn insert(&mut self, definition: ToolDefinition, handler: Arc<dyn ToolHandler>) {
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool {
                definition,
                handler,
            },
        );
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).map(|tool| Arc::clone(&tool.handler))
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| tool.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }
}

pub(crate) struct RegisteredResource {
    pub definition: ResourceDefinition,
    pub handler: Arc<dyn ResourceHandler>,
}

/// Resource table, keyed by uri
#[derive(Default)]
pub(crate) struct ResourceRegistry {
    resources: HashMap<String, RegisteredResource>,
}

impl ResourceRegistry {
    /// Register a resource; a duplicate uri replaces the previous entry
    pub fn insert(&mut self, definition: ResourceDefinition, handler: Arc<dyn ResourceHandler>) {
        self.resources.insert(
            definition.uri.clone(),
            RegisteredResource {
                definition,
                handler,
            },
        );
    }

    pub fn handler(&self, uri: &str) -> Option<Arc<dyn ResourceHandler>> {
        self.resources
            .get(uri)
            .map(|resource| Arc::clone(&resource.handler))
    }

    pub fn definitions(&self) -> Vec<ResourceDefinition> {
        let mut definitions: Vec<ResourceDefinition> = self
            .resources
            .values()
            .map(|resource| resource.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.uri.cmp(&b.uri));
        definitions
    }
}

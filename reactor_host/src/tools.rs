//! Capabilities exposed by plugins and the tool definitions extracted from them.
//!
//! A plugin lists its invocable methods as [`Capability`] values. Those whose
//! [`ToolMarker`] has `is_tool` set become [`ToolDefinition`]s once the plugin
//! has initialized.

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::PluginError;

type AsyncToolFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type BlockingToolFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// How a capability is invoked.
#[derive(Clone)]
pub enum ToolHandler {
    Async(AsyncToolFn),
    /// Dispatched to the blocking pool; the caller awaits its completion.
    Blocking(BlockingToolFn),
}

impl ToolHandler {
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        ToolHandler::Async(Arc::new(move |args| Box::pin(f(args))))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        ToolHandler::Blocking(Arc::new(f))
    }

    pub async fn invoke(&self, args: Value) -> Result<Value> {
        match self {
            ToolHandler::Async(f) => f(args).await,
            ToolHandler::Blocking(f) => {
                let f = f.clone();
                tokio::task::spawn_blocking(move || f(args))
                    .await
                    .map_err(|e| anyhow!("blocking tool panicked: {}", e))?
            }
        }
    }
}

impl std::fmt::Debug for ToolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolHandler::Async(_) => f.write_str("Async(..)"),
            ToolHandler::Blocking(_) => f.write_str("Blocking(..)"),
        }
    }
}

/// Declarative marker attached to a capability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolMarker {
    pub is_tool: bool,
    pub name: Option<String>,
    pub description: Option<String>,
}

impl ToolMarker {
    pub fn tool() -> Self {
        Self {
            is_tool: true,
            ..Default::default()
        }
    }
}

/// A method a plugin exposes.
#[derive(Debug, Clone)]
pub struct Capability {
    pub method: String,
    pub doc: Option<String>,
    pub marker: ToolMarker,
    pub handler: ToolHandler,
}

impl Capability {
    /// An unmarked capability; call [`Capability::tool`] to expose it.
    pub fn new(method: impl Into<String>, handler: ToolHandler) -> Self {
        Self {
            method: method.into(),
            doc: None,
            marker: ToolMarker::default(),
            handler,
        }
    }

    pub fn tool(mut self) -> Self {
        self.marker.is_tool = true;
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.marker.name = Some(name.into());
        self
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.marker.description = Some(description.into());
        self
    }
}

/// A tool ready to be bound to the agent runtime.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// Name of the plugin that exposed it; empty for host-provided tools.
    pub plugin: String,
    handler: ToolHandler,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        plugin: impl Into<String>,
        handler: ToolHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            plugin: plugin.into(),
            handler,
        }
    }

    pub async fn invoke(&self, args: Value) -> Result<Value> {
        self.handler.invoke(args).await
    }
}

/// Collect the marked capabilities of one plugin. A tool name used twice
/// within the plugin is an error.
pub fn extract_tools(
    plugin: &str,
    capabilities: Vec<Capability>,
) -> Result<Vec<ToolDefinition>, PluginError> {
    let mut seen = HashSet::new();
    let mut tools = Vec::new();

    for cap in capabilities.into_iter().filter(|c| c.marker.is_tool) {
        let name = cap.marker.name.clone().unwrap_or_else(|| cap.method.clone());
        if !seen.insert(name.clone()) {
            error!("Duplicate tool name '{}' in plugin {}", name, plugin);
            return Err(PluginError::DuplicateTool {
                plugin: plugin.to_string(),
                tool: name,
            });
        }

        let description = cap
            .marker
            .description
            .or(cap.doc)
            .unwrap_or_else(|| format!("Execute {}", name));
        debug!("Discovered tool '{}' in plugin {}", name, plugin);
        tools.push(ToolDefinition::new(name, description, plugin, cap.handler));
    }

    Ok(tools)
}

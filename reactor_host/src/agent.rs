//! Agent manager: the shared tool list and the binding to an LLM runtime.
//!
//! Tool registration, backend (re)binding and agent runs are serialized
//! behind one async mutex so a re-bind triggered by new tools never races a
//! run in progress.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::context::HostContext;
use crate::domain::SecretScope;
use crate::loader::PluginManager;
use crate::settings::AgentConfig;
use crate::tools::ToolDefinition;

/// An LLM agent runtime able to call the bound tools.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn run(&self, prompt: &str) -> Result<String>;
}

/// Creates a backend once the API key is available.
pub trait BackendFactory: Send + Sync {
    fn build(
        &self,
        api_key: &str,
        config: &AgentConfig,
        tools: &[ToolDefinition],
    ) -> Result<Arc<dyn AgentBackend>>;
}

#[derive(Default)]
struct AgentState {
    tools: Vec<ToolDefinition>,
    backend: Option<Arc<dyn AgentBackend>>,
}

pub struct AgentManager {
    state: Mutex<AgentState>,
    context: Arc<HostContext>,
    factory: Option<Arc<dyn BackendFactory>>,
}

impl AgentManager {
    pub fn new(context: Arc<HostContext>, factory: Option<Arc<dyn BackendFactory>>) -> Self {
        Self {
            state: Mutex::new(AgentState::default()),
            context,
            factory,
        }
    }

    /// Register a tool; with `reinit` an already bound backend is rebuilt so
    /// it sees the new tool.
    #[instrument(skip(self, tool), fields(tool = %tool.name))]
    pub async fn register_tool(&self, tool: ToolDefinition, reinit: bool) {
        let mut state = self.state.lock().await;
        state.tools.push(tool);
        if reinit && state.backend.is_some() {
            self.bind_backend(&mut state).await;
        }
    }

    /// Register several tools with a single rebind.
    pub async fn register_tools(&self, tools: Vec<ToolDefinition>) {
        if tools.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        state.tools.extend(tools);
        if state.backend.is_some() {
            self.bind_backend(&mut state).await;
        }
    }

    /// Register the tools of every loaded plugin.
    pub async fn register_plugin_tools(&self, plugins: &PluginManager) {
        let tools = plugins.tools();
        for tool in &tools {
            info!("Registered plugin tool: {} ({})", tool.name, tool.plugin);
        }
        self.register_tools(tools).await;
    }

    pub async fn tools(&self) -> Vec<ToolDefinition> {
        self.state.lock().await.tools.clone()
    }

    /// Invoke a registered tool by name. When several plugins expose the same
    /// name, the first registered wins.
    #[instrument(skip(self, args))]
    pub async fn invoke_tool(&self, name: &str, args: Value) -> Result<Value> {
        let tool = {
            let state = self.state.lock().await;
            state
                .tools
                .iter()
                .find(|t| t.name == name)
                .cloned()
                .ok_or_else(|| anyhow!("Unknown tool '{}'", name))?
        }; // Release lock before awaiting the tool
        tool.invoke(args).await
    }

    /// Run the agent on `prompt`. Without a configured backend a descriptive
    /// fallback is returned instead of an error.
    #[instrument(skip(self, context))]
    pub async fn run_agent(&self, prompt: &str, context: Option<&Value>) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.backend.is_none() {
            // The key may have been stored since the last attempt.
            self.bind_backend(&mut state).await;
        }

        let context_text = context.map(|c| c.to_string()).unwrap_or_else(|| "{}".into());
        let Some(backend) = state.backend.clone() else {
            return Ok(format!(
                "Agent received: {}. Context: {}. (Agent not configured - missing {})",
                prompt, context_text, self.context.settings.agent.api_key_secret
            ));
        };

        let mut full_prompt = String::new();
        let skills = self.context.skills.context_for_agent(Some(prompt));
        if !skills.is_empty() {
            full_prompt.push_str(&skills);
            full_prompt.push_str("\n\n");
        }
        if context.is_some() {
            full_prompt.push_str(&format!("Context: {}\n\n", context_text));
        }
        full_prompt.push_str(prompt);

        backend.run(&full_prompt).await
    }

    async fn bind_backend(&self, state: &mut AgentState) {
        let Some(factory) = &self.factory else {
            return;
        };
        let config = &self.context.settings.agent;

        let api_key = match self
            .context
            .secrets
            .get_secret(&config.api_key_secret, SecretScope::User, None)
            .await
        {
            Ok(Some(key)) => key,
            Ok(None) => {
                debug!("Agent API key '{}' not available", config.api_key_secret);
                return;
            }
            Err(e) => {
                warn!("Failed to read agent API key: {}", e);
                return;
            }
        };

        match factory.build(&api_key, config, &state.tools) {
            Ok(backend) => {
                state.backend = Some(backend);
                info!(model = %config.model, tools = state.tools.len(), "Agent initialized");
            }
            Err(e) => error!("Failed to initialize agent: {}", e),
        }
    }
}

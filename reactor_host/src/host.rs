//! Application host: builds the shared context, runs the load phases and
//! binds plugin tools to the agent manager.

use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

use crate::agent::{AgentManager, BackendFactory};
use crate::context::HostContext;
use crate::loader::PluginManager;
use crate::manifest::PluginTiming;
use crate::plugin::ExtensionTable;
use crate::settings::Settings;

pub struct Host {
    pub context: Arc<HostContext>,
    pub plugins: PluginManager,
    pub agents: AgentManager,
}

impl Host {
    /// Host over a local-only context built from `settings`.
    pub async fn new(settings: Settings, extensions: ExtensionTable) -> Result<Self> {
        let context = Arc::new(HostContext::from_settings(settings)?);
        Ok(Self::with_context(context, extensions, None).await)
    }

    pub async fn with_context(
        context: Arc<HostContext>,
        extensions: ExtensionTable,
        backend: Option<Arc<dyn BackendFactory>>,
    ) -> Self {
        let plugins = PluginManager::new(context.clone(), extensions).await;
        let agents = AgentManager::new(context.clone(), backend);
        Self {
            context,
            plugins,
            agents,
        }
    }

    /// Run every load phase in order, then hand plugin tools to the agent
    /// manager. Returns the number of plugins loaded.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> usize {
        let started = Instant::now();
        let mut loaded = 0;
        for phase in PluginTiming::ALL {
            loaded += self.plugins.load_phase(phase).await;
        }
        self.agents.register_plugin_tools(&self.plugins).await;

        let elapsed = started.elapsed();
        info!(
            plugins = loaded,
            skills = self.context.skills.len(),
            startup_ms = elapsed.as_millis() as u64,
            "Host started"
        );
        let telemetry = &self.context.telemetry;
        telemetry
            .record_gauge("app.plugins.loaded", loaded as f64, &[])
            .await;
        telemetry
            .record_timer("app.startup.duration", elapsed, &[("status", "success")])
            .await;
        loaded
    }

    /// Shut plugins down, record the shutdown time and then close the
    /// telemetry providers.
    pub async fn shutdown(&mut self) {
        info!("Shutting down host");
        let started = Instant::now();
        self.plugins.shutdown_all().await;

        let telemetry = &self.context.telemetry;
        telemetry
            .record_timer("app.shutdown.duration", started.elapsed(), &[("status", "success")])
            .await;
        telemetry.flush().await;
        telemetry.shutdown().await;
    }
}

//! Plugin manager: phase loading, the plugin registry and ordered shutdown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::context::HostContext;
use crate::discovery::PluginDiscovery;
use crate::error::PluginError;
use crate::lifecycle::{
    order_phase, LifecycleEvent, LifecycleEventType, LifecycleLog, PhaseTracker, PhaseTransition,
};
use crate::manifest::{
    default_entry_file, dependency_union, library_file, PluginManifest, PluginTiming, PluginType,
};
use crate::plugin::{resolve_factory, ExtensionTable, NativeLibrary, Plugin, PluginSecurityConfig};
use crate::tools::{extract_tools, ToolDefinition};
use crate::ui::{StaticSite, UiPlugin};

/// A plugin that initialized successfully.
pub struct LoadedPlugin {
    // Dropped before `_library` so no plugin code outlives its library.
    instance: Box<dyn Plugin>,
    tools: Vec<ToolDefinition>,
    _library: Option<Arc<NativeLibrary>>,
}

impl LoadedPlugin {
    pub fn plugin(&self) -> &dyn Plugin {
        self.instance.as_ref()
    }

    pub fn manifest(&self) -> &PluginManifest {
        self.instance.manifest()
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }
}

pub struct PluginManager {
    discovery: PluginDiscovery,
    extensions: ExtensionTable,
    security: PluginSecurityConfig,
    context: Arc<HostContext>,
    plugins: HashMap<String, LoadedPlugin>,
    load_order: Vec<String>,
    phases: PhaseTracker,
    log: LifecycleLog,
}

impl PluginManager {
    /// Build a manager from the context's settings: search roots, central
    /// configuration (parsed once) and library security. Configured plugins
    /// that are missing on disk are fetched before returning.
    #[instrument(skip(context, extensions))]
    pub async fn new(context: Arc<HostContext>, extensions: ExtensionTable) -> Self {
        let discovery = PluginDiscovery::from_settings(&context.settings.plugins);
        discovery.install_missing().await;

        let security = PluginSecurityConfig::from_settings(&context.settings.plugins);
        Self::with_discovery(discovery, context, extensions, security)
    }

    pub fn with_discovery(
        discovery: PluginDiscovery,
        context: Arc<HostContext>,
        extensions: ExtensionTable,
        security: PluginSecurityConfig,
    ) -> Self {
        Self {
            discovery,
            extensions,
            security,
            context,
            plugins: HashMap::new(),
            load_order: Vec::new(),
            phases: PhaseTracker::new(),
            log: LifecycleLog::default(),
        }
    }

    pub fn discovery(&self) -> &PluginDiscovery {
        &self.discovery
    }

    /// Load every discovered plugin whose timing is `phase`, in priority
    /// order. Returns how many plugins were newly loaded.
    #[instrument(skip(self))]
    pub async fn load_phase(&mut self, phase: PluginTiming) -> usize {
        match self.phases.enter(phase) {
            PhaseTransition::Backwards { current } => {
                warn!("Refusing to return to phase {} after {}", phase, current);
                return 0;
            }
            PhaseTransition::Repeated => debug!("Phase {} entered again", phase),
            PhaseTransition::Entered => {}
        }

        let started = Instant::now();
        self.log.record(
            LifecycleEvent::new(LifecycleEventType::PhaseStarted, "phase started").phase(phase),
        );

        let mut loaded = 0;
        for manifest in order_phase(self.discovery.discover(), phase) {
            if self.plugins.contains_key(&manifest.name) {
                continue;
            }
            let name = manifest.name.clone();
            match self.load_plugin(manifest).await {
                Ok(()) => loaded += 1,
                Err(e) => {
                    error!("Failed to load plugin {}: {}", name, e);
                    self.log.record(
                        LifecycleEvent::new(LifecycleEventType::PluginFailed, e.to_string())
                            .phase(phase)
                            .plugin(name),
                    );
                }
            }
        }

        let elapsed = started.elapsed();
        info!(
            phase = %phase,
            loaded,
            elapsed_ms = elapsed.as_millis() as u64,
            "Plugin phase complete"
        );
        self.context
            .telemetry
            .record_timer("plugin.phase.duration", elapsed, &[("phase", phase.as_str())])
            .await;
        self.log.record(
            LifecycleEvent::new(LifecycleEventType::PhaseCompleted, format!("{} loaded", loaded))
                .phase(phase),
        );
        loaded
    }

    /// Load, initialize and register one plugin. The attempt is timed as
    /// `plugin.load.duration` whether or not it succeeds.
    #[instrument(skip(self, manifest), fields(plugin = %manifest.name))]
    pub async fn load_plugin(&mut self, manifest: PluginManifest) -> Result<(), PluginError> {
        let started = Instant::now();
        let name = manifest.name.clone();
        let result = self.instantiate(manifest).await;
        let status = if result.is_ok() { "success" } else { "failure" };
        self.context
            .telemetry
            .record_timer(
                "plugin.load.duration",
                started.elapsed(),
                &[("plugin", name.as_str()), ("status", status)],
            )
            .await;
        result
    }

    async fn instantiate(&mut self, manifest: PluginManifest) -> Result<(), PluginError> {
        let module = manifest.module_name();
        let entry = resolve_entry(&manifest);

        if entry.is_none()
            && !self.extensions.contains(&module)
            && manifest.plugin_type != PluginType::Ui
        {
            return Err(PluginError::MissingEntry {
                name: manifest.name.clone(),
                dir: manifest.path.clone(),
            });
        }

        let (factory, library) =
            resolve_factory(&module, entry.as_deref(), &self.extensions, &self.security)?;

        let mut instance: Box<dyn Plugin> = match factory {
            Some(factory) => {
                let context = self.context.clone();
                let for_factory = manifest.clone();
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| factory(for_factory, context)))
                    .map_err(|_| PluginError::Initialization {
                        name: manifest.name.clone(),
                        source: anyhow::anyhow!("plugin constructor panicked"),
                    })?
            }
            None if manifest.plugin_type == PluginType::Ui => {
                info!(
                    "No Plugin implementation found for UI plugin {}, treating as declarative.",
                    manifest.name
                );
                Box::new(UiPlugin::new(manifest.clone()))
            }
            None => return Err(PluginError::NoExtension { module }),
        };

        instance
            .initialize()
            .await
            .map_err(|source| PluginError::Initialization {
                name: manifest.name.clone(),
                source,
            })?;

        let tools = extract_tools(&manifest.name, instance.capabilities())?;

        if let Some(provider) = instance.telemetry_provider() {
            self.context.telemetry.attach(provider).await;
        }

        if let Some(skill) = &manifest.skill {
            self.context.skills.register(skill.clone());
        }

        info!(
            "Successfully loaded plugin: {} ({} tools)",
            manifest.name,
            tools.len()
        );
        self.log.record(
            LifecycleEvent::new(LifecycleEventType::PluginLoaded, format!("v{}", manifest.version))
                .phase(manifest.timing)
                .plugin(manifest.name.clone()),
        );
        self.load_order.push(manifest.name.clone());
        self.plugins.insert(
            manifest.name,
            LoadedPlugin {
                instance,
                tools,
                _library: library,
            },
        );
        Ok(())
    }

    /// Shut plugins down in reverse load order. A failing hook is logged and
    /// the remaining plugins still shut down.
    #[instrument(skip(self))]
    pub async fn shutdown_all(&mut self) {
        let started = Instant::now();
        for name in self.load_order.iter().rev() {
            let Some(loaded) = self.plugins.get_mut(name) else {
                continue;
            };
            let stopping = Instant::now();
            let result = loaded.instance.shutdown().await;
            let status = if result.is_ok() { "success" } else { "failure" };
            self.context
                .telemetry
                .record_timer(
                    "plugin.shutdown.duration",
                    stopping.elapsed(),
                    &[("plugin", name.as_str()), ("status", status)],
                )
                .await;
            match result {
                Ok(()) => {
                    debug!("Plugin {} shut down", name);
                    self.log.record(
                        LifecycleEvent::new(LifecycleEventType::PluginStopped, "stopped")
                            .plugin(name.clone()),
                    );
                }
                Err(e) => {
                    error!("Error shutting down plugin {}: {}", name, e);
                    self.log.record(
                        LifecycleEvent::new(LifecycleEventType::PluginStopFailed, e.to_string())
                            .plugin(name.clone()),
                    );
                }
            }
        }
        info!(
            plugins = self.load_order.len(),
            shutdown_ms = started.elapsed().as_millis() as u64,
            "Plugins shut down"
        );
    }

    pub fn get_plugin(&self, name: &str) -> Option<&dyn Plugin> {
        self.plugins.get(name).map(|p| p.plugin())
    }

    pub fn get_loaded(&self, name: &str) -> Option<&LoadedPlugin> {
        self.plugins.get(name)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Loaded plugins of one type, in load order.
    pub fn plugins_by_type(&self, plugin_type: PluginType) -> Vec<&dyn Plugin> {
        self.loaded_in_order()
            .filter(|p| p.manifest().plugin_type == plugin_type)
            .map(|p| p.plugin())
            .collect()
    }

    /// Manifests of loaded plugins, in load order.
    pub fn manifests(&self) -> Vec<&PluginManifest> {
        self.loaded_in_order().map(|p| p.manifest()).collect()
    }

    pub fn load_order(&self) -> &[String] {
        &self.load_order
    }

    /// Tools of every loaded plugin, in load order.
    pub fn tools(&self) -> Vec<ToolDefinition> {
        self.loaded_in_order()
            .flat_map(|p| p.tools().iter().cloned())
            .collect()
    }

    /// Static sites served by loaded UI plugins.
    pub fn static_sites(&self) -> Vec<(String, StaticSite)> {
        self.loaded_in_order()
            .filter_map(|p| p.plugin().static_site().map(|s| (p.manifest().name.clone(), s)))
            .collect()
    }

    /// Union of `dependencies` across all discovered manifests, sorted.
    pub fn all_dependencies(&self) -> Vec<String> {
        dependency_union(&self.discovery.discover())
    }

    pub fn lifecycle_log(&self) -> &LifecycleLog {
        &self.log
    }

    fn loaded_in_order(&self) -> impl Iterator<Item = &LoadedPlugin> {
        self.load_order.iter().filter_map(|name| self.plugins.get(name))
    }
}

/// Explicit `entry_point` if it exists, else the conventional library name.
/// An `entry_point` without an extension names a library stem and gets the
/// platform prefix and suffix.
fn resolve_entry(manifest: &PluginManifest) -> Option<PathBuf> {
    let explicit = manifest.entry_point.as_deref().and_then(|entry| {
        let path = manifest.path.join(entry);
        if path.is_file() {
            return Some(path);
        }
        let stem = Path::new(entry);
        if stem.extension().is_some() {
            return None;
        }
        let file = library_file(stem.file_name()?.to_str()?);
        let path = manifest.path.join(stem.with_file_name(file));
        path.is_file().then_some(path)
    });
    explicit.or_else(|| {
        let default = manifest.path.join(default_entry_file());
        default.is_file().then_some(default)
    })
}

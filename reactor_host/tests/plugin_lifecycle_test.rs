//! Integration tests for discovery, phased loading, tool extraction and
//! ordered shutdown.
//!
//! Plugins are statically linked through an `ExtensionTable`; their
//! behaviour is driven by the `[config]` table of each test manifest, and
//! they report lifecycle hooks on the host's event bus.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reactor_host::discovery::{CentralConfig, PluginDiscovery};
use reactor_host::events::EventHandler;
use reactor_host::lifecycle::LifecycleEventType;
use reactor_host::manifest::default_entry_file;
use reactor_host::metrics::{InMemoryTelemetryProvider, MetricEvent, TelemetryProvider};
use reactor_host::plugin::PluginSecurityConfig;
use reactor_host::tools::{Capability, ToolHandler};
use reactor_host::{
    ExtensionTable, Host, HostContext, Plugin, PluginError, PluginManager, PluginManifest,
    PluginRegistrar, PluginTiming, PluginType,
};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

struct Recorder {
    manifest: PluginManifest,
    context: Arc<HostContext>,
}

impl Recorder {
    fn flag(&self, key: &str) -> bool {
        self.manifest
            .config
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Forwards every metric name onto the event bus as `test.metric`.
struct BusSink {
    context: Arc<HostContext>,
}

#[async_trait]
impl TelemetryProvider for BusSink {
    fn name(&self) -> &str {
        "bus"
    }

    async fn record(&self, event: &MetricEvent) -> Result<()> {
        self.context
            .events
            .emit("test.metric", vec![json!(event.name)])
            .await;
        Ok(())
    }
}

#[async_trait]
impl Plugin for Recorder {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    async fn initialize(&mut self) -> Result<()> {
        if self.flag("fail_init") {
            return Err(anyhow!("refusing to start"));
        }
        self.context
            .events
            .emit("test.initialized", vec![json!(self.manifest.name)])
            .await;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.context
            .events
            .emit("test.shutdown", vec![json!(self.manifest.name)])
            .await;
        if self.flag("fail_shutdown") {
            return Err(anyhow!("stuck"));
        }
        Ok(())
    }

    fn capabilities(&self) -> Vec<Capability> {
        let name = self.manifest.name.clone();
        let mut caps = vec![
            Capability::new(
                "ping",
                ToolHandler::from_async(move |_| {
                    let name = name.clone();
                    async move { Ok(json!(format!("pong from {}", name))) }
                }),
            )
            .tool()
            .named(format!("{}_ping", self.manifest.name.replace('-', "_"))),
            Capability::new("describe", ToolHandler::blocking(|_| Ok(json!("internal")))),
        ];
        if self.flag("duplicate_tool") {
            caps.push(caps[0].clone());
        }
        caps
    }

    fn telemetry_provider(&self) -> Option<Arc<dyn TelemetryProvider>> {
        self.flag("metrics_sink").then(|| {
            Arc::new(BusSink {
                context: self.context.clone(),
            }) as Arc<dyn TelemetryProvider>
        })
    }
}

fn register_recorder(registrar: &mut PluginRegistrar) {
    registrar.register_plugin("Recorder", |manifest, context| {
        Box::new(Recorder { manifest, context })
    });
}

fn register_twice(registrar: &mut PluginRegistrar) {
    register_recorder(registrar);
    register_recorder(registrar);
}

fn module(name: &str) -> String {
    format!("reactor_plugins.{}", name.replace('-', "_"))
}

fn write_plugin(root: &Path, name: &str, timing: &str, priority: i64, extra: &str) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("plugin.toml"),
        format!(
            "name = \"{}\"\nversion = \"1.0.0\"\ntype = \"core\"\ntiming = \"{}\"\npriority = {}\n{}",
            name, timing, priority, extra
        ),
    )
    .unwrap();
}

fn table(names: &[&str]) -> ExtensionTable {
    names.iter().fold(ExtensionTable::new(), |table, name| {
        table.with(module(name), register_recorder)
    })
}

fn manager(
    root: &Path,
    config: Option<CentralConfig>,
    context: Arc<HostContext>,
    extensions: ExtensionTable,
) -> PluginManager {
    PluginManager::with_discovery(
        PluginDiscovery::new(vec![root.to_path_buf()], config),
        context,
        extensions,
        PluginSecurityConfig::default(),
    )
}

fn record(context: &HostContext, event: &str) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    context.events.on(
        event,
        EventHandler::blocking(move |args| {
            let name = args.first().and_then(Value::as_str).unwrap_or_default();
            sink.lock().unwrap().push(name.to_string());
            Ok(())
        }),
        false,
    );
    seen
}

#[tokio::test]
async fn test_pre_init_then_default_load_order() {
    let root = tempdir().unwrap();
    write_plugin(root.path(), "foo", "pre-init", 0, "");
    write_plugin(root.path(), "bar", "default", 0, "");

    let context = Arc::new(HostContext::in_memory());
    let mut plugins = manager(root.path(), None, context, table(&["foo", "bar"]));

    assert_eq!(plugins.load_phase(PluginTiming::PreInit).await, 1);
    assert_eq!(plugins.load_order(), &["foo"]);
    assert!(!plugins.is_loaded("bar"));

    assert_eq!(plugins.load_phase(PluginTiming::Default).await, 1);
    assert_eq!(plugins.load_order(), &["foo", "bar"]);
}

#[tokio::test]
async fn test_repeated_phase_loads_each_plugin_once() {
    let root = tempdir().unwrap();
    write_plugin(root.path(), "solo", "default", 0, "");

    let context = Arc::new(HostContext::in_memory());
    let initialized = record(&context, "test.initialized");
    let mut plugins = manager(root.path(), None, context, table(&["solo"]));

    assert_eq!(plugins.load_phase(PluginTiming::Default).await, 1);
    assert_eq!(plugins.load_phase(PluginTiming::Default).await, 0);
    assert_eq!(*initialized.lock().unwrap(), vec!["solo"]);
}

#[tokio::test]
async fn test_priority_descending_then_name() {
    let root = tempdir().unwrap();
    write_plugin(root.path(), "low", "default", 1, "");
    write_plugin(root.path(), "high-b", "default", 5, "");
    write_plugin(root.path(), "high-a", "default", 5, "");

    let context = Arc::new(HostContext::in_memory());
    let initialized = record(&context, "test.initialized");
    let mut plugins = manager(root.path(), None, context, table(&["low", "high-a", "high-b"]));

    plugins.load_phase(PluginTiming::Default).await;
    assert_eq!(*initialized.lock().unwrap(), vec!["high-a", "high-b", "low"]);
    assert_eq!(plugins.load_order(), &["high-a", "high-b", "low"]);
}

#[tokio::test]
async fn test_earlier_phase_refused_after_later_one() {
    let root = tempdir().unwrap();
    write_plugin(root.path(), "early", "pre-init", 0, "");
    write_plugin(root.path(), "late", "after-init", 0, "");

    let context = Arc::new(HostContext::in_memory());
    let mut plugins = manager(root.path(), None, context, table(&["early", "late"]));

    assert_eq!(plugins.load_phase(PluginTiming::AfterInit).await, 1);
    assert_eq!(plugins.load_phase(PluginTiming::PreInit).await, 0);
    assert!(!plugins.is_loaded("early"));
}

#[tokio::test]
async fn test_shutdown_is_reverse_order_and_best_effort() {
    let root = tempdir().unwrap();
    write_plugin(root.path(), "a", "default", 30, "");
    write_plugin(root.path(), "b", "default", 20, "[config]\nfail_shutdown = true\n");
    write_plugin(root.path(), "c", "default", 10, "");

    let context = Arc::new(HostContext::in_memory());
    let stopped = record(&context, "test.shutdown");
    let mut plugins = manager(root.path(), None, context, table(&["a", "b", "c"]));

    plugins.load_phase(PluginTiming::Default).await;
    assert_eq!(plugins.load_order(), &["a", "b", "c"]);

    plugins.shutdown_all().await;
    assert_eq!(*stopped.lock().unwrap(), vec!["c", "b", "a"]);

    let failures: Vec<_> = plugins
        .lifecycle_log()
        .events()
        .iter()
        .filter(|e| e.event_type == LifecycleEventType::PluginStopFailed)
        .filter_map(|e| e.plugin.as_deref())
        .collect();
    assert_eq!(failures, vec!["b"]);
}

#[tokio::test]
async fn test_failing_plugins_do_not_affect_siblings() {
    let root = tempdir().unwrap();
    write_plugin(root.path(), "broken-init", "default", 0, "[config]\nfail_init = true\n");
    write_plugin(root.path(), "dup-tools", "default", 0, "[config]\nduplicate_tool = true\n");
    write_plugin(root.path(), "no-entry", "default", 0, "");
    write_plugin(root.path(), "healthy", "default", 0, "");

    let context = Arc::new(HostContext::in_memory());
    let mut plugins = manager(
        root.path(),
        None,
        context,
        table(&["broken-init", "dup-tools", "healthy"]),
    );

    assert_eq!(plugins.load_phase(PluginTiming::Default).await, 1);
    assert_eq!(plugins.load_order(), &["healthy"]);

    let failed: Vec<_> = plugins
        .lifecycle_log()
        .events()
        .iter()
        .filter(|e| e.event_type == LifecycleEventType::PluginFailed)
        .map(|e| (e.plugin.clone().unwrap_or_default(), e.message.clone()))
        .collect();
    let names: Vec<_> = failed.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["broken-init", "dup-tools", "no-entry"]);
    assert!(failed[0].1.contains("failed to initialize"));
    assert!(failed[1].1.contains("duplicate tool name"));
    assert!(failed[2].1.contains("no entry point found"));
}

#[tokio::test]
async fn test_load_and_shutdown_timings_are_recorded() {
    let root = tempdir().unwrap();
    write_plugin(root.path(), "ok", "default", 10, "");
    write_plugin(root.path(), "bad", "default", 0, "[config]\nfail_init = true\n");

    let context = Arc::new(HostContext::in_memory());
    let memory = Arc::new(InMemoryTelemetryProvider::default());
    context.telemetry.register_provider(memory.clone());
    let mut plugins = manager(root.path(), None, context, table(&["ok", "bad"]));

    plugins.load_phase(PluginTiming::Default).await;
    plugins.shutdown_all().await;

    let loads: Vec<_> = memory
        .events()
        .into_iter()
        .filter(|e| e.name == "plugin.load.duration")
        .map(|e| (e.tags["plugin"].clone(), e.tags["status"].clone()))
        .collect();
    assert_eq!(
        loads,
        vec![
            ("ok".to_string(), "success".to_string()),
            ("bad".to_string(), "failure".to_string()),
        ]
    );
    assert_eq!(memory.timers("plugin.phase.duration").len(), 1);
    assert_eq!(memory.timers("plugin.shutdown.duration").len(), 1);
}

#[tokio::test]
async fn test_plugin_sink_receives_later_metrics() {
    let root = tempdir().unwrap();
    write_plugin(root.path(), "sink", "pre-init", 0, "[config]\nmetrics_sink = true\n");
    write_plugin(root.path(), "worker", "default", 0, "");

    let context = Arc::new(HostContext::in_memory());
    let metrics = record(&context, "test.metric");
    let mut plugins = manager(root.path(), None, context.clone(), table(&["sink", "worker"]));

    plugins.load_phase(PluginTiming::PreInit).await;
    assert_eq!(context.telemetry.provider_count(), 1);
    plugins.load_phase(PluginTiming::Default).await;

    let seen = metrics.lock().unwrap().clone();
    let loads = seen.iter().filter(|name| *name == "plugin.load.duration").count();
    assert_eq!(loads, 2);
    assert!(seen.contains(&"plugin.phase.duration".to_string()));
}

#[tokio::test]
async fn test_corrupt_library_fails_without_stopping_phase() {
    let root = tempdir().unwrap();
    write_plugin(root.path(), "corrupt", "default", 10, "");
    write_plugin(root.path(), "healthy", "default", 0, "");
    fs::write(
        root.path().join("corrupt").join(default_entry_file()),
        b"\x7fELF but not really",
    )
    .unwrap();

    let context = Arc::new(HostContext::in_memory());
    let mut plugins = manager(root.path(), None, context, table(&["healthy"]));

    assert_eq!(plugins.load_phase(PluginTiming::Default).await, 1);
    assert!(plugins.is_loaded("healthy"));
    assert!(!plugins.is_loaded("corrupt"));

    let failure = plugins
        .lifecycle_log()
        .events()
        .iter()
        .find(|e| e.event_type == LifecycleEventType::PluginFailed)
        .unwrap();
    assert_eq!(failure.plugin.as_deref(), Some("corrupt"));
    assert!(failure.message.contains("failed to load extension unit"));
}

#[tokio::test]
async fn test_unit_registering_two_implementations_is_rejected() {
    let root = tempdir().unwrap();
    write_plugin(root.path(), "twin", "default", 0, "");

    let context = Arc::new(HostContext::in_memory());
    let extensions = ExtensionTable::new().with(module("twin"), register_twice);
    let mut plugins = manager(root.path(), None, context, extensions);

    let manifest = plugins.discovery().discover().remove(0);
    let err = plugins.load_plugin(manifest).await.unwrap_err();
    assert!(matches!(err, PluginError::AmbiguousExtension { count: 2, .. }));
    assert!(!plugins.is_loaded("twin"));
}

#[tokio::test]
async fn test_disabled_plugin_is_never_loaded() {
    let root = tempdir().unwrap();
    write_plugin(root.path(), "plugin-x", "default", 0, "");
    write_plugin(root.path(), "plugin-y", "default", 0, "");
    let config = CentralConfig::from_toml("[plugins.plugin-x]\nenabled = false\n").unwrap();

    let context = Arc::new(HostContext::in_memory());
    let mut plugins = manager(
        root.path(),
        Some(config),
        context,
        table(&["plugin-x", "plugin-y"]),
    );

    plugins.load_phase(PluginTiming::Default).await;
    assert_eq!(plugins.load_order(), &["plugin-y"]);
}

#[tokio::test]
async fn test_declarative_ui_plugin_without_implementation() {
    let root = tempdir().unwrap();
    let dir = root.path().join("dashboard");
    fs::create_dir_all(dir.join("dist")).unwrap();
    fs::write(dir.join("dist/index.html"), "<html></html>").unwrap();
    fs::write(
        dir.join("plugin.toml"),
        "name = \"dashboard\"\nversion = \"0.2.0\"\ntype = \"ui\"\n",
    )
    .unwrap();

    let context = Arc::new(HostContext::in_memory());
    let mut plugins = manager(root.path(), None, context, ExtensionTable::new());

    assert_eq!(plugins.load_phase(PluginTiming::Default).await, 1);
    assert_eq!(plugins.plugins_by_type(PluginType::Ui).len(), 1);

    let sites = plugins.static_sites();
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].0, "dashboard");
    let index = sites[0].1.resolve("/").unwrap();
    assert!(index.ends_with("dist/index.html"));
}

#[tokio::test]
async fn test_tools_and_skills_are_collected() {
    let root = tempdir().unwrap();
    write_plugin(root.path(), "shots", "default", 0, "dependencies = [\"requests\"]\n");
    write_plugin(root.path(), "assets", "default", 0, "dependencies = [\"numpy\", \"requests\"]\n");
    fs::write(
        root.path().join("shots/SKILL.md"),
        "---\nname: shot-tools\ndescription: Work with shots\n---\n\n## Context Keywords\n- shot\n\n## Tools\n- `shots_ping`\n",
    )
    .unwrap();

    let context = Arc::new(HostContext::in_memory());
    let mut plugins = manager(root.path(), None, context.clone(), table(&["shots", "assets"]));
    plugins.load_phase(PluginTiming::Default).await;

    let names: Vec<_> = plugins.tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["assets_ping", "shots_ping"]);
    assert_eq!(plugins.all_dependencies(), vec!["numpy", "requests"]);

    let skill = context.skills.get("shot-tools").unwrap();
    assert_eq!(skill.plugin_name.as_deref(), Some("shots"));
    assert_eq!(context.skills.by_context("render the shot").len(), 1);
}

#[tokio::test]
async fn test_host_start_binds_plugin_tools() {
    let root = tempdir().unwrap();
    write_plugin(root.path(), "boot", "pre-init", 0, "");
    write_plugin(root.path(), "app", "after-init", 0, "");

    let mut context = HostContext::in_memory();
    context.settings.plugins.dirs = vec![root.path().to_path_buf()];
    let context = Arc::new(context);
    let stopped = record(&context, "test.shutdown");

    let mut host = Host::with_context(context, table(&["boot", "app"]), None).await;
    assert_eq!(host.start().await, 2);
    assert_eq!(host.plugins.load_order(), &["boot", "app"]);

    let out = host.agents.invoke_tool("app_ping", json!({})).await.unwrap();
    assert_eq!(out, json!("pong from app"));
    assert!(host.agents.invoke_tool("describe", json!({})).await.is_err());

    host.shutdown().await;
    assert_eq!(*stopped.lock().unwrap(), vec!["app", "boot"]);
}

#[tokio::test]
async fn test_host_records_startup_and_shutdown_metrics() {
    let root = tempdir().unwrap();
    write_plugin(root.path(), "solo", "default", 0, "");

    let mut context = HostContext::in_memory();
    context.settings.plugins.dirs = vec![root.path().to_path_buf()];
    let context = Arc::new(context);
    let memory = Arc::new(InMemoryTelemetryProvider::default());
    context.telemetry.register_provider(memory.clone());

    let mut host = Host::with_context(context, table(&["solo"]), None).await;
    host.start().await;
    assert_eq!(memory.gauge("app.plugins.loaded"), Some(1.0));
    assert_eq!(memory.timers("app.startup.duration").len(), 1);

    host.shutdown().await;
    assert_eq!(memory.timers("app.shutdown.duration").len(), 1);
}

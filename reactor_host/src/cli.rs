//! Command-line interface definitions using clap derive API.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::discovery::PluginDiscovery;
use crate::host::Host;
use crate::manifest::{dependency_union, PluginManifest};
use crate::plugin::ExtensionTable;
use crate::settings::Settings;

/// Plugin-extensible application host
#[derive(Parser)]
#[command(name = "reactor-cli")]
#[command(about = "Discover, load and run application plugins")]
#[command(version)]
pub struct Cli {
    /// Additional plugin search root (repeatable)
    #[arg(long = "plugin-dir", global = true)]
    pub plugin_dirs: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load all plugins and run until Ctrl-C
    Serve,
    /// List discovered plugins with their phase and priority
    Plugins,
    /// Print the union of plugin dependencies
    Deps,
}

impl Cli {
    /// Fold command-line search roots into the loaded settings.
    pub fn apply(&self, settings: &mut Settings) {
        for dir in &self.plugin_dirs {
            if !settings.plugins.dirs.contains(dir) {
                settings.plugins.dirs.push(dir.clone());
            }
        }
    }
}

pub async fn serve(settings: Settings, extensions: ExtensionTable) -> Result<()> {
    let mut host = Host::new(settings, extensions).await?;
    let loaded = host.start().await;
    info!("Host running with {} plugins; press Ctrl-C to stop", loaded);

    tokio::signal::ctrl_c().await?;
    host.shutdown().await;
    Ok(())
}

pub fn list_plugins(settings: &Settings) {
    let manifests = PluginDiscovery::from_settings(&settings.plugins).discover();
    if manifests.is_empty() {
        println!("No plugins found.");
        return;
    }
    for line in plugin_table(&manifests) {
        println!("{}", line);
    }
}

pub fn print_dependencies(settings: &Settings) {
    for dep in dependency_union(&PluginDiscovery::from_settings(&settings.plugins).discover()) {
        println!("{}", dep);
    }
}

fn plugin_table(manifests: &[PluginManifest]) -> Vec<String> {
    let mut sorted: Vec<&PluginManifest> = manifests.iter().collect();
    sorted.sort_by(|a, b| {
        a.timing
            .cmp(&b.timing)
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.name.cmp(&b.name))
    });
    sorted
        .into_iter()
        .map(|m| {
            format!(
                "{:<24} {:<8} {:<10} {:>5}  {}",
                m.name,
                m.version,
                m.timing.as_str(),
                m.priority,
                m.plugin_type
            )
        })
        .collect()
}

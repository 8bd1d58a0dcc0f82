//! Manifest discovery across plugin search roots.
//!
//! Roots are walked in file-name order. Equal-priority plugins in the same
//! phase are later ordered by name, so the final load order does not depend
//! on filesystem enumeration order.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

use crate::manifest::{PluginManifest, PluginTiming, MANIFEST_FILE};
use crate::settings::PluginSettings;

/// Directory name never descended into.
const TEMPLATES_DIR: &str = "templates";

/// Root preferred for auto-installed plugins.
const INSTALL_DIR_NAME: &str = "plugins";

/// Process-wide plugin configuration file.
///
/// ```toml
/// plugin_dirs = ["vendor/plugins"]
///
/// [plugins.ftrack-sync]
/// enabled = false
///
/// [plugins.asset-browser]
/// priority = 20
/// timing = "after-init"
/// source = "https://example.com/asset-browser.git"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CentralConfig {
    #[serde(default)]
    pub plugin_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginOverride {
    pub enabled: Option<bool>,
    pub priority: Option<i64>,
    pub timing: Option<PluginTiming>,
    /// Fetch origin used when the plugin is absent from every root.
    pub source: Option<String>,
}

impl CentralConfig {
    pub fn from_toml(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plugin config {:?}", path))?;
        Self::from_toml(&source).with_context(|| format!("Failed to parse plugin config {:?}", path))
    }

    /// Drop disabled manifests and apply priority/timing overrides.
    pub fn apply(&self, manifests: Vec<PluginManifest>) -> Vec<PluginManifest> {
        manifests
            .into_iter()
            .filter_map(|mut manifest| {
                let Some(entry) = self.plugins.get(&manifest.name) else {
                    return Some(manifest);
                };
                if entry.enabled == Some(false) {
                    info!("Plugin {} disabled by config.", manifest.name);
                    return None;
                }
                if let Some(priority) = entry.priority {
                    manifest.priority = priority;
                }
                if let Some(timing) = entry.timing {
                    manifest.timing = timing;
                }
                Some(manifest)
            })
            .collect()
    }
}

/// Scans search roots for `plugin.toml` files.
#[derive(Debug, Clone)]
pub struct PluginDiscovery {
    roots: Vec<PathBuf>,
    config: Option<CentralConfig>,
}

impl PluginDiscovery {
    /// Duplicate roots, including those contributed by `config`, are dropped.
    pub fn new(roots: Vec<PathBuf>, config: Option<CentralConfig>) -> Self {
        let mut unique: Vec<PathBuf> = Vec::new();
        let extra = config.iter().flat_map(|c| c.plugin_dirs.iter().cloned());
        for root in roots.into_iter().chain(extra) {
            if !unique.contains(&root) {
                unique.push(root);
            }
        }
        Self {
            roots: unique,
            config,
        }
    }

    /// Roots and central configuration from settings. An unreadable
    /// configuration file is logged and ignored.
    pub fn from_settings(settings: &PluginSettings) -> Self {
        let config = settings
            .config_path
            .as_ref()
            .filter(|path| path.exists())
            .and_then(|path| match CentralConfig::load(path) {
                Ok(config) => Some(config),
                Err(e) => {
                    error!("Failed to load plugin config from {:?}: {:#}", path, e);
                    None
                }
            });
        Self::new(settings.dirs.clone(), config)
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn config(&self) -> Option<&CentralConfig> {
        self.config.as_ref()
    }

    /// All valid, enabled manifests. Unreadable manifests are logged and
    /// skipped.
    #[instrument(skip(self))]
    pub fn discover(&self) -> Vec<PluginManifest> {
        let mut manifests = Vec::new();

        for root in &self.roots {
            if !root.exists() {
                debug!("Plugin directory {:?} does not exist, skipping.", root);
                continue;
            }

            let walker = WalkDir::new(root)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || e.file_name() != TEMPLATES_DIR);

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("Skipping unreadable path under {:?}: {}", root, e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() || entry.file_name() != MANIFEST_FILE {
                    continue;
                }

                match PluginManifest::load(entry.path()) {
                    Ok(manifest) => manifests.push(manifest),
                    Err(e) => {
                        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
                        error!("Failed to load manifest for {}: {}", rel.display(), e);
                    }
                }
            }
        }

        match &self.config {
            Some(config) => config.apply(manifests),
            None => manifests,
        }
    }

    /// Fetch configured plugins that are missing from every root. Failures
    /// are logged; nothing here is fatal.
    #[instrument(skip(self))]
    pub async fn install_missing(&self) {
        let Some(config) = &self.config else {
            return;
        };
        let Some(install_dir) = self
            .roots
            .iter()
            .find(|d| d.file_name().map_or(false, |n| n == INSTALL_DIR_NAME))
            .or_else(|| self.roots.first())
        else {
            return;
        };

        for (name, entry) in &config.plugins {
            let Some(source) = entry.source.as_deref() else {
                continue;
            };
            if self.roots.iter().any(|root| root.join(name).exists()) {
                continue;
            }
            if let Err(e) = tokio::fs::create_dir_all(install_dir).await {
                error!("Failed to create install dir {:?}: {}", install_dir, e);
                return;
            }

            info!("Auto-installing missing plugin {} from {}...", name, source);
            if let Err(e) = fetch_plugin(source, &install_dir.join(name)).await {
                error!("Failed to install {}: {:#}", name, e);
            }
        }
    }
}

async fn fetch_plugin(source: &str, target: &Path) -> Result<()> {
    if !(source.starts_with("http") || source.starts_with("git@")) {
        warn!("Unknown source format: {}", source);
        return Ok(());
    }

    let output = Command::new("git")
        .arg("clone")
        .arg(source)
        .arg(target)
        .output()
        .await
        .context("failed to run git")?;

    if !output.status.success() {
        anyhow::bail!("{}", String::from_utf8_lossy(&output.stderr).trim());
    }
    info!("Successfully installed plugin to {:?}", target);
    Ok(())
}

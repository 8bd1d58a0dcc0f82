//! Built-in declarative UI plugin.
//!
//! Used for `ui` manifests whose directory carries no extension unit, or whose
//! unit registers no implementation. It serves static files described by the
//! manifest `config`:
//!
//! ```toml
//! [config]
//! static_dir = "build"   # relative to the plugin directory; default "dist"
//! html = true            # serve index.html for "/" and as SPA fallback
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use crate::manifest::PluginManifest;
use crate::plugin::Plugin;

const DEFAULT_STATIC_DIR: &str = "dist";
const INDEX_FILE: &str = "index.html";

/// Static content root of a UI plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticSite {
    pub root: PathBuf,
    pub html: bool,
}

impl StaticSite {
    pub fn from_manifest(manifest: &PluginManifest) -> Self {
        let root = match manifest.config.get("static_dir").and_then(|v| v.as_str()) {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => manifest.path.join(dir),
            None => manifest.path.join(DEFAULT_STATIC_DIR),
        };
        let html = manifest
            .config
            .get("html")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        Self { root, html }
    }

    /// Map a request path to a file under the root. Unknown paths fall back to
    /// `index.html` when `html` is enabled.
    pub fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        if !self.root.is_dir() {
            return None;
        }

        let relative = request_path.trim_start_matches('/');
        if !relative.is_empty() {
            let candidate = Path::new(relative);
            let escapes = candidate
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if escapes {
                debug!("Rejected static path {}", request_path);
                return None;
            }
            let file = self.root.join(candidate);
            if file.is_file() {
                return Some(file);
            }
        }

        if self.html {
            let index = self.root.join(INDEX_FILE);
            if index.is_file() {
                return Some(index);
            }
        }
        None
    }
}

/// Plugin instance for a purely declarative UI manifest.
pub struct UiPlugin {
    manifest: PluginManifest,
    site: StaticSite,
}

impl UiPlugin {
    pub fn new(manifest: PluginManifest) -> Self {
        let site = StaticSite::from_manifest(&manifest);
        Self { manifest, site }
    }
}

#[async_trait]
impl Plugin for UiPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    async fn initialize(&mut self) -> Result<()> {
        info!(
            plugin = %self.manifest.name,
            root = %self.site.root.display(),
            "Serving declarative UI"
        );
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn static_site(&self) -> Option<StaticSite> {
        Some(self.site.clone())
    }
}

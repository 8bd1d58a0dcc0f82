//! Plugin manifest model (`plugin.toml`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use crate::error::PluginError;
use crate::skill::Skill;

/// File name searched for during discovery.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Companion natural-language capability document.
pub const SKILL_FILE: &str = "SKILL.md";

/// Namespace prefix for derived module identifiers.
const MODULE_NAMESPACE: &str = "reactor_plugins";

/// Type of plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Core,
    Router,
    App,
    Model,
    Agent,
    Ui,
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginType::Core => "core",
            PluginType::Router => "router",
            PluginType::App => "app",
            PluginType::Model => "model",
            PluginType::Agent => "agent",
            PluginType::Ui => "ui",
        };
        f.write_str(s)
    }
}

/// Load phase. Phases run in declaration order, each once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum PluginTiming {
    #[serde(rename = "pre-init")]
    PreInit,
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "after-init")]
    AfterInit,
}

impl PluginTiming {
    pub const ALL: [PluginTiming; 3] = [
        PluginTiming::PreInit,
        PluginTiming::Default,
        PluginTiming::AfterInit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginTiming::PreInit => "pre-init",
            PluginTiming::Default => "default",
            PluginTiming::AfterInit => "after-init",
        }
    }
}

impl fmt::Display for PluginTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginTiming {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre-init" => Ok(PluginTiming::PreInit),
            "default" => Ok(PluginTiming::Default),
            "after-init" => Ok(PluginTiming::AfterInit),
            other => Err(format!("unknown plugin timing '{}'", other)),
        }
    }
}

/// Immutable description of one plugin occurrence on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    #[serde(default)]
    pub timing: PluginTiming,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Advisory list of external package identifiers; never resolved here.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Directory containing the manifest, stamped by discovery.
    #[serde(skip)]
    pub path: PathBuf,
    #[serde(skip)]
    pub skill: Option<Skill>,
}

impl PluginManifest {
    /// Parse and validate a manifest document.
    pub fn from_toml(source: &str) -> Result<Self, PluginError> {
        let manifest: PluginManifest =
            toml::from_str(source).map_err(|e| PluginError::Manifest {
                path: PathBuf::new(),
                reason: e.to_string(),
            })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read `plugin.toml`, stamp its containing directory and attach the
    /// companion skill document when one parses.
    pub fn load(manifest_path: &Path) -> Result<Self, PluginError> {
        let source = std::fs::read_to_string(manifest_path).map_err(|e| PluginError::Manifest {
            path: manifest_path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut manifest = Self::from_toml(&source).map_err(|e| match e {
            PluginError::Manifest { reason, .. } => PluginError::Manifest {
                path: manifest_path.to_path_buf(),
                reason,
            },
            other => other,
        })?;

        let dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
        manifest.path = canonical_dir(dir);

        let skill_path = manifest.path.join(SKILL_FILE);
        if skill_path.exists() {
            manifest.skill = crate::skill::parse_skill_file(&skill_path, &manifest.name);
            if manifest.skill.is_some() {
                tracing::info!("Loaded skill definition for plugin {}", manifest.name);
            }
        }

        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        let invalid = |reason: &str| PluginError::InvalidManifest {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.name.contains(['/', '\\']) {
            return Err(invalid("name must not contain path separators"));
        }
        if self.version.trim().is_empty() {
            return Err(invalid("version must not be empty"));
        }
        if let Some(entry) = &self.entry_point {
            let entry = Path::new(entry);
            let escapes = entry
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if escapes {
                return Err(invalid("entry_point must be a relative path inside the plugin directory"));
            }
        }
        Ok(())
    }

    /// Identifier under which the plugin's code unit is registered.
    pub fn module_name(&self) -> String {
        format!("{}.{}", MODULE_NAMESPACE, self.name.replace('-', "_"))
    }
}

/// Conventional code unit file name used when `entry_point` is absent.
pub fn default_entry_file() -> String {
    library_file("plugin")
}

/// Platform file name of the shared library `stem`, e.g. `libfoo.so`.
pub fn library_file(stem: &str) -> String {
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        stem,
        std::env::consts::DLL_SUFFIX
    )
}

/// Sorted, de-duplicated union of `dependencies` across manifests.
pub fn dependency_union(manifests: &[PluginManifest]) -> Vec<String> {
    manifests
        .iter()
        .flat_map(|m| m.dependencies.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn canonical_dir(dir: &Path) -> PathBuf {
    dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf())
}

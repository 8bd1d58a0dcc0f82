//! Host configuration with environment variable support and validation.

use anyhow::{anyhow, Result};
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// "text" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Plugin discovery and native library loading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Search roots scanned for `plugin.toml`.
    pub dirs: Vec<PathBuf>,
    /// Central plugin configuration file.
    pub config_path: Option<PathBuf>,
    pub allowed_extensions: Vec<String>,
    pub max_plugin_size_mb: u64,
    /// Only load libraries whose SHA-256 is in `allowlist_hashes`.
    pub require_signatures: bool,
    pub allowlist_hashes: Vec<String>,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            dirs: vec![PathBuf::from("plugins")],
            config_path: None,
            allowed_extensions: vec![".so".to_string(), ".dll".to_string(), ".dylib".to_string()],
            max_plugin_size_mb: 50,
            require_signatures: false,
            allowlist_hashes: vec![],
        }
    }
}

/// Cache store location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// sled database directory; in-memory when unset.
    pub path: Option<PathBuf>,
}

/// Agent runtime binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// USER-scoped secret holding the model API key.
    pub api_key_secret: String,
    pub model: String,
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key_secret: "GEMINI_API_KEY".to_string(),
            model: "gemini-2.0-flash".to_string(),
            system_prompt: "You are a helpful assistant for a creative production pipeline. \
                            Use the available tools when they apply."
                .to_string(),
        }
    }
}

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub plugins: PluginSettings,
    pub storage: StorageConfig,
    pub agent: AgentConfig,
}

impl Settings {
    /// Load settings from the embedded defaults, an optional local
    /// `reactor.toml`, and `REACTOR__*` environment variables.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("reactor").required(false))
            .add_source(
                Environment::with_prefix("REACTOR")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("plugins.dirs")
                    .with_list_parse_key("plugins.allowed_extensions")
                    .with_list_parse_key("plugins.allowlist_hashes")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Explicit single-variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("REACTOR_CONFIG_PATH") {
            self.plugins.config_path = Some(PathBuf::from(path));
        }
        if let Ok(dir) = std::env::var("REACTOR_PLUGIN_DIR") {
            let dir = PathBuf::from(dir);
            if !self.plugins.dirs.contains(&dir) {
                self.plugins.dirs.push(dir);
            }
        }
        if let Ok(path) = std::env::var("REACTOR_DB_PATH") {
            self.storage.path = Some(PathBuf::from(path));
        }
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(anyhow!("Unknown log format '{}'", self.logging.format));
        }

        if self.plugins.max_plugin_size_mb == 0 {
            return Err(anyhow!("Max plugin size cannot be 0"));
        }
        if self.plugins.allowed_extensions.is_empty() {
            return Err(anyhow!("At least one plugin library extension must be allowed"));
        }
        if self.plugins.require_signatures && self.plugins.allowlist_hashes.is_empty() {
            return Err(anyhow!(
                "Plugin signatures required but no allowlist hashes configured"
            ));
        }

        for dir in &self.plugins.dirs {
            if !dir.exists() {
                warn!("Plugin directory does not exist: {:?}", dir);
            }
        }
        if let Some(path) = &self.plugins.config_path {
            if !path.exists() {
                warn!("Central plugin configuration not found: {:?}", path);
            }
        }

        Ok(())
    }
}

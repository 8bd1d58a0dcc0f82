//! Typed error taxonomies for plugin loading, storage and resource managers.

use std::path::PathBuf;
use thiserror::Error;

/// Per-plugin failures. Any of these excludes the plugin from the registry
/// without affecting its siblings.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to read manifest {path:?}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("invalid manifest for '{name}': {reason}")]
    InvalidManifest { name: String, reason: String },

    #[error("no entry point found for plugin '{name}' at {dir:?}")]
    MissingEntry { name: String, dir: PathBuf },

    #[error("failed to load extension unit {path:?}: {reason}")]
    Library { path: PathBuf, reason: String },

    #[error("no plugin implementation registered by '{module}'")]
    NoExtension { module: String },

    #[error("'{module}' registered {count} plugin implementations, expected exactly one")]
    AmbiguousExtension { module: String, count: usize },

    #[error("plugin '{name}' failed to initialize: {source}")]
    Initialization {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("duplicate tool name '{tool}' in plugin {plugin}")]
    DuplicateTool { plugin: String, tool: String },
}

/// Key-value store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("data must be JSON-serializable: collection '{collection}', key '{key}': {source}")]
    NotSerializable {
        collection: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),
}

/// Failures surfaced by the project, secret and entity managers.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid entity URI: {0}")]
    InvalidUri(String),

    #[error("PROJECT-scoped secret '{0}' requires a project")]
    MissingProject(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("provider rejected request: {0}")]
    Provider(#[source] anyhow::Error),
}

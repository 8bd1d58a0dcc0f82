//! Reactor host - core library
//!
//! Discovers plugins from manifests, loads them in ordered phases through a
//! native plugin ABI, extracts their tools and skills, and provides
//! cache-backed project, secret and entity managers.

pub mod agent;
pub mod cli;
pub mod context;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod events;
pub mod host;
pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod metrics;
pub mod plugin;
pub mod resources;
pub mod settings;
pub mod skill;
pub mod store;
pub mod telemetry;
pub mod tools;
pub mod ui;

pub use context::HostContext;
pub use error::{PluginError, ResourceError, StoreError};
pub use host::Host;
pub use loader::PluginManager;
pub use manifest::{PluginManifest, PluginTiming, PluginType};
pub use plugin::{ExtensionTable, Plugin, PluginRegistrar};

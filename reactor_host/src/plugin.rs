//! Plugin extension point and extension-unit loading.
//!
//! An extension unit is either a compiled-in registration function listed in
//! an [`ExtensionTable`] or a native shared library exporting
//! `register_plugin(&mut PluginRegistrar)`. Either way the unit must register
//! exactly one plugin implementation.

use anyhow::Result;
use async_trait::async_trait;
use libloading::{Library, Symbol};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::context::HostContext;
use crate::error::PluginError;
use crate::manifest::{PluginManifest, PluginType};
use crate::metrics::TelemetryProvider;
use crate::settings::PluginSettings;
use crate::tools::Capability;
use crate::ui::StaticSite;

/// Symbol every native plugin library must export.
pub const REGISTER_SYMBOL: &[u8] = b"register_plugin";

type RegisterPluginFn = unsafe extern "C" fn(&mut PluginRegistrar);

/// Registration function of a statically linked plugin.
pub type RegisterFn = fn(&mut PluginRegistrar);

/// Builds a plugin instance from its manifest and the shared host context.
pub type PluginFactory =
    Arc<dyn Fn(PluginManifest, Arc<HostContext>) -> Box<dyn Plugin> + Send + Sync>;

/// The extension point every plugin implements.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn manifest(&self) -> &PluginManifest;

    async fn initialize(&mut self) -> Result<()>;

    async fn shutdown(&mut self) -> Result<()>;

    /// Methods this plugin exposes. Only those marked as tools are bound to
    /// the agent runtime.
    fn capabilities(&self) -> Vec<Capability> {
        Vec::new()
    }

    /// Static content served on behalf of a UI plugin.
    fn static_site(&self) -> Option<StaticSite> {
        None
    }

    /// Metrics sink attached to the host once this plugin is initialized.
    fn telemetry_provider(&self) -> Option<Arc<dyn TelemetryProvider>> {
        None
    }

    fn name(&self) -> &str {
        &self.manifest().name
    }

    fn plugin_type(&self) -> PluginType {
        self.manifest().plugin_type
    }
}

/// Passed to an extension unit's registration function, which calls
/// [`PluginRegistrar::register_plugin`] for each implementation it provides.
pub struct PluginRegistrar {
    module: String,
    candidates: Vec<(String, PluginFactory)>,
}

impl PluginRegistrar {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            candidates: Vec::new(),
        }
    }

    /// Module identifier the unit is being loaded under.
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn register_plugin<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(PluginManifest, Arc<HostContext>) -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        debug!(module = %self.module, type_name, "Plugin implementation registered");
        self.candidates.push((type_name.to_string(), Arc::new(factory)));
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// The single registered factory, `None` if nothing was registered.
    pub fn into_single(mut self) -> Result<Option<PluginFactory>, PluginError> {
        match self.candidates.len() {
            0 => Ok(None),
            1 => Ok(self.candidates.pop().map(|(_, factory)| factory)),
            count => Err(PluginError::AmbiguousExtension {
                module: self.module,
                count,
            }),
        }
    }
}

/// Compiled-in extension units keyed by module identifier. Consulted before
/// any native library is opened.
#[derive(Default, Clone)]
pub struct ExtensionTable {
    entries: HashMap<String, RegisterFn>,
}

impl ExtensionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: impl Into<String>, register: RegisterFn) -> &mut Self {
        self.entries.insert(module.into(), register);
        self
    }

    pub fn with(mut self, module: impl Into<String>, register: RegisterFn) -> Self {
        self.register(module, register);
        self
    }

    pub fn get(&self, module: &str) -> Option<RegisterFn> {
        self.entries.get(module).copied()
    }

    pub fn contains(&self, module: &str) -> bool {
        self.entries.contains_key(module)
    }
}

impl std::fmt::Debug for ExtensionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut modules: Vec<_> = self.entries.keys().collect();
        modules.sort();
        f.debug_struct("ExtensionTable").field("modules", &modules).finish()
    }
}

/// Checks applied to a native library before it is opened.
#[derive(Debug, Clone)]
pub struct PluginSecurityConfig {
    /// SHA-256 hashes (lowercase hex) of libraries allowed to load.
    pub allowed_hashes: HashSet<String>,
    /// Enforce `allowed_hashes`.
    pub require_signatures: bool,
    /// Maximum library size in bytes.
    pub max_plugin_size: u64,
    /// Allowed file extensions including the leading dot.
    pub allowed_extensions: HashSet<String>,
}

impl Default for PluginSecurityConfig {
    fn default() -> Self {
        Self {
            allowed_hashes: HashSet::new(),
            require_signatures: false,
            max_plugin_size: 50 * 1024 * 1024,
            allowed_extensions: [".so", ".dll", ".dylib"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl PluginSecurityConfig {
    pub fn from_settings(settings: &PluginSettings) -> Self {
        Self {
            allowed_hashes: settings
                .allowlist_hashes
                .iter()
                .map(|h| h.to_lowercase())
                .collect(),
            require_signatures: settings.require_signatures,
            max_plugin_size: settings.max_plugin_size_mb * 1024 * 1024,
            allowed_extensions: settings
                .allowed_extensions
                .iter()
                .map(|e| {
                    if e.starts_with('.') {
                        e.clone()
                    } else {
                        format!(".{}", e)
                    }
                })
                .collect(),
        }
    }

    /// Validate the file and return its SHA-256.
    pub fn verify(&self, lib_path: &Path) -> Result<String, PluginError> {
        let reject = |reason: String| PluginError::Library {
            path: lib_path.to_path_buf(),
            reason,
        };

        let extension = lib_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .ok_or_else(|| reject("file has no extension".into()))?;
        if !self.allowed_extensions.contains(&extension) {
            return Err(reject(format!("extension '{}' not allowed", extension)));
        }

        let metadata = fs::metadata(lib_path).map_err(|e| reject(format!("metadata: {}", e)))?;
        if metadata.len() > self.max_plugin_size {
            return Err(reject(format!(
                "file too large: {} bytes (max: {})",
                metadata.len(),
                self.max_plugin_size
            )));
        }

        let content = fs::read(lib_path).map_err(|e| reject(format!("read: {}", e)))?;
        let hash = sha256_hex(&content);

        if self.require_signatures {
            if self.allowed_hashes.is_empty() {
                error!("Plugin allowlist is empty but signature verification is enabled");
                return Err(reject("allowlist must be configured when signatures are required".into()));
            }
            if !self.allowed_hashes.contains(&hash) {
                error!("Plugin hash not in allowlist: {} ({})", hash, lib_path.display());
                return Err(reject(format!("hash {} not in allowlist", hash)));
            }
            info!("Plugin hash verified: {} ({})", &hash[..16], lib_path.display());
        } else {
            debug!("Plugin signature verification disabled for {}", lib_path.display());
        }

        Ok(hash)
    }
}

pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// An opened native plugin library. Must outlive every plugin instance it
/// produced.
#[derive(Debug)]
pub struct NativeLibrary {
    library: Library,
    hash: String,
    path: PathBuf,
}

impl NativeLibrary {
    /// Verify and open a shared library.
    ///
    /// # Safety
    /// Opening a library runs its initializers; the caller trusts the file
    /// once it has passed `security`.
    #[instrument(skip(security))]
    pub unsafe fn open(lib_path: &Path, security: &PluginSecurityConfig) -> Result<Self, PluginError> {
        let hash = security.verify(lib_path)?;
        info!("Loading plugin library: {:?} (hash: {})", lib_path, &hash[..16]);

        let library = Library::new(lib_path).map_err(|e| PluginError::Library {
            path: lib_path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            library,
            hash,
            path: lib_path.to_path_buf(),
        })
    }

    /// Run the library's registration function against `registrar`.
    ///
    /// # Safety
    /// The library must have been built against this crate's plugin ABI.
    pub unsafe fn register(&self, registrar: &mut PluginRegistrar) -> Result<(), PluginError> {
        let register: Symbol<RegisterPluginFn> =
            self.library
                .get(REGISTER_SYMBOL)
                .map_err(|e| PluginError::Library {
                    path: self.path.clone(),
                    reason: format!("missing 'register_plugin' symbol: {}", e),
                })?;

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| register(registrar)));
        if result.is_err() {
            error!("Plugin registration panicked: {:?}", self.path);
            return Err(PluginError::Library {
                path: self.path.clone(),
                reason: "registration panicked".into(),
            });
        }
        Ok(())
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Resolve the factory for `module`: compiled-in table first, then the
/// native library at `entry` if there is one.
pub(crate) fn resolve_factory(
    module: &str,
    entry: Option<&Path>,
    table: &ExtensionTable,
    security: &PluginSecurityConfig,
) -> Result<(Option<PluginFactory>, Option<Arc<NativeLibrary>>), PluginError> {
    let mut registrar = PluginRegistrar::new(module);

    if let Some(register) = table.get(module) {
        debug!(module, "Using compiled-in extension unit");
        register(&mut registrar);
        return Ok((registrar.into_single()?, None));
    }

    let Some(entry) = entry else {
        return Ok((None, None));
    };

    let library = unsafe { NativeLibrary::open(entry, security)? };
    unsafe { library.register(&mut registrar)? };
    if registrar.is_empty() {
        warn!(module, "Library {:?} registered no plugin implementation", entry);
    }
    Ok((registrar.into_single()?, Some(Arc::new(library))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    struct Noop(PluginManifest);

    #[async_trait]
    impl Plugin for Noop {
        fn manifest(&self) -> &PluginManifest {
            &self.0
        }
        async fn initialize(&mut self) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn register_one(registrar: &mut PluginRegistrar) {
        registrar.register_plugin("Noop", |manifest, _ctx| Box::new(Noop(manifest)));
    }

    fn register_two(registrar: &mut PluginRegistrar) {
        register_one(registrar);
        register_one(registrar);
    }

    #[test]
    fn test_registrar_requires_exactly_one_candidate() {
        let empty = PluginRegistrar::new("reactor_plugins.none");
        assert!(empty.into_single().unwrap().is_none());

        let mut one = PluginRegistrar::new("reactor_plugins.one");
        register_one(&mut one);
        assert!(one.into_single().unwrap().is_some());

        let mut two = PluginRegistrar::new("reactor_plugins.two");
        register_two(&mut two);
        assert!(matches!(
            two.into_single(),
            Err(PluginError::AmbiguousExtension { count: 2, .. })
        ));
    }

    #[test]
    fn test_extension_table_takes_precedence() {
        let table = ExtensionTable::new().with("reactor_plugins.noop", register_one);
        let security = PluginSecurityConfig::default();

        let (factory, library) =
            resolve_factory("reactor_plugins.noop", Some(Path::new("/nonexistent.so")), &table, &security)
                .unwrap();
        assert!(factory.is_some());
        assert!(library.is_none());

        let (factory, _) = resolve_factory("reactor_plugins.other", None, &table, &security).unwrap();
        assert!(factory.is_none());
    }

    #[test]
    fn test_invalid_library_is_rejected_after_verification() {
        let dir = tempdir().unwrap();
        let lib = dir.path().join(crate::manifest::default_entry_file());
        File::create(&lib)
            .unwrap()
            .write_all(b"not a shared object")
            .unwrap();
        let security = PluginSecurityConfig {
            allowed_extensions: [std::env::consts::DLL_SUFFIX.to_string()].into_iter().collect(),
            ..PluginSecurityConfig::default()
        };
        assert!(security.verify(&lib).is_ok());

        let opened = unsafe { NativeLibrary::open(&lib, &security) };
        assert!(matches!(opened, Err(PluginError::Library { ref path, .. }) if path == &lib));

        let err = resolve_factory("reactor_plugins.garbage", Some(&lib), &ExtensionTable::new(), &security)
            .err()
            .unwrap();
        assert!(err.to_string().starts_with("failed to load extension unit"));
    }

    #[test]
    fn test_security_rejects_extension_and_size() {
        let dir = tempdir().unwrap();
        let txt = dir.path().join("plugin.txt");
        File::create(&txt).unwrap();

        let config = PluginSecurityConfig::default();
        assert!(matches!(config.verify(&txt), Err(PluginError::Library { .. })));

        let big = dir.path().join("plugin.so");
        File::create(&big).unwrap().write_all(&[0u8; 64]).unwrap();
        let tiny = PluginSecurityConfig {
            max_plugin_size: 16,
            ..PluginSecurityConfig::default()
        };
        assert!(tiny.verify(&big).is_err());
        assert!(config.verify(&big).is_ok());
    }

    #[test]
    fn test_allowlist_is_enforced() {
        let dir = tempdir().unwrap();
        let lib = dir.path().join("plugin.so");
        File::create(&lib).unwrap().write_all(b"test content").unwrap();
        let hash = "1eebdf4fdc9fc7bf283031b93f9aef3338de9052f6102a10437d17e1aaa9d93c";

        let mut config = PluginSecurityConfig {
            require_signatures: true,
            ..PluginSecurityConfig::default()
        };
        assert!(config.verify(&lib).is_err());

        config.allowed_hashes.insert("deadbeef".into());
        assert!(config.verify(&lib).is_err());

        config.allowed_hashes.insert(hash.into());
        assert_eq!(config.verify(&lib).unwrap(), hash);
    }
}

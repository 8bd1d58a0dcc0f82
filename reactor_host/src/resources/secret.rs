//! Secret manager with read-through caching and environment fallback.

use tracing::{debug, instrument, warn};

use crate::domain::{Secret, SecretScope};
use crate::error::ResourceError;
use crate::resources::provider::{ProviderSlot, SecretProvider};
use crate::store::Database;

pub const SECRETS_COLLECTION: &str = "secrets_cache";

pub struct SecretManager {
    db: Database,
    provider: ProviderSlot<dyn SecretProvider>,
}

impl SecretManager {
    pub fn new(db: Database, provider: ProviderSlot<dyn SecretProvider>) -> Self {
        Self { db, provider }
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_configured()
    }

    fn cache_key(key: &str, scope: SecretScope, project: Option<&str>) -> String {
        let project = match scope {
            SecretScope::Project => project.unwrap_or(""),
            SecretScope::User => "",
        };
        format!("{}:{}:{}", key, scope.as_str(), project)
    }

    /// Resolve a secret: cache, then provider, then (USER scope only) the
    /// process environment.
    #[instrument(skip(self))]
    pub async fn get_secret(
        &self,
        key: &str,
        scope: SecretScope,
        project: Option<&str>,
    ) -> Result<Option<String>, ResourceError> {
        if scope == SecretScope::Project && project.is_none() {
            debug!("PROJECT-scoped lookup for '{}' without a project", key);
            return Ok(None);
        }

        let cache_key = Self::cache_key(key, scope, project);
        if let Some(cached) = self.db.get_as::<Secret>(SECRETS_COLLECTION, &cache_key)? {
            return Ok(Some(cached.value));
        }

        if let Some(provider) = self.provider.get() {
            match provider.get_secret(key, scope, project).await {
                Ok(Some(secret)) => {
                    self.cache_secret(&secret)?;
                    return Ok(Some(secret.value));
                }
                Ok(None) => {}
                Err(e) => warn!("Secret provider lookup for '{}' failed: {}", key, e),
            }
        }

        if scope == SecretScope::User {
            return Ok(std::env::var(key).ok());
        }
        Ok(None)
    }

    /// Store a secret. With a provider configured, a refused write leaves the
    /// cache untouched and returns `false`.
    #[instrument(skip(self, value))]
    pub async fn set_secret(
        &self,
        key: &str,
        value: &str,
        scope: SecretScope,
        project: Option<&str>,
    ) -> Result<bool, ResourceError> {
        if scope == SecretScope::Project && project.is_none() {
            return Err(ResourceError::MissingProject(key.to_string()));
        }

        let secret = Secret {
            key: key.to_string(),
            value: value.to_string(),
            scope,
            project: project.map(str::to_string),
        };

        if let Some(provider) = self.provider.get() {
            match provider.set_secret(&secret).await {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(e) => {
                    warn!("Secret provider refused '{}': {}", key, e);
                    return Ok(false);
                }
            }
        }

        self.cache_secret(&secret)?;
        Ok(true)
    }

    pub fn clear_cache(&self) -> Result<usize, ResourceError> {
        Ok(self.db.clear_collection(SECRETS_COLLECTION)?)
    }

    fn cache_secret(&self, secret: &Secret) -> Result<(), ResourceError> {
        let key = Self::cache_key(&secret.key, secret.scope, secret.project.as_deref());
        let stored = Secret {
            project: match secret.scope {
                SecretScope::Project => secret.project.clone(),
                SecretScope::User => None,
            },
            ..secret.clone()
        };
        self.db.set(SECRETS_COLLECTION, &key, &stored)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct VaultMock {
        secrets: Mutex<HashMap<String, Secret>>,
        reads: AtomicUsize,
        accept_writes: bool,
    }

    #[async_trait]
    impl SecretProvider for VaultMock {
        async fn get_secret(
            &self,
            key: &str,
            _scope: SecretScope,
            _project: Option<&str>,
        ) -> anyhow::Result<Option<Secret>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.secrets.lock().get(key).cloned())
        }

        async fn set_secret(&self, secret: &Secret) -> anyhow::Result<bool> {
            if self.accept_writes {
                self.secrets.lock().insert(secret.key.clone(), secret.clone());
            }
            Ok(self.accept_writes)
        }
    }

    fn local() -> SecretManager {
        SecretManager::new(Database::in_memory(), ProviderSlot::NoProvider)
    }

    #[tokio::test]
    async fn test_scoped_secrets_are_independent() {
        let mgr = local();
        assert!(mgr.set_secret("K", "u", SecretScope::User, None).await.unwrap());
        assert!(mgr.set_secret("K", "p", SecretScope::Project, Some("proj1")).await.unwrap());

        assert_eq!(mgr.get_secret("K", SecretScope::User, None).await.unwrap().as_deref(), Some("u"));
        assert_eq!(
            mgr.get_secret("K", SecretScope::Project, Some("proj1")).await.unwrap().as_deref(),
            Some("p")
        );
        assert_eq!(mgr.get_secret("K", SecretScope::Project, Some("proj2")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_user_scope_falls_back_to_environment() {
        let mgr = local();
        std::env::set_var("REACTOR_TEST_SECRET_ENV_ONLY", "from-env");
        assert_eq!(
            mgr.get_secret("REACTOR_TEST_SECRET_ENV_ONLY", SecretScope::User, None)
                .await
                .unwrap()
                .as_deref(),
            Some("from-env")
        );
        assert_eq!(
            mgr.get_secret("REACTOR_TEST_SECRET_ENV_ONLY", SecretScope::Project, Some("p"))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_project_scope_requires_project() {
        let mgr = local();
        let err = mgr.set_secret("K", "v", SecretScope::Project, None).await.unwrap_err();
        assert!(matches!(err, ResourceError::MissingProject(_)));
        assert_eq!(mgr.get_secret("K", SecretScope::Project, None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_provider_read_is_cached() {
        let vault = Arc::new(VaultMock::default());
        vault.secrets.lock().insert(
            "API".into(),
            Secret {
                key: "API".into(),
                value: "xyz".into(),
                scope: SecretScope::User,
                project: None,
            },
        );
        let mgr = SecretManager::new(Database::in_memory(), ProviderSlot::Provider(vault.clone()));

        assert_eq!(mgr.get_secret("API", SecretScope::User, None).await.unwrap().as_deref(), Some("xyz"));
        assert_eq!(mgr.get_secret("API", SecretScope::User, None).await.unwrap().as_deref(), Some("xyz"));
        assert_eq!(vault.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refused_write_skips_cache() {
        let vault = Arc::new(VaultMock::default());
        let db = Database::in_memory();
        let mgr = SecretManager::new(db.clone(), ProviderSlot::Provider(vault));

        assert!(!mgr.set_secret("K", "v", SecretScope::User, None).await.unwrap());
        assert!(db.list_keys(SECRETS_COLLECTION).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let mgr = local();
        mgr.set_secret("A", "1", SecretScope::User, None).await.unwrap();
        mgr.set_secret("B", "2", SecretScope::User, None).await.unwrap();
        assert_eq!(mgr.clear_cache().unwrap(), 2);
    }
}

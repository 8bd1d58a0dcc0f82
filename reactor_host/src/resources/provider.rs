//! External-system adapters behind the resource managers.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::{Entity, Project, Secret, SecretScope, Version};

/// Optional provider. `NoProvider` means the cache is the source of truth.
pub enum ProviderSlot<P: ?Sized> {
    NoProvider,
    Provider(Arc<P>),
}

impl<P: ?Sized> ProviderSlot<P> {
    pub fn get(&self) -> Option<&Arc<P>> {
        match self {
            ProviderSlot::NoProvider => None,
            ProviderSlot::Provider(p) => Some(p),
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, ProviderSlot::Provider(_))
    }
}

impl<P: ?Sized> Clone for ProviderSlot<P> {
    fn clone(&self) -> Self {
        match self {
            ProviderSlot::NoProvider => ProviderSlot::NoProvider,
            ProviderSlot::Provider(p) => ProviderSlot::Provider(p.clone()),
        }
    }
}

impl<P: ?Sized> Default for ProviderSlot<P> {
    fn default() -> Self {
        ProviderSlot::NoProvider
    }
}

impl<P: ?Sized> From<Arc<P>> for ProviderSlot<P> {
    fn from(provider: Arc<P>) -> Self {
        ProviderSlot::Provider(provider)
    }
}

impl<P: ?Sized> std::fmt::Debug for ProviderSlot<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderSlot::NoProvider => f.write_str("NoProvider"),
            ProviderSlot::Provider(_) => f.write_str("Provider(..)"),
        }
    }
}

/// Project tracker integration (Kitsu, ftrack, ShotGrid, ...).
///
/// Lookups return `Ok(None)` for not-found; `Err` is reserved for transport
/// or service failures.
#[async_trait]
pub trait ProjectManagerProvider: Send + Sync {
    async fn get_entity(&self, uri: &str) -> Result<Option<Entity>>;
    async fn get_version(&self, uri: &str, version: &str) -> Result<Option<Version>>;
    async fn create_entity(&self, entity: Entity) -> Result<Entity>;
    async fn update_entity(&self, uri: &str, entity: Entity) -> Result<Entity>;

    async fn fetch_project(&self, name: &str) -> Result<Option<Project>>;
    async fn fetch_projects(&self) -> Result<Vec<Project>>;
    /// Entities to warm the entity cache with after a project fetch.
    async fn prefetch_entities_for_project(&self, _name: &str) -> Result<Vec<Entity>> {
        Ok(Vec::new())
    }
}

/// Secret vault integration (Vault, AWS Secrets Manager, ...).
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get_secret(
        &self,
        key: &str,
        scope: SecretScope,
        project: Option<&str>,
    ) -> Result<Option<Secret>>;

    /// Returns whether the vault accepted the write.
    async fn set_secret(&self, secret: &Secret) -> Result<bool>;
}

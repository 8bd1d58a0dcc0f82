//! Entity manager: version-aware URI resolution over the entity cache.
//!
//! All versions of an entity live in one cached document keyed by the base
//! URI. Version-scoped reads filter that union and only reach the provider
//! when the requested version is missing from it.
//!
//! Events emitted on the shared bus:
//! - `entity.added` with `[entity]`
//! - `entity.updated` with `[uri, entity]`
//! - `entity.opened` with `[uri, version_id]`

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::domain::{Entity, EntityUpdate, Version};
use crate::error::ResourceError;
use crate::events::EventBus;
use crate::resources::provider::{ProjectManagerProvider, ProviderSlot};
use crate::resources::uri::{cache_key, EntityUri};
use crate::store::Database;

pub const ENTITIES_COLLECTION: &str = "entities_cache";

pub struct EntityManager {
    db: Database,
    provider: ProviderSlot<dyn ProjectManagerProvider>,
    events: Arc<EventBus>,
}

impl EntityManager {
    pub fn new(
        db: Database,
        provider: ProviderSlot<dyn ProjectManagerProvider>,
        events: Arc<EventBus>,
    ) -> Self {
        Self { db, provider, events }
    }

    /// Resolve an entity URI. With `?version=` the result carries only that
    /// version.
    #[instrument(skip(self))]
    pub async fn get_entity(&self, uri: &str) -> Result<Option<Entity>, ResourceError> {
        let parsed = EntityUri::parse(uri)?;
        let key = parsed.base();

        if let Some(cached) = self.db.get_as::<Entity>(ENTITIES_COLLECTION, &key)? {
            let Some(version) = parsed.version.as_deref() else {
                return Ok(Some(cached));
            };
            if cached.version(version).is_some() {
                return Ok(Some(cached.only_version(version)));
            }
            debug!(version, "Version not in cached union");
        }

        self.fetch_from_provider(&parsed).await
    }

    async fn fetch_from_provider(&self, uri: &EntityUri) -> Result<Option<Entity>, ResourceError> {
        let Some(provider) = self.provider.get() else {
            return Ok(None);
        };
        let base = uri.base();

        let Some(version_id) = uri.version.as_deref() else {
            return match provider.get_entity(&base).await {
                Ok(Some(entity)) => {
                    self.cache_union(&entity)?;
                    Ok(Some(entity))
                }
                Ok(None) => Ok(None),
                Err(e) => {
                    warn!("Provider failed to fetch entity {}: {}", base, e);
                    Ok(None)
                }
            };
        };

        let version = match provider.get_version(&base, version_id).await {
            Ok(Some(version)) => version,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("Provider failed to fetch {} version {}: {}", base, version_id, e);
                return Ok(None);
            }
        };

        match provider.get_entity(&base).await {
            Ok(Some(mut entity)) => {
                entity.versions = merge_versions(entity.versions, std::slice::from_ref(&version));
                self.cache_union(&entity)?;
                let mut filtered = entity.only_version(version_id);
                filtered.uri = base;
                return Ok(Some(filtered));
            }
            Ok(None) => {}
            Err(e) => warn!("Provider failed to fetch entity {}: {}", base, e),
        }

        // Keep the version we did get so the next lookup is a cache hit.
        let shell = match self.db.get_as::<Entity>(ENTITIES_COLLECTION, &base)? {
            Some(existing) => Entity {
                versions: Vec::new(),
                ..existing
            },
            None => Entity::new(
                base.clone(),
                uri.leaf_name(),
                uri.project.clone(),
                uri.entity_type.clone(),
            ),
        };
        let minimal = shell.with_version(version);
        self.cache_union(&minimal)?;
        Ok(Some(minimal))
    }

    /// Cache the entity and optionally publish it. `entity.added` is emitted
    /// once the cache holds the entity, before any publish error is returned.
    #[instrument(skip(self, entity), fields(uri = %entity.uri))]
    pub async fn add_entity(&self, entity: Entity, publish: bool) -> Result<Entity, ResourceError> {
        self.cache_union(&entity)?;

        let (entity, publish_error) = self.publish(entity, publish, None).await?;
        self.events.emit("entity.added", vec![to_payload(&entity)]).await;

        match publish_error {
            Some(e) => Err(ResourceError::Provider(e)),
            None => Ok(entity),
        }
    }

    /// Apply a partial update to the full cached entity behind `uri`.
    #[instrument(skip(self, update))]
    pub async fn update_entity(
        &self,
        uri: &str,
        update: EntityUpdate,
        publish: bool,
    ) -> Result<Option<Entity>, ResourceError> {
        let Some(mut entity) = self.get_entity(&cache_key(uri)?).await? else {
            return Ok(None);
        };
        update.apply(&mut entity);
        self.cache_entity(&entity)?;

        let (entity, publish_error) = self.publish(entity, publish, Some(uri)).await?;
        self.events
            .emit("entity.updated", vec![json!(uri), to_payload(&entity)])
            .await;

        match publish_error {
            Some(e) => Err(ResourceError::Provider(e)),
            None => Ok(Some(entity)),
        }
    }

    async fn publish(
        &self,
        entity: Entity,
        publish: bool,
        update_uri: Option<&str>,
    ) -> Result<(Entity, Option<anyhow::Error>), ResourceError> {
        let provider = match self.provider.get() {
            Some(provider) if publish => provider,
            _ => return Ok((entity, None)),
        };

        let published = match update_uri {
            Some(uri) => provider.update_entity(uri, entity.clone()).await,
            None => provider.create_entity(entity.clone()).await,
        };
        match published {
            Ok(remote) => {
                match update_uri {
                    Some(_) => self.cache_entity(&remote)?,
                    None => self.cache_union(&remote)?,
                }
                Ok((remote, None))
            }
            Err(e) => {
                warn!("Failed to publish entity {}: {}", entity.uri, e);
                Ok((entity, Some(e)))
            }
        }
    }

    /// Cached entities, optionally restricted to one type, sorted by URI.
    pub fn list_entities(&self, entity_type: Option<&str>) -> Result<Vec<Entity>, ResourceError> {
        let mut entities: Vec<Entity> = self
            .db
            .get_all(ENTITIES_COLLECTION)?
            .into_iter()
            .filter_map(|(key, doc)| match serde_json::from_value::<Entity>(doc) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    warn!("Skipping unreadable entity {}: {}", key, e);
                    None
                }
            })
            .filter(|e| entity_type.map_or(true, |t| e.entity_type == t))
            .collect();
        entities.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(entities)
    }

    /// Resolve the dependencies declared by one version of `entity`. Each
    /// value holds only the pinned dependency version; unresolvable
    /// dependencies are left out.
    pub async fn resolve_dependencies(
        &self,
        entity: &Entity,
        version_id: &str,
    ) -> Result<BTreeMap<String, Entity>, ResourceError> {
        let Some(version) = entity.version(version_id) else {
            return Ok(BTreeMap::new());
        };

        let mut resolved = BTreeMap::new();
        for (dep_uri, dep_version) in &version.dependencies {
            let pinned = format!("{}?version={}", dep_uri, dep_version);
            match self.get_entity(&pinned).await {
                Ok(Some(dep)) => {
                    resolved.insert(dep_uri.clone(), dep);
                }
                Ok(None) => debug!("Dependency {} not found", pinned),
                Err(e) => warn!("Skipping dependency {}: {}", pinned, e),
            }
        }
        Ok(resolved)
    }

    /// Resolve an entity for opening and announce it on `entity.opened`.
    /// Launching the owning application is left to listeners.
    pub async fn open(&self, uri: &str, version_id: Option<&str>) -> Result<Entity, ResourceError> {
        let full_uri = match version_id {
            Some(v) => format!("{}?version={}", cache_key(uri)?, v),
            None => uri.to_string(),
        };
        let entity = self
            .get_entity(&full_uri)
            .await?
            .ok_or_else(|| ResourceError::NotFound(format!("Entity {}", full_uri)))?;

        self.events
            .emit("entity.opened", vec![json!(uri), json!(version_id)])
            .await;
        Ok(entity)
    }

    fn cache_entity(&self, entity: &Entity) -> Result<(), ResourceError> {
        self.db.set(ENTITIES_COLLECTION, &cache_key(&entity.uri)?, entity)?;
        Ok(())
    }

    fn cache_union(&self, entity: &Entity) -> Result<(), ResourceError> {
        cache_entity_union(&self.db, entity)
    }
}

/// Cache `entity` merged into the cached version union: versions with the
/// same id are replaced, others are kept.
pub(crate) fn cache_entity_union(db: &Database, entity: &Entity) -> Result<(), ResourceError> {
    let key = cache_key(&entity.uri)?;
    let versions = match db.get_as::<Entity>(ENTITIES_COLLECTION, &key)? {
        Some(existing) => merge_versions(existing.versions, &entity.versions),
        None => entity.versions.clone(),
    };
    let merged = Entity {
        versions,
        ..entity.clone()
    };
    db.set(ENTITIES_COLLECTION, &key, &merged)?;
    Ok(())
}

fn merge_versions(mut into: Vec<Version>, from: &[Version]) -> Vec<Version> {
    for version in from {
        match into.iter_mut().find(|v| v.id == version.id) {
            Some(slot) => *slot = version.clone(),
            None => into.push(version.clone()),
        }
    }
    into
}

fn to_payload(entity: &Entity) -> Value {
    serde_json::to_value(entity).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Project;
    use crate::events::EventHandler;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HERO: &str = "entity://film/asset/characters/hero";

    #[derive(Default)]
    struct TrackerMock {
        entities: Mutex<HashMap<String, Entity>>,
        orphan_versions: Mutex<HashMap<String, Version>>,
        entity_calls: AtomicUsize,
        version_calls: AtomicUsize,
        reject_publish: bool,
    }

    #[async_trait]
    impl ProjectManagerProvider for TrackerMock {
        async fn get_entity(&self, uri: &str) -> anyhow::Result<Option<Entity>> {
            self.entity_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.entities.lock().get(uri).cloned())
        }
        async fn get_version(&self, uri: &str, version: &str) -> anyhow::Result<Option<Version>> {
            self.version_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(v) = self.orphan_versions.lock().get(version) {
                return Ok(Some(v.clone()));
            }
            Ok(self
                .entities
                .lock()
                .get(uri)
                .and_then(|e| e.version(version).cloned()))
        }
        async fn create_entity(&self, mut entity: Entity) -> anyhow::Result<Entity> {
            if self.reject_publish {
                anyhow::bail!("tracker rejected entity");
            }
            entity.description = Some("published".into());
            Ok(entity)
        }
        async fn update_entity(&self, _uri: &str, entity: Entity) -> anyhow::Result<Entity> {
            Ok(entity)
        }
        async fn fetch_project(&self, _name: &str) -> anyhow::Result<Option<Project>> {
            Ok(None)
        }
        async fn fetch_projects(&self) -> anyhow::Result<Vec<Project>> {
            Ok(Vec::new())
        }
    }

    fn local() -> (EntityManager, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        (
            EntityManager::new(Database::in_memory(), ProviderSlot::NoProvider, events.clone()),
            events,
        )
    }

    fn with_tracker(tracker: Arc<TrackerMock>) -> EntityManager {
        EntityManager::new(
            Database::in_memory(),
            ProviderSlot::Provider(tracker),
            Arc::new(EventBus::new()),
        )
    }

    #[tokio::test]
    async fn test_version_union_and_filter() {
        let (mgr, _) = local();
        let hero = Entity::new(HERO, "hero", "film", "asset")
            .with_version(Version::new("v1"))
            .with_version(Version::new("v2"));
        mgr.add_entity(hero, false).await.unwrap();

        let all = mgr.get_entity(HERO).await.unwrap().unwrap();
        assert_eq!(all.versions.len(), 2);

        let v1 = mgr
            .get_entity(&format!("{}?version=v1", HERO))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v1.versions.len(), 1);
        assert_eq!(v1.versions[0].id, "v1");

        assert!(mgr
            .get_entity(&format!("{}?version=v9", HERO))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_invalid_uri_is_rejected() {
        let (mgr, _) = local();
        assert!(matches!(
            mgr.get_entity("file:///hero").await,
            Err(ResourceError::InvalidUri(_))
        ));
    }

    #[tokio::test]
    async fn test_provider_read_through_then_cache_hit() {
        let tracker = Arc::new(TrackerMock::default());
        tracker.entities.lock().insert(
            HERO.into(),
            Entity::new(HERO, "hero", "film", "asset").with_version(Version::new("v1")),
        );
        let mgr = with_tracker(tracker.clone());

        assert!(mgr.get_entity(HERO).await.unwrap().is_some());
        assert!(mgr.get_entity(HERO).await.unwrap().is_some());
        assert!(mgr
            .get_entity(&format!("{}?version=v1", HERO))
            .await
            .unwrap()
            .is_some());
        assert_eq!(tracker.entity_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.version_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_version_only_fetch_caches_minimal_entity() {
        let tracker = Arc::new(TrackerMock::default());
        tracker
            .orphan_versions
            .lock()
            .insert("v7".into(), Version::new("v7"));
        let mgr = with_tracker(tracker.clone());

        let uri = format!("{}?version=v7", HERO);
        let entity = mgr.get_entity(&uri).await.unwrap().unwrap();
        assert_eq!(entity.name, "hero");
        assert_eq!(entity.uri, HERO);
        assert_eq!(entity.versions.len(), 1);

        mgr.get_entity(&uri).await.unwrap().unwrap();
        assert_eq!(tracker.version_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetched_version_missing_from_full_entity_is_kept() {
        let tracker = Arc::new(TrackerMock::default());
        tracker.entities.lock().insert(
            HERO.into(),
            Entity::new(HERO, "hero", "film", "asset").with_version(Version::new("v1")),
        );
        tracker
            .orphan_versions
            .lock()
            .insert("v7".into(), Version::new("v7"));
        let mgr = with_tracker(tracker.clone());

        let uri = format!("{}?version=v7", HERO);
        let entity = mgr.get_entity(&uri).await.unwrap().unwrap();
        assert_eq!(entity.versions.len(), 1);
        assert_eq!(entity.versions[0].id, "v7");

        let again = mgr.get_entity(&uri).await.unwrap().unwrap();
        assert_eq!(again.versions[0].id, "v7");
        assert_eq!(tracker.version_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.entity_calls.load(Ordering::SeqCst), 1);

        let all = mgr.get_entity(HERO).await.unwrap().unwrap();
        let ids: Vec<_> = all.versions.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["v1", "v7"]);
    }

    #[tokio::test]
    async fn test_resolve_dependencies() {
        let (mgr, _) = local();
        let texture = "entity://film/asset/textures/hero_diffuse";
        mgr.add_entity(
            Entity::new(texture, "hero_diffuse", "film", "asset")
                .with_version(Version::new("v4"))
                .with_version(Version::new("v5")),
            false,
        )
        .await
        .unwrap();

        let hero = Entity::new(HERO, "hero", "film", "asset")
            .with_version(Version::new("v1"))
            .with_version(Version::new("v2").with_dependency(texture, "v5"));
        mgr.add_entity(hero.clone(), false).await.unwrap();

        let deps = mgr.resolve_dependencies(&hero, "v2").await.unwrap();
        assert_eq!(deps.len(), 1);
        let tex = &deps[texture];
        assert_eq!(tex.versions.len(), 1);
        assert_eq!(tex.versions[0].id, "v5");

        assert!(mgr.resolve_dependencies(&hero, "v1").await.unwrap().is_empty());
        assert!(mgr.resolve_dependencies(&hero, "v3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_emits_event_and_keeps_versions() {
        let (mgr, events) = local();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.on(
            "entity.updated",
            EventHandler::blocking(move |args| {
                sink.lock().push(args);
                Ok(())
            }),
            false,
        );

        mgr.add_entity(
            Entity::new(HERO, "hero", "film", "asset")
                .with_version(Version::new("v1"))
                .with_version(Version::new("v2")),
            false,
        )
        .await
        .unwrap();

        let updated = mgr
            .update_entity(
                &format!("{}?version=v1", HERO),
                EntityUpdate {
                    description: Some("lead".into()),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.versions.len(), 2);
        assert_eq!(updated.description.as_deref(), Some("lead"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][1]["description"], "lead");

        assert!(mgr
            .update_entity("entity://film/asset/missing", EntityUpdate::default(), false)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_publish_recaches_provider_result() {
        let tracker = Arc::new(TrackerMock::default());
        let mgr = with_tracker(tracker);
        let added = mgr
            .add_entity(Entity::new(HERO, "hero", "film", "asset"), true)
            .await
            .unwrap();
        assert_eq!(added.description.as_deref(), Some("published"));
        let cached = mgr.get_entity(HERO).await.unwrap().unwrap();
        assert_eq!(cached.description.as_deref(), Some("published"));
    }

    #[tokio::test]
    async fn test_failed_publish_still_caches_and_emits() {
        let tracker = Arc::new(TrackerMock {
            reject_publish: true,
            ..Default::default()
        });
        let events = Arc::new(EventBus::new());
        let added = Arc::new(AtomicUsize::new(0));
        let counter = added.clone();
        events.on(
            "entity.added",
            EventHandler::blocking(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            false,
        );
        let mgr = EntityManager::new(Database::in_memory(), ProviderSlot::Provider(tracker), events);

        let result = mgr
            .add_entity(Entity::new(HERO, "hero", "film", "asset"), true)
            .await;
        assert!(matches!(result, Err(ResourceError::Provider(_))));
        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.list_entities(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_entities_by_type() {
        let (mgr, _) = local();
        mgr.add_entity(Entity::new(HERO, "hero", "film", "asset"), false)
            .await
            .unwrap();
        mgr.add_entity(
            Entity::new("entity://film/shot/sq01/sh010", "sh010", "film", "shot"),
            false,
        )
        .await
        .unwrap();

        assert_eq!(mgr.list_entities(None).unwrap().len(), 2);
        let shots = mgr.list_entities(Some("shot")).unwrap();
        assert_eq!(shots.len(), 1);
        assert_eq!(shots[0].name, "sh010");
    }

    #[tokio::test]
    async fn test_open_emits_and_reports_missing() {
        let (mgr, events) = local();
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = opened.clone();
        events.on(
            "entity.opened",
            EventHandler::blocking(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            false,
        );
        mgr.add_entity(
            Entity::new(HERO, "hero", "film", "asset").with_version(Version::new("v1")),
            false,
        )
        .await
        .unwrap();

        let entity = mgr.open(HERO, Some("v1")).await.unwrap();
        assert_eq!(entity.versions.len(), 1);
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        assert!(matches!(
            mgr.open(HERO, Some("v9")).await,
            Err(ResourceError::NotFound(_))
        ));
    }
}

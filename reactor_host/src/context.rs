//! Shared services handed to every plugin.

use anyhow::Result;
use std::sync::Arc;

use crate::events::EventBus;
use crate::metrics::TelemetryManager;
use crate::resources::{
    EntityManager, ProjectManager, ProjectManagerProvider, ProviderSlot, SecretManager,
    SecretProvider,
};
use crate::settings::Settings;
use crate::skill::SkillRegistry;
use crate::store::Database;

/// Service container constructed once per process and shared as
/// `Arc<HostContext>`.
pub struct HostContext {
    pub settings: Settings,
    pub database: Database,
    pub events: Arc<EventBus>,
    pub telemetry: TelemetryManager,
    pub skills: Arc<SkillRegistry>,
    pub secrets: SecretManager,
    pub projects: ProjectManager,
    pub entities: EntityManager,
}

impl HostContext {
    pub fn new(
        settings: Settings,
        database: Database,
        project_provider: ProviderSlot<dyn ProjectManagerProvider>,
        secret_provider: ProviderSlot<dyn SecretProvider>,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        Self {
            secrets: SecretManager::new(database.clone(), secret_provider),
            projects: ProjectManager::new(database.clone(), project_provider.clone()),
            entities: EntityManager::new(database.clone(), project_provider, events.clone()),
            skills: Arc::new(SkillRegistry::new()),
            telemetry: TelemetryManager::new(),
            events,
            database,
            settings,
        }
    }

    /// Local-only context over the configured store.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let database = match &settings.storage.path {
            Some(path) => Database::open(path)?,
            None => Database::in_memory(),
        };
        Ok(Self::new(
            settings,
            database,
            ProviderSlot::NoProvider,
            ProviderSlot::NoProvider,
        ))
    }

    /// Local-only context with an in-memory store and default settings.
    pub fn in_memory() -> Self {
        Self::new(
            Settings::default(),
            Database::in_memory(),
            ProviderSlot::NoProvider,
            ProviderSlot::NoProvider,
        )
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("database", &self.database)
            .field("skills", &self.skills.len())
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

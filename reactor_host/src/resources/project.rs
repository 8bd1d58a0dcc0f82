use tracing::{debug, instrument, warn};

use crate::domain::{Entity, Project};
use crate::error::ResourceError;
use crate::resources::entity::cache_entity_union;
use crate::resources::provider::{ProjectManagerProvider, ProviderSlot};
use crate::store::Database;

pub const PROJECTS_COLLECTION: &str = "projects_cache";

/// Projects cached by name.
pub struct ProjectManager {
    db: Database,
    provider: ProviderSlot<dyn ProjectManagerProvider>,
}

impl ProjectManager {
    pub fn new(db: Database, provider: ProviderSlot<dyn ProjectManagerProvider>) -> Self {
        Self { db, provider }
    }

    pub fn provider(&self) -> &ProviderSlot<dyn ProjectManagerProvider> {
        &self.provider
    }

    #[instrument(skip(self))]
    pub async fn get_project(&self, name: &str) -> Result<Option<Project>, ResourceError> {
        if let Some(project) = self.db.get_as::<Project>(PROJECTS_COLLECTION, name)? {
            return Ok(Some(project));
        }

        let Some(provider) = self.provider.get() else {
            return Ok(None);
        };

        let project = match provider.fetch_project(name).await {
            Ok(Some(project)) => project,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("Provider failed to fetch project '{}': {}", name, e);
                return Ok(None);
            }
        };
        self.cache_project(&project)?;

        match provider.prefetch_entities_for_project(name).await {
            Ok(entities) => {
                if let Err(e) = self.cache_entities(&entities) {
                    warn!("Failed to cache prefetched entities for project '{}': {}", name, e);
                }
            }
            Err(e) => warn!("Failed to prefetch entities for project '{}': {}", name, e),
        }

        Ok(Some(project))
    }

    /// With a provider the full set is fetched and re-cached on every call;
    /// otherwise the cached projects are returned sorted by name.
    #[instrument(skip(self))]
    pub async fn list_projects(&self) -> Result<Vec<Project>, ResourceError> {
        if let Some(provider) = self.provider.get() {
            match provider.fetch_projects().await {
                Ok(projects) => {
                    for project in &projects {
                        self.cache_project(project)?;
                    }
                    debug!(count = projects.len(), "Refreshed project cache");
                    return Ok(projects);
                }
                Err(e) => warn!("Provider failed to list projects, using cache: {}", e),
            }
        }

        let mut projects: Vec<Project> = self
            .db
            .get_all(PROJECTS_COLLECTION)?
            .into_iter()
            .filter_map(|(key, doc)| match serde_json::from_value(doc) {
                Ok(project) => Some(project),
                Err(e) => {
                    warn!("Skipping unreadable project '{}': {}", key, e);
                    None
                }
            })
            .collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    /// Create a project in the cache only; the provider is not written to.
    pub fn create_project(
        &self,
        name: &str,
        path: &str,
        description: Option<&str>,
    ) -> Result<Project, ResourceError> {
        if self.db.get(PROJECTS_COLLECTION, name)?.is_some() {
            return Err(ResourceError::AlreadyExists(format!("Project {}", name)));
        }
        let mut project = Project::new(name, path);
        project.description = description.map(str::to_string);
        self.cache_project(&project)?;
        Ok(project)
    }

    pub fn delete_project(&self, name: &str) -> Result<bool, ResourceError> {
        Ok(self.db.remove(PROJECTS_COLLECTION, name)?)
    }

    pub fn clear_cache(&self) -> Result<usize, ResourceError> {
        Ok(self.db.clear_collection(PROJECTS_COLLECTION)?)
    }

    fn cache_project(&self, project: &Project) -> Result<(), ResourceError> {
        self.db.set(PROJECTS_COLLECTION, &project.name, project)?;
        Ok(())
    }

    fn cache_entities(&self, entities: &[Entity]) -> Result<(), ResourceError> {
        for entity in entities {
            cache_entity_union(&self.db, entity)?;
        }
        Ok(())
    }
}

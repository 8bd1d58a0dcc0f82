//! Domain documents cached by the resource managers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Scope of a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecretScope {
    User,
    Project,
}

impl SecretScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretScope::User => "USER",
            SecretScope::Project => "PROJECT",
        }
    }
}

impl fmt::Display for SecretScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub key: String,
    pub value: String,
    pub scope: SecretScope,
    #[serde(default)]
    pub project: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub workflows: Vec<BTreeMap<String, Value>>,
}

impl Project {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            description: None,
            created_at: Utc::now(),
            workflows: Vec::new(),
        }
    }
}

/// Common entity types. Any string is accepted as an entity type.
pub mod entity_type {
    pub const ASSET: &str = "asset";
    pub const SHOT: &str = "shot";
    pub const SEQUENCE: &str = "sequence";
    pub const LEVEL: &str = "level";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionControlInfo {
    /// git, svn, perforce, ...
    pub method: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareInfo {
    pub name: String,
    pub version: String,
}

/// Link between a local version and its record in an external tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectManagerLink {
    pub provider: String,
    pub provider_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: String,
    #[serde(default)]
    pub version_control: Option<VersionControlInfo>,
    #[serde(default)]
    pub software: Option<SoftwareInfo>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    /// Dependency entity URI -> version id.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub project_manager_links: Vec<ProjectManagerLink>,
}

impl Version {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version_control: None,
            software: None,
            env_vars: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            project_manager_links: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, uri: impl Into<String>, version: impl Into<String>) -> Self {
        self.dependencies.insert(uri.into(), version.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub uri: String,
    pub name: String,
    pub project_name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub versions: Vec<Version>,
}

impl Entity {
    pub fn new(
        uri: impl Into<String>,
        name: impl Into<String>,
        project_name: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            project_name: project_name.into(),
            entity_type: entity_type.into(),
            description: None,
            versions: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.versions.push(version);
        self
    }

    pub fn version(&self, id: &str) -> Option<&Version> {
        self.versions.iter().find(|v| v.id == id)
    }

    /// Copy of this entity restricted to a single version.
    pub fn only_version(&self, id: &str) -> Entity {
        Entity {
            versions: self.versions.iter().filter(|v| v.id == id).cloned().collect(),
            ..self.clone()
        }
    }
}

/// Partial update applied by `EntityManager::update_entity`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type")]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub versions: Option<Vec<Version>>,
}

impl EntityUpdate {
    pub fn apply(self, entity: &mut Entity) {
        if let Some(name) = self.name {
            entity.name = name;
        }
        if let Some(description) = self.description {
            entity.description = Some(description);
        }
        if let Some(entity_type) = self.entity_type {
            entity.entity_type = entity_type;
        }
        if let Some(versions) = self.versions {
            entity.versions = versions;
        }
    }
}

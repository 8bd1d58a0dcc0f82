//! `entity://{project}/{type}/{path}[?version={id}]` URIs.

use std::fmt;

use crate::error::ResourceError;

const SCHEME: &str = "entity://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityUri {
    pub project: String,
    pub entity_type: String,
    pub path: String,
    pub version: Option<String>,
}

impl EntityUri {
    pub fn parse(uri: &str) -> Result<Self, ResourceError> {
        let invalid = |reason: &str| ResourceError::InvalidUri(format!("{}: {}", reason, uri));

        let rest = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| invalid("expected 'entity' scheme"))?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let location = location.split('#').next().unwrap_or(location);

        let (project, full_path) = location.split_once('/').unwrap_or((location, ""));
        if project.is_empty() {
            return Err(invalid("missing project"));
        }

        let full_path = full_path.trim_start_matches('/');
        if full_path.is_empty() {
            return Err(invalid("missing entity type and path"));
        }
        let (entity_type, path) = full_path
            .split_once('/')
            .filter(|(_, path)| !path.is_empty())
            .ok_or_else(|| invalid("missing entity path"))?;

        let version = query.and_then(|q| {
            q.split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(k, _)| *k == "version")
                .map(|(_, v)| v.to_string())
                .filter(|v| !v.is_empty())
        });

        Ok(Self {
            project: project.to_string(),
            entity_type: entity_type.to_string(),
            path: path.to_string(),
            version,
        })
    }

    pub fn build(project: &str, entity_type: &str, path: &str, version: Option<&str>) -> String {
        let mut uri = format!("{}{}/{}/{}", SCHEME, project, entity_type, path);
        if let Some(v) = version {
            uri.push_str("?version=");
            uri.push_str(v);
        }
        uri
    }

    /// URI without the version qualifier.
    pub fn base(&self) -> String {
        Self::build(&self.project, &self.entity_type, &self.path, None)
    }

    /// Last path segment, used as a display name when nothing better is known.
    pub fn leaf_name(&self) -> String {
        let trimmed = self.path.trim_matches('/');
        match trimmed.rsplit('/').next() {
            Some(leaf) if !leaf.is_empty() => leaf.to_string(),
            _ => format!("{}_unknown", self.entity_type),
        }
    }
}

impl fmt::Display for EntityUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&Self::build(
            &self.project,
            &self.entity_type,
            &self.path,
            self.version.as_deref(),
        ))
    }
}

/// Cache key for an entity URI: the base URI shared by all of its versions.
pub fn cache_key(uri: &str) -> Result<String, ResourceError> {
    Ok(EntityUri::parse(uri)?.base())
}

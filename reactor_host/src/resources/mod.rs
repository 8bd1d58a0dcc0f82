//! Cache-backed resource managers.
//!
//! Each manager keeps its documents in one collection of the shared
//! [`Database`](crate::store::Database). With a provider configured the cache
//! is read-through/write-through; without one it is the source of truth.

pub mod entity;
pub mod project;
pub mod provider;
pub mod secret;
pub mod uri;

pub use entity::{EntityManager, ENTITIES_COLLECTION};
pub use project::{ProjectManager, PROJECTS_COLLECTION};
pub use provider::{ProjectManagerProvider, ProviderSlot, SecretProvider};
pub use secret::{SecretManager, SECRETS_COLLECTION};
pub use uri::EntityUri;

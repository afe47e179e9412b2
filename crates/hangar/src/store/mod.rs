//! Persistence seams.
//!
//! The pipeline only needs a handful of operations from the system of record,
//! so they are expressed as traits. [`MemoryStore`] backs tests and the CLI.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::{PipelineError, Result};
use crate::types::{Deployment, DeploymentConfig, DeploymentId, RepositoryId, SourceRepository};

/// Storage for deployment records.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Persist a new `PENDING` deployment and return it with its id.
    async fn create(
        &self,
        repository_id: RepositoryId,
        branch_name: &str,
        commit_hash: &str,
    ) -> Result<Deployment>;

    async fn get(&self, id: DeploymentId) -> Result<Option<Deployment>>;

    /// Overwrite an existing record.
    async fn save(&self, deployment: &Deployment) -> Result<()>;
}

/// Storage for source repositories.
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    async fn insert(&self, repository: &SourceRepository) -> Result<()>;

    async fn get(&self, id: RepositoryId) -> Result<Option<SourceRepository>>;

    /// Compare-and-set of the cached build project id.
    ///
    /// Stores `project_id` only when the repository has none yet and returns
    /// the id that is stored afterwards, which is the existing one if another
    /// caller won.
    async fn assign_build_project(&self, id: RepositoryId, project_id: &str) -> Result<String>;
}

/// Storage for per-repository runtime configuration.
#[async_trait]
pub trait DeploymentConfigStore: Send + Sync {
    async fn get_config(&self, repository_id: RepositoryId) -> Result<Option<DeploymentConfig>>;

    async fn put_config(&self, config: &DeploymentConfig) -> Result<()>;
}

/// Load a deployment or fail with `NotFound`.
pub async fn require_deployment(
    store: &dyn DeploymentStore,
    id: DeploymentId,
) -> Result<Deployment> {
    store
        .get(id)
        .await?
        .ok_or_else(|| PipelineError::not_found("Deployment", id))
}

/// Load a repository or fail with `NotFound`.
pub async fn require_repository(
    store: &dyn RepositoryStore,
    id: RepositoryId,
) -> Result<SourceRepository> {
    store
        .get(id)
        .await?
        .ok_or_else(|| PipelineError::not_found("Repository", id))
}

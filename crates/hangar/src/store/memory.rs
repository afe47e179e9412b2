//! In-memory store for tests and one-shot CLI runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{PipelineError, Result};
use crate::types::{Deployment, DeploymentConfig, DeploymentId, RepositoryId, SourceRepository};

use super::{DeploymentConfigStore, DeploymentStore, RepositoryStore};

fn poisoned() -> PipelineError {
    PipelineError::Store("lock poisoned".to_string())
}

/// Process-local store. Data is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    next_id: AtomicU64,
    deployments: RwLock<HashMap<DeploymentId, Deployment>>,
    repositories: RwLock<HashMap<RepositoryId, SourceRepository>>,
    configs: RwLock<HashMap<RepositoryId, DeploymentConfig>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose first deployment gets `first_id`.
    ///
    /// Ids feed build Job names and storage keys, so processes sharing a
    /// cluster or bucket must not start from the same value.
    #[must_use]
    pub fn starting_at(first_id: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first_id.saturating_sub(1)),
            ..Self::default()
        }
    }

    /// Store seeded from the wall clock in milliseconds, for one-shot runs.
    #[must_use]
    pub fn seeded_from_clock() -> Self {
        let millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(1);
        Self::starting_at(millis)
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn create(
        &self,
        repository_id: RepositoryId,
        branch_name: &str,
        commit_hash: &str,
    ) -> Result<Deployment> {
        let id = DeploymentId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let deployment = Deployment::new(id, repository_id, branch_name, commit_hash);
        self.deployments
            .write()
            .map_err(|_| poisoned())?
            .insert(id, deployment.clone());
        Ok(deployment)
    }

    async fn get(&self, id: DeploymentId) -> Result<Option<Deployment>> {
        let deployments = self.deployments.read().map_err(|_| poisoned())?;
        Ok(deployments.get(&id).cloned())
    }

    async fn save(&self, deployment: &Deployment) -> Result<()> {
        let mut deployments = self.deployments.write().map_err(|_| poisoned())?;
        let slot = deployments
            .get_mut(&deployment.id)
            .ok_or_else(|| PipelineError::not_found("Deployment", deployment.id))?;
        *slot = deployment.clone();
        Ok(())
    }
}

#[async_trait]
impl RepositoryStore for MemoryStore {
    async fn insert(&self, repository: &SourceRepository) -> Result<()> {
        let mut repositories = self.repositories.write().map_err(|_| poisoned())?;
        if repositories.contains_key(&repository.id) {
            return Err(PipelineError::Store(format!(
                "repository {} already exists",
                repository.id
            )));
        }
        repositories.insert(repository.id, repository.clone());
        Ok(())
    }

    async fn get(&self, id: RepositoryId) -> Result<Option<SourceRepository>> {
        let repositories = self.repositories.read().map_err(|_| poisoned())?;
        Ok(repositories.get(&id).cloned())
    }

    async fn assign_build_project(&self, id: RepositoryId, project_id: &str) -> Result<String> {
        let mut repositories = self.repositories.write().map_err(|_| poisoned())?;
        let repository = repositories
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("Repository", id))?;
        let stored = repository
            .external_build_project_id
            .get_or_insert_with(|| project_id.to_string());
        Ok(stored.clone())
    }
}

#[async_trait]
impl DeploymentConfigStore for MemoryStore {
    async fn get_config(&self, repository_id: RepositoryId) -> Result<Option<DeploymentConfig>> {
        let configs = self.configs.read().map_err(|_| poisoned())?;
        Ok(configs.get(&repository_id).cloned())
    }

    async fn put_config(&self, config: &DeploymentConfig) -> Result<()> {
        self.configs
            .write()
            .map_err(|_| poisoned())?
            .insert(config.repository_id, config.clone());
        Ok(())
    }
}

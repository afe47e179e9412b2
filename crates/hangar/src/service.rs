//! Operations the rest of the platform calls into.
//!
//! `create_deployment` persists a `PENDING` record and hands the run to the
//! background workers; everything after that is observed through `get_status`.

use std::sync::Arc;

use tracing::info;

use crate::error::{PipelineError, Result};
use crate::kubernetes::WorkloadReconciler;
use crate::pipeline::{PipelineDeps, PipelineWorkers};
use crate::providers::ProviderFactory;
use crate::store::{
    require_deployment, require_repository, DeploymentConfigStore, DeploymentStore,
    RepositoryStore,
};
use crate::types::{Deployment, DeploymentId, DeploymentStatusView, RepositoryId, SourceRepository};

pub struct DeploymentService {
    deployments: Arc<dyn DeploymentStore>,
    repositories: Arc<dyn RepositoryStore>,
    configs: Arc<dyn DeploymentConfigStore>,
    providers: ProviderFactory,
    reconciler: Arc<dyn WorkloadReconciler>,
    workers: Arc<PipelineWorkers>,
}

impl DeploymentService {
    /// Facade sharing the collaborators the workers' pipeline runs on.
    #[must_use]
    pub fn new(workers: Arc<PipelineWorkers>) -> Self {
        let PipelineDeps {
            deployments,
            repositories,
            configs,
            providers,
            reconciler,
            ..
        } = workers.orchestrator().deps().clone();
        Self {
            deployments,
            repositories,
            configs,
            providers,
            reconciler,
            workers,
        }
    }

    #[must_use]
    pub fn workers(&self) -> &Arc<PipelineWorkers> {
        &self.workers
    }

    /// Persist a `PENDING` deployment and start its pipeline in the background.
    pub async fn create_deployment(
        &self,
        repository_id: RepositoryId,
        branch_name: &str,
        commit_hash: &str,
    ) -> Result<Deployment> {
        if branch_name.trim().is_empty() {
            return Err(PipelineError::InvalidState("branch name is empty".to_string()));
        }
        if commit_hash.trim().is_empty() {
            return Err(PipelineError::InvalidState("commit hash is empty".to_string()));
        }

        let repository = require_repository(self.repositories.as_ref(), repository_id).await?;
        // Unsupported vendors are rejected before anything is persisted or fetched.
        self.providers.get(repository.cloud_vendor)?;

        let deployment = self
            .deployments
            .create(repository_id, branch_name, commit_hash)
            .await?;
        self.workers.spawn(deployment.id)?;

        info!(
            deployment_id = %deployment.id,
            repository = %repository.full_name(),
            commit = %deployment.short_commit(),
            "Deployment created"
        );
        Ok(deployment)
    }

    pub async fn get_status(&self, id: DeploymentId) -> Result<DeploymentStatusView> {
        let deployment = require_deployment(self.deployments.as_ref(), id).await?;
        Ok(DeploymentStatusView::from(&deployment))
    }

    /// Set the replica count of the app a deployment belongs to.
    pub async fn scale(&self, id: DeploymentId, replicas: i32) -> Result<()> {
        if replicas < 0 {
            return Err(PipelineError::InvalidState(format!(
                "replica count must not be negative, got {replicas}"
            )));
        }
        let repository = self.repository_of(id).await?;
        self.scale_repository(&repository, replicas).await
    }

    /// Scale to zero and back up. Returns the replica count restored.
    pub async fn restart(&self, id: DeploymentId) -> Result<i32> {
        let repository = self.repository_of(id).await?;
        let target = self
            .configs
            .get_config(repository.id)
            .await?
            .map(|config| config.min_replicas)
            .filter(|replicas| *replicas > 0)
            .unwrap_or(1);

        self.scale_repository(&repository, 0).await?;
        self.scale_repository(&repository, target).await?;
        info!(deployment_id = %id, replicas = target, "Workload restarted");
        Ok(target)
    }

    async fn repository_of(&self, id: DeploymentId) -> Result<SourceRepository> {
        let deployment = require_deployment(self.deployments.as_ref(), id).await?;
        require_repository(self.repositories.as_ref(), deployment.repository_id).await
    }

    async fn scale_repository(&self, repository: &SourceRepository, replicas: i32) -> Result<()> {
        let app_name = repository.app_name();
        self.reconciler.scale(&app_name, replicas).await?;
        self.providers
            .get(repository.cloud_vendor)?
            .scale_service(&app_name, replicas)
            .await
    }
}

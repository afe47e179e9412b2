//! Five-stage build-and-deploy driver.
//!
//! `PENDING → UPLOADING_SOURCE → BUILDING → DEPLOYING → SUCCESS`. Each stage
//! reloads the deployment, applies its transition and persists it before the
//! next stage starts, so progress survives a later failure. Any stage error
//! ends the run by recording `FAILED` with the error text.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, Instrument};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::github::InstallationTokenCache;
use crate::kubernetes::WorkloadReconciler;
use crate::providers::{CloudInfraProvider, ProviderFactory};
use crate::store::{
    require_deployment, require_repository, DeploymentConfigStore, DeploymentStore,
    RepositoryStore,
};
use crate::types::{
    BuildResult, BuildStatusResult, DeploymentId, DeploymentStatus, RepositoryId, SourceRepository,
};

/// Build-status poll schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub build_timeout: Duration,
}

impl From<&PipelineConfig> for PollSchedule {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            initial_interval: config.poll_initial_interval(),
            max_interval: config.poll_max_interval(),
            build_timeout: config.build_timeout(),
        }
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

/// Collaborators the pipeline drives.
#[derive(Clone)]
pub struct PipelineDeps {
    pub deployments: Arc<dyn DeploymentStore>,
    pub repositories: Arc<dyn RepositoryStore>,
    pub configs: Arc<dyn DeploymentConfigStore>,
    pub tokens: Arc<InstallationTokenCache>,
    pub providers: ProviderFactory,
    pub reconciler: Arc<dyn WorkloadReconciler>,
}

pub struct PipelineOrchestrator {
    deps: PipelineDeps,
    schedule: PollSchedule,
    project_locks: Arc<Mutex<HashMap<RepositoryId, Arc<Mutex<()>>>>>,
}

impl PipelineOrchestrator {
    #[must_use]
    pub fn new(deps: PipelineDeps, schedule: PollSchedule) -> Self {
        Self {
            deps,
            schedule,
            project_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn deps(&self) -> &PipelineDeps {
        &self.deps
    }

    /// Drive one deployment to `SUCCESS` or `FAILED`.
    ///
    /// Errors only when the run cannot start: the deployment is unknown or no
    /// longer `PENDING`. Stage failures are recorded on the deployment instead.
    pub async fn run(&self, id: DeploymentId) -> Result<()> {
        let span = info_span!("pipeline", deployment_id = %id);
        async move {
            let deployment = require_deployment(self.deps.deployments.as_ref(), id).await?;
            if deployment.status != DeploymentStatus::Pending {
                return Err(PipelineError::InvalidState(format!(
                    "deployment {id} is {} and cannot start a pipeline",
                    deployment.status
                )));
            }

            info!(
                commit = %deployment.short_commit(),
                branch = %deployment.branch_name,
                "Pipeline started"
            );
            match self.execute(id).await {
                Ok(()) => info!("Pipeline completed"),
                Err(e) => {
                    error!(error = %e, kind = e.kind(), "Pipeline failed");
                    self.record_failure(id, &e.to_string()).await;
                }
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, id: DeploymentId) -> Result<()> {
        let (provider, repository, storage_key) = self.stage_upload(id).await?;
        let (repository, build) = self
            .stage_trigger(id, provider.as_ref(), repository, &storage_key)
            .await?;
        let status = self.wait_for_build(provider.as_ref(), &build).await?;
        let image_uri = status.image_uri.unwrap_or(build.image_uri);
        self.stage_deploy(id, &repository, &image_uri).await?;
        self.stage_complete(id).await
    }

    async fn stage_upload(
        &self,
        id: DeploymentId,
    ) -> Result<(Arc<dyn CloudInfraProvider>, SourceRepository, String)> {
        let mut deployment = require_deployment(self.deps.deployments.as_ref(), id).await?;
        deployment.start_upload()?;
        self.deps.deployments.save(&deployment).await?;

        let repository =
            require_repository(self.deps.repositories.as_ref(), deployment.repository_id).await?;
        let provider = self.deps.providers.get(repository.cloud_vendor)?;
        let credential = self
            .deps
            .tokens
            .get_installation_token(&repository.owner, &repository.repo_name)
            .await?;

        let storage_key = provider
            .upload_source_to_storage(&credential, &deployment, &repository)
            .await?;
        deployment.mark_uploaded(storage_key.clone())?;
        self.deps.deployments.save(&deployment).await?;

        info!(storage_key = %storage_key, backend = provider.name(), "Source uploaded");
        Ok((provider, repository, storage_key))
    }

    async fn stage_trigger(
        &self,
        id: DeploymentId,
        provider: &dyn CloudInfraProvider,
        repository: SourceRepository,
        storage_key: &str,
    ) -> Result<(SourceRepository, BuildResult)> {
        let repository = self.ensure_build_project(provider, repository).await?;

        let mut deployment = require_deployment(self.deps.deployments.as_ref(), id).await?;
        let build = provider
            .trigger_build(storage_key, &deployment, &repository)
            .await?;
        deployment.mark_build_triggered(build.external_build_id.clone())?;
        self.deps.deployments.save(&deployment).await?;

        info!(
            build_id = %build.external_build_id,
            image = %build.image_uri,
            "Build triggered"
        );
        Ok((repository, build))
    }

    /// Get-or-create of the repository's build project, serialized per
    /// repository so concurrent first builds provision exactly one.
    async fn ensure_build_project(
        &self,
        provider: &dyn CloudInfraProvider,
        repository: SourceRepository,
    ) -> Result<SourceRepository> {
        if !provider.has_build_projects() || repository.external_build_project_id.is_some() {
            return Ok(repository);
        }

        let lock = {
            let mut locks = self.project_locks.lock().await;
            locks.entry(repository.id).or_default().clone()
        };
        let result = {
            let _guard = lock.lock().await;
            self.provision_build_project(provider, repository.id).await
        };
        self.release_project_lock(repository.id, lock).await;
        result
    }

    async fn provision_build_project(
        &self,
        provider: &dyn CloudInfraProvider,
        repository_id: RepositoryId,
    ) -> Result<SourceRepository> {
        let current = require_repository(self.deps.repositories.as_ref(), repository_id).await?;
        if current.external_build_project_id.is_some() {
            return Ok(current);
        }
        let Some(created) = provider.create_build_project(&current).await? else {
            return Ok(current);
        };

        let stored = self
            .deps
            .repositories
            .assign_build_project(current.id, &created)
            .await?;
        info!(repository_id = %current.id, project_id = %stored, "Build project cached");
        Ok(SourceRepository {
            external_build_project_id: Some(stored),
            ..current
        })
    }

    /// Drop the repository's lock entry once no other run holds or awaits it.
    async fn release_project_lock(&self, repository_id: RepositoryId, lock: Arc<Mutex<()>>) {
        let mut locks = self.project_locks.lock().await;
        let idle = locks
            .get(&repository_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(&repository_id);
        }
    }

    /// Poll until the build is terminal or the timeout is reached.
    ///
    /// The first check happens right after the trigger. Between checks the
    /// interval doubles up to the cap; once the accumulated sleep reaches the
    /// timeout the last check decides.
    async fn wait_for_build(
        &self,
        provider: &dyn CloudInfraProvider,
        build: &BuildResult,
    ) -> Result<BuildStatusResult> {
        let PollSchedule {
            initial_interval,
            max_interval,
            build_timeout,
        } = self.schedule;
        let mut interval = initial_interval;
        let mut elapsed = Duration::ZERO;
        let mut polls = 0u32;

        loop {
            let status = provider
                .get_build_status(&build.tracking_handle, &build.external_build_id)
                .await?;
            polls += 1;
            debug!(
                polls,
                elapsed_ms = duration_ms(elapsed),
                message = %status.message,
                "Build status polled"
            );

            if status.completed {
                if status.succeeded {
                    info!(polls, elapsed_ms = duration_ms(elapsed), "Build succeeded");
                    return Ok(status);
                }
                return Err(PipelineError::BuildFailed(status.message));
            }
            if elapsed >= build_timeout {
                return Err(PipelineError::BuildTimeout {
                    elapsed_ms: duration_ms(elapsed),
                    timeout_ms: duration_ms(build_timeout),
                });
            }

            tokio::time::sleep(interval).await;
            elapsed += interval;
            interval = (interval * 2).min(max_interval);
        }
    }

    async fn stage_deploy(
        &self,
        id: DeploymentId,
        repository: &SourceRepository,
        image_uri: &str,
    ) -> Result<()> {
        let mut deployment = require_deployment(self.deps.deployments.as_ref(), id).await?;
        deployment.start_deploying()?;
        self.deps.deployments.save(&deployment).await?;

        let config = self
            .deps
            .configs
            .get_config(repository.id)
            .await?
            .ok_or_else(|| PipelineError::ConfigNotFound(repository.id.to_string()))?;

        let app_name = repository.app_name();
        self.deps
            .reconciler
            .deploy(&app_name, image_uri, &config, repository.id)
            .await?;
        info!(app = %app_name, image = %image_uri, "Workload deployed");
        Ok(())
    }

    async fn stage_complete(&self, id: DeploymentId) -> Result<()> {
        let mut deployment = require_deployment(self.deps.deployments.as_ref(), id).await?;
        deployment.complete_success()?;
        self.deps.deployments.save(&deployment).await
    }

    /// Mark the deployment `FAILED`. Bookkeeping errors are logged only.
    async fn record_failure(&self, id: DeploymentId, reason: &str) {
        let result = async {
            let mut deployment = require_deployment(self.deps.deployments.as_ref(), id).await?;
            deployment.fail(reason)?;
            self.deps.deployments.save(&deployment).await
        }
        .await;

        if let Err(e) = result {
            error!(error = %e, "Failed to record pipeline failure");
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::github::token_cache::MockInstallationTokenIssuer;
    use crate::store::MemoryStore;
    use crate::types::{BuildStatusResult, CloudVendor, Deployment, DeploymentConfig};

    #[derive(Default)]
    struct ProjectBackend {
        projects: bool,
        created: AtomicUsize,
    }

    #[async_trait]
    impl CloudInfraProvider for ProjectBackend {
        fn name(&self) -> &'static str {
            "project-backend"
        }

        fn has_build_projects(&self) -> bool {
            self.projects
        }

        async fn upload_source_to_storage(
            &self,
            _credential: &str,
            _deployment: &Deployment,
            _repository: &SourceRepository,
        ) -> Result<String> {
            unreachable!("not staged here")
        }

        async fn create_build_project(
            &self,
            repository: &SourceRepository,
        ) -> Result<Option<String>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Some(format!("project-{}", repository.id)))
        }

        async fn trigger_build(
            &self,
            _storage_key: &str,
            _deployment: &Deployment,
            _repository: &SourceRepository,
        ) -> Result<BuildResult> {
            unreachable!("not triggered here")
        }

        async fn get_build_status(
            &self,
            _tracking_handle: &str,
            _build_id: &str,
        ) -> Result<BuildStatusResult> {
            Ok(BuildStatusResult::running())
        }

        async fn scale_service(&self, _resource_name: &str, _replicas: i32) -> Result<()> {
            Ok(())
        }
    }

    struct NoopReconciler;

    #[async_trait]
    impl WorkloadReconciler for NoopReconciler {
        async fn deploy(
            &self,
            _app_name: &str,
            _image_uri: &str,
            _config: &DeploymentConfig,
            _repository_id: RepositoryId,
        ) -> Result<()> {
            Ok(())
        }

        async fn scale(&self, _app_name: &str, _replicas: i32) -> Result<()> {
            Ok(())
        }
    }

    async fn orchestrator(repositories: u64) -> PipelineOrchestrator {
        let store = Arc::new(MemoryStore::new());
        for id in 1..=repositories {
            let name = format!("repo-{id}");
            let repository =
                SourceRepository::new(RepositoryId(id), "owner", name, CloudVendor::Ncp);
            store.insert(&repository).await.unwrap();
        }
        let deps = PipelineDeps {
            deployments: store.clone(),
            repositories: store.clone(),
            configs: store,
            tokens: Arc::new(InstallationTokenCache::new(Arc::new(
                MockInstallationTokenIssuer::new(),
            ))),
            providers: ProviderFactory::new(),
            reconciler: Arc::new(NoopReconciler),
        };
        PipelineOrchestrator::new(deps, PollSchedule::default())
    }

    async fn repository(orchestrator: &PipelineOrchestrator, id: u64) -> SourceRepository {
        require_repository(orchestrator.deps.repositories.as_ref(), RepositoryId(id))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn backend_without_projects_skips_the_lock() {
        let orchestrator = orchestrator(1).await;
        let backend = ProjectBackend::default();

        let result = orchestrator
            .ensure_build_project(&backend, repository(&orchestrator, 1).await)
            .await
            .unwrap();

        assert_eq!(result.external_build_project_id, None);
        assert_eq!(backend.created.load(Ordering::SeqCst), 0);
        assert!(orchestrator.project_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn project_locks_are_released_after_provisioning() {
        let orchestrator = orchestrator(3).await;
        let backend = ProjectBackend {
            projects: true,
            ..ProjectBackend::default()
        };

        for id in 1..=3 {
            let result = orchestrator
                .ensure_build_project(&backend, repository(&orchestrator, id).await)
                .await
                .unwrap();
            assert_eq!(
                result.external_build_project_id,
                Some(format!("project-{id}"))
            );
        }

        assert_eq!(backend.created.load(Ordering::SeqCst), 3);
        assert!(orchestrator.project_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn lock_still_awaited_by_another_run_is_kept() {
        let orchestrator = orchestrator(1).await;
        let held = {
            let mut locks = orchestrator.project_locks.lock().await;
            locks.entry(RepositoryId(1)).or_default().clone()
        };
        let waiting = held.clone();

        orchestrator
            .release_project_lock(RepositoryId(1), held)
            .await;
        assert!(orchestrator
            .project_locks
            .lock()
            .await
            .contains_key(&RepositoryId(1)));

        orchestrator
            .release_project_lock(RepositoryId(1), waiting)
            .await;
        assert!(orchestrator.project_locks.lock().await.is_empty());
    }
}

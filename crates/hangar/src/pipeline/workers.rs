use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::PipelineOrchestrator;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::types::DeploymentId;

/// Runs pipelines in the background, off the caller's task.
///
/// At most one run per deployment is in flight, and at most
/// `max_concurrent_runs` execute at once; the rest wait for a permit.
pub struct PipelineWorkers {
    orchestrator: Arc<PipelineOrchestrator>,
    handle: Handle,
    runtime: Option<Runtime>,
    permits: Arc<Semaphore>,
    in_flight: Arc<DashMap<DeploymentId, ()>>,
}

impl PipelineWorkers {
    /// Workers on a dedicated multi-threaded runtime.
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, config: &PipelineConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("hangar-pipeline")
            .enable_all()
            .build()
            .map_err(|e| {
                PipelineError::Configuration(format!("failed to start pipeline runtime: {e}"))
            })?;
        let mut workers =
            Self::on_handle(orchestrator, runtime.handle().clone(), config.max_concurrent_runs);
        workers.runtime = Some(runtime);
        Ok(workers)
    }

    /// Workers on an existing runtime.
    #[must_use]
    pub fn on_handle(
        orchestrator: Arc<PipelineOrchestrator>,
        handle: Handle,
        max_concurrent_runs: usize,
    ) -> Self {
        Self {
            orchestrator,
            handle,
            runtime: None,
            permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }

    #[must_use]
    pub fn is_running(&self, id: DeploymentId) -> bool {
        self.in_flight.contains_key(&id)
    }

    /// Start the pipeline for `id` and return immediately.
    ///
    /// The returned handle resolves once the run has finished; callers are
    /// free to drop it.
    pub fn spawn(&self, id: DeploymentId) -> Result<JoinHandle<()>> {
        match self.in_flight.entry(id) {
            Entry::Occupied(_) => return Err(PipelineError::AlreadyRunning(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let guard = InFlightGuard {
            id,
            in_flight: Arc::clone(&self.in_flight),
        };
        let orchestrator = Arc::clone(&self.orchestrator);
        let permits = Arc::clone(&self.permits);

        Ok(self.handle.spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(deployment_id = %id, "Pipeline workers shut down before the run started");
                return;
            };
            debug!(deployment_id = %id, "Pipeline run scheduled");
            if let Err(e) = orchestrator.run(id).await {
                error!(deployment_id = %id, error = %e, "Pipeline could not start");
            }
        }))
    }
}

impl Drop for PipelineWorkers {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Clears the in-flight marker when the run ends, including on panic.
struct InFlightGuard {
    id: DeploymentId,
    in_flight: Arc<DashMap<DeploymentId, ()>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.id);
    }
}

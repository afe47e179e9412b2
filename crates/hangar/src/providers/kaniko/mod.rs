//! In-cluster kaniko builds.
//!
//! Builds run as Jobs in the configured namespace. The tracking handle is the
//! namespace and the build id is the Job name.

mod job;
mod status;

pub use job::{
    BuildJobBuilder, BUILD_CONTAINER, COMMIT_SHA_LABEL, DEPLOYMENT_ID_LABEL, FETCH_CONTAINER,
    MANAGED_BY, MANAGED_BY_LABEL,
};
pub use status::{
    detect_failed_mount, detect_pod_failure, job_outcome, JobOutcome, FATAL_WAITING_REASONS,
};

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use super::CloudInfraProvider;
use crate::config::HangarConfig;
use crate::error::{PipelineError, Result};
use crate::source::SourceStager;
use crate::types::{BuildResult, BuildStatusResult, Deployment, SourceRepository};

/// Kaniko build backend.
#[derive(Clone)]
pub struct KanikoProvider {
    client: Client,
    registry_endpoint: String,
    builder: BuildJobBuilder,
    stager: SourceStager,
}

impl KanikoProvider {
    #[must_use]
    pub fn new(client: Client, config: &HangarConfig, stager: SourceStager) -> Self {
        let mut builder = BuildJobBuilder::from_config(config);
        // The fetch step must read from the store sources are actually staged in.
        builder.bucket = stager.store().bucket().to_string();
        builder.storage_endpoint = stager.store().endpoint().to_string();
        Self {
            client,
            registry_endpoint: config.build.registry_endpoint.clone(),
            builder,
            stager,
        }
    }

    /// First permanent failure among the Job's pods, if any.
    async fn detect_early_failure(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<Option<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);

        let pod_list = pods
            .list(&ListParams::default().labels(&format!("job-name={job_name}")))
            .await
            .map_err(|e| PipelineError::BuildFailed(format!("failed to list build pods: {e}")))?;

        for pod in &pod_list.items {
            if let Some(reason) = detect_pod_failure(namespace, pod) {
                return Ok(Some(reason));
            }
            let Some(pod_name) = pod.metadata.name.as_deref() else {
                continue;
            };
            let pod_events = events
                .list(&ListParams::default().fields(&format!("involvedObject.name={pod_name}")))
                .await
                .map_err(|e| {
                    PipelineError::BuildFailed(format!("failed to list events for {pod_name}: {e}"))
                })?;
            if let Some(reason) = detect_failed_mount(namespace, pod_name, &pod_events.items) {
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl CloudInfraProvider for KanikoProvider {
    fn name(&self) -> &'static str {
        "kaniko"
    }

    async fn upload_source_to_storage(
        &self,
        credential: &str,
        deployment: &Deployment,
        repository: &SourceRepository,
    ) -> Result<String> {
        self.stager.stage(credential, deployment, repository).await
    }

    async fn trigger_build(
        &self,
        storage_key: &str,
        deployment: &Deployment,
        repository: &SourceRepository,
    ) -> Result<BuildResult> {
        let image_uri = repository.image_uri(&self.registry_endpoint);
        let job_name = self.builder.job_name(deployment.id);
        let job = self.builder.build(deployment, storage_key, &image_uri)?;

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.builder.namespace);
        jobs.create(&PostParams::default(), &job)
            .await
            .map_err(|e| {
                PipelineError::BuildTrigger(format!("failed to create build job {job_name}: {e}"))
            })?;

        info!(
            deployment_id = %deployment.id,
            job = %job_name,
            image = %image_uri,
            "Created build job"
        );
        Ok(BuildResult {
            external_build_id: job_name,
            tracking_handle: self.builder.namespace.clone(),
            image_uri,
        })
    }

    async fn get_build_status(
        &self,
        tracking_handle: &str,
        build_id: &str,
    ) -> Result<BuildStatusResult> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), tracking_handle);
        let job = jobs
            .get_opt(build_id)
            .await
            .map_err(|e| {
                PipelineError::BuildFailed(format!("failed to read build job {build_id}: {e}"))
            })?
            .ok_or_else(|| PipelineError::BuildFailed(format!("build job {build_id} not found")))?;

        match job_outcome(&job) {
            JobOutcome::Succeeded => Ok(BuildStatusResult::succeeded(None)),
            JobOutcome::Failed(detail) => Ok(BuildStatusResult::failed(detail)),
            JobOutcome::Active => {
                if let Some(reason) = self.detect_early_failure(tracking_handle, build_id).await? {
                    warn!(job = %build_id, reason = %reason, "Build pod can never complete");
                    return Ok(BuildStatusResult::failed(reason));
                }
                debug!(job = %build_id, "Build job still running");
                Ok(BuildStatusResult::running())
            }
        }
    }

    async fn scale_service(&self, resource_name: &str, replicas: i32) -> Result<()> {
        info!(resource = %resource_name, replicas, "Scaling is handled by the workload reconciler");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::{json, Value};
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::storage::MemoryObjectStore;
    use crate::types::{CloudVendor, DeploymentId, RepositoryId};

    const JOBS_PATH: &str = "/apis/batch/v1/namespaces/builds/jobs";

    fn provider(server: &MockServer) -> KanikoProvider {
        let client = Client::try_from(kube::Config::new(server.uri().parse().unwrap())).unwrap();
        let mut config = HangarConfig::default();
        config.kubernetes.namespace = "builds".to_string();
        config.build.registry_endpoint = "registry.example.com".to_string();
        let stager =
            SourceStager::new(server.uri(), Arc::new(MemoryObjectStore::new("sources"))).unwrap();
        KanikoProvider::new(client, &config, stager)
    }

    fn job(status: Value) -> Value {
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": "hangar-build-5", "namespace": "builds" },
            "status": status
        })
    }

    fn list(kind: &str, items: Value) -> Value {
        json!({ "apiVersion": "v1", "kind": kind, "metadata": {}, "items": items })
    }

    async fn serve_job(server: &MockServer, status: Value) {
        Mock::given(method("GET"))
            .and(path(format!("{JOBS_PATH}/hangar-build-5")))
            .respond_with(ResponseTemplate::new(200).set_body_json(job(status)))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn trigger_creates_one_job_per_deployment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(JOBS_PATH))
            .and(body_partial_json(json!({
                "metadata": { "name": "hangar-build-5", "namespace": "builds" }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(job(json!({}))))
            .expect(1)
            .mount(&server)
            .await;

        let repository = SourceRepository::new(RepositoryId(2), "owner", "repo", CloudVendor::Ncp);
        let deployment = Deployment::new(DeploymentId(5), repository.id, "main", "abc123");
        let result = provider(&server)
            .trigger_build("builds/5/source.zip", &deployment, &repository)
            .await
            .unwrap();

        assert_eq!(result.external_build_id, "hangar-build-5");
        assert_eq!(result.tracking_handle, "builds");
        assert_eq!(result.image_uri, "registry.example.com/owner-repo:latest");
    }

    #[tokio::test]
    async fn existing_job_fails_the_trigger() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(JOBS_PATH))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "apiVersion": "v1",
                "kind": "Status",
                "metadata": {},
                "status": "Failure",
                "message": "jobs.batch \"hangar-build-5\" already exists",
                "reason": "AlreadyExists",
                "code": 409
            })))
            .mount(&server)
            .await;

        let repository = SourceRepository::new(RepositoryId(2), "owner", "repo", CloudVendor::Ncp);
        let deployment = Deployment::new(DeploymentId(5), repository.id, "main", "abc123");
        let err = provider(&server)
            .trigger_build("builds/5/source.zip", &deployment, &repository)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BUILD_TRIGGER_FAILED");
    }

    #[tokio::test]
    async fn succeeded_job_completes_the_build() {
        let server = MockServer::start().await;
        serve_job(&server, json!({ "succeeded": 1 })).await;

        let status = provider(&server)
            .get_build_status("builds", "hangar-build-5")
            .await
            .unwrap();
        assert!(status.completed);
        assert!(status.succeeded);
    }

    #[tokio::test]
    async fn active_job_with_stuck_pod_is_failed() {
        let server = MockServer::start().await;
        serve_job(&server, json!({ "active": 1 })).await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/builds/pods"))
            .and(query_param("labelSelector", "job-name=hangar-build-5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(list(
                "PodList",
                json!([{
                    "metadata": { "name": "hangar-build-5-x7k2p" },
                    "status": {
                        "phase": "Pending",
                        "containerStatuses": [{
                            "name": "kaniko",
                            "image": "kaniko",
                            "imageID": "",
                            "ready": false,
                            "restartCount": 0,
                            "state": { "waiting": { "reason": "ImagePullBackOff" } }
                        }]
                    }
                }]),
            )))
            .mount(&server)
            .await;

        let status = provider(&server)
            .get_build_status("builds", "hangar-build-5")
            .await
            .unwrap();
        assert!(status.completed);
        assert!(!status.succeeded);
        assert!(status.message.contains("ImagePullBackOff"));
    }

    #[tokio::test]
    async fn active_job_with_healthy_pod_keeps_running() {
        let server = MockServer::start().await;
        serve_job(&server, json!({ "active": 1 })).await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/builds/pods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(list(
                "PodList",
                json!([{
                    "metadata": { "name": "hangar-build-5-x7k2p" },
                    "status": { "phase": "Running" }
                }]),
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/builds/events"))
            .and(query_param("fieldSelector", "involvedObject.name=hangar-build-5-x7k2p"))
            .respond_with(ResponseTemplate::new(200).set_body_json(list("EventList", json!([]))))
            .expect(1)
            .mount(&server)
            .await;

        let status = provider(&server)
            .get_build_status("builds", "hangar-build-5")
            .await
            .unwrap();
        assert!(!status.completed);
    }

    #[tokio::test]
    async fn missing_job_is_a_build_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{JOBS_PATH}/hangar-build-5")))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "apiVersion": "v1",
                "kind": "Status",
                "metadata": {},
                "status": "Failure",
                "message": "jobs.batch \"hangar-build-5\" not found",
                "reason": "NotFound",
                "code": 404
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .get_build_status("builds", "hangar-build-5")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("build job hangar-build-5 not found"));
    }
}

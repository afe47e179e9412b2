//! Managed build-service backend.
//!
//! Sources are staged exactly as for in-cluster builds. Builds run in a
//! per-repository project on the service; the tracking handle is the project
//! id and the build id is the service's build id.

mod models;
mod signer;

pub use signer::ApiSigner;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use self::models::{
    id_string, trigger_request, BuildStatusResponse, CreateProjectRequest, ProjectResponse,
    TriggerResponse,
};
use self::signer::{ACCESS_KEY_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use super::CloudInfraProvider;
use crate::config::SourceBuildConfig;
use crate::error::{PipelineError, Result};
use crate::source::SourceStager;
use crate::storage::source_key;
use crate::types::{BuildResult, BuildStatusResult, Deployment, SourceRepository};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Managed build-service provider.
#[derive(Clone)]
pub struct SourceBuildProvider {
    client: Client,
    base_url: String,
    signer: ApiSigner,
    registry_endpoint: String,
    stager: SourceStager,
}

impl SourceBuildProvider {
    pub fn new(
        config: &SourceBuildConfig,
        registry_endpoint: &str,
        stager: SourceStager,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| {
                PipelineError::Configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            signer: ApiSigner::new(config.access_key.clone(), config.secret_key.clone()),
            registry_endpoint: registry_endpoint.to_string(),
            stager,
        })
    }

    /// Send a signed request; `wrap` picks the error variant for failures.
    async fn call<T, B>(
        &self,
        method: Method,
        uri: &str,
        body: Option<&B>,
        wrap: fn(String) -> PipelineError,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = self.signer.sign(method.as_str(), uri, &timestamp)?;
        let url = format!("{}{uri}", self.base_url);
        debug!(method = %method, url = %url, "Build service request");

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(TIMESTAMP_HEADER, &timestamp)
            .header(ACCESS_KEY_HEADER, self.signer.access_key())
            .header(SIGNATURE_HEADER, signature);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| wrap(format!("{method} {uri} failed: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| wrap(format!("{method} {uri} failed: {e}")))?;
        if !status.is_success() {
            return Err(wrap(format!("{method} {uri} returned {status}: {text}")));
        }
        serde_json::from_str(&text)
            .map_err(|e| wrap(format!("{method} {uri} returned an unexpected body: {e}")))
    }
}

#[async_trait]
impl CloudInfraProvider for SourceBuildProvider {
    fn name(&self) -> &'static str {
        "source-build"
    }

    fn has_build_projects(&self) -> bool {
        true
    }

    async fn upload_source_to_storage(
        &self,
        credential: &str,
        deployment: &Deployment,
        repository: &SourceRepository,
    ) -> Result<String> {
        self.stager.stage(credential, deployment, repository).await
    }

    async fn create_build_project(
        &self,
        repository: &SourceRepository,
    ) -> Result<Option<String>> {
        let request = CreateProjectRequest::new(
            format!("hangar-{}", repository.id),
            self.stager.store().bucket(),
            &source_key("latest"),
            &self.registry_endpoint,
            &repository.app_name(),
        );
        let response: ProjectResponse = self
            .call(
                Method::POST,
                "/api/v1/project",
                Some(&request),
                PipelineError::BuildTrigger,
            )
            .await?;
        let project_id = id_string(&response.id).ok_or_else(|| {
            PipelineError::BuildTrigger("build project response carried no id".to_string())
        })?;

        info!(repository_id = %repository.id, project_id = %project_id, "Created build project");
        Ok(Some(project_id))
    }

    async fn trigger_build(
        &self,
        storage_key: &str,
        deployment: &Deployment,
        repository: &SourceRepository,
    ) -> Result<BuildResult> {
        let project_id = repository.external_build_project_id.as_deref().ok_or_else(|| {
            PipelineError::BuildTrigger(format!(
                "repository {} has no build project",
                repository.id
            ))
        })?;

        let uri = format!("/api/v1/project/{project_id}/build");
        let body = trigger_request(self.stager.store().bucket(), storage_key);
        let response: TriggerResponse = self
            .call(Method::POST, &uri, Some(&body), PipelineError::BuildTrigger)
            .await?;
        let build_id = id_string(&response.build_id).ok_or_else(|| {
            PipelineError::BuildTrigger("build trigger response carried no build id".to_string())
        })?;

        info!(
            deployment_id = %deployment.id,
            project_id = %project_id,
            build_id = %build_id,
            "Triggered managed build"
        );
        Ok(BuildResult {
            external_build_id: build_id,
            tracking_handle: project_id.to_string(),
            image_uri: repository.image_uri(&self.registry_endpoint),
        })
    }

    async fn get_build_status(
        &self,
        tracking_handle: &str,
        build_id: &str,
    ) -> Result<BuildStatusResult> {
        let uri = format!("/api/v1/project/{tracking_handle}/build/{build_id}");
        let response: BuildStatusResponse = self
            .call::<_, ()>(Method::GET, &uri, None, PipelineError::BuildFailed)
            .await?;

        let message = response
            .status_message
            .clone()
            .unwrap_or_else(|| response.status.to_lowercase());
        Ok(match response.status.as_str() {
            "SUCCEEDED" => BuildStatusResult::succeeded(response.image_uri),
            "FAILED" | "CANCELED" => BuildStatusResult::failed(message),
            _ => BuildStatusResult::running(),
        })
    }

    async fn scale_service(&self, resource_name: &str, replicas: i32) -> Result<()> {
        info!(resource = %resource_name, replicas, "Scaling is handled by the workload reconciler");
        Ok(())
    }
}

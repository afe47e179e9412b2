//! Vendor contract consumed by the pipeline.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{BuildResult, BuildStatusResult, Deployment, SourceRepository};

/// One implementation per build backend.
#[async_trait]
pub trait CloudInfraProvider: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Stage the commit's source; returns `builds/{deploymentId}/source.zip`.
    async fn upload_source_to_storage(
        &self,
        credential: &str,
        deployment: &Deployment,
        repository: &SourceRepository,
    ) -> Result<String>;

    /// Whether builds run inside a per-repository vendor project.
    fn has_build_projects(&self) -> bool {
        false
    }

    /// Provision a vendor-side build project for the repository.
    ///
    /// Only called when [`has_build_projects`](Self::has_build_projects) is
    /// true, at most once per repository; the caller caches the id.
    async fn create_build_project(
        &self,
        _repository: &SourceRepository,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    /// Submit a build of `storage_key`.
    async fn trigger_build(
        &self,
        storage_key: &str,
        deployment: &Deployment,
        repository: &SourceRepository,
    ) -> Result<BuildResult>;

    /// Observe a submitted build.
    async fn get_build_status(
        &self,
        tracking_handle: &str,
        build_id: &str,
    ) -> Result<BuildStatusResult>;

    /// Vendor-side scale hook.
    async fn scale_service(&self, resource_name: &str, replicas: i32) -> Result<()>;
}

//! Hangar configuration
//!
//! Loaded once at startup from a YAML file. Every knob has a default so a
//! partial file is enough for local runs.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HangarConfig {
    pub pipeline: PipelineConfig,
    pub kubernetes: KubernetesConfig,
    pub build: BuildConfig,
    pub storage: StorageConfig,
    pub github: GitHubConfig,
    /// Managed build-service credentials; only needed when a vendor maps to it.
    pub source_build: Option<SourceBuildConfig>,
    /// Vendor tag (`NCP`, `AWS`, `ON_PREMISE`) to build backend.
    pub vendors: HashMap<String, VendorBackend>,
}

/// Poll schedule and worker sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    pub poll_initial_interval_ms: u64,
    pub poll_max_interval_ms: u64,
    pub build_timeout_ms: u64,
    pub max_concurrent_runs: usize,
    pub worker_threads: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_initial_interval_ms: 10_000,
            poll_max_interval_ms: 60_000,
            build_timeout_ms: 1_800_000,
            max_concurrent_runs: 16,
            worker_threads: 4,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn poll_initial_interval(&self) -> Duration {
        Duration::from_millis(self.poll_initial_interval_ms)
    }

    #[must_use]
    pub fn poll_max_interval(&self) -> Duration {
        Duration::from_millis(self.poll_max_interval_ms)
    }

    #[must_use]
    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }
}

/// Target cluster settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesConfig {
    pub namespace: String,
    /// Docker config secret used both to push built images and to pull them.
    pub image_pull_secret: String,
    /// Field manager name for server-side apply.
    pub field_manager: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            image_pull_secret: "registry-credentials".to_string(),
            field_manager: "hangar".to_string(),
        }
    }
}

/// In-cluster image build settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BuildConfig {
    pub registry_endpoint: String,
    pub kaniko_image: String,
    pub fetcher_image: String,
    pub ttl_seconds_after_finished: i32,
    pub job_name_prefix: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            registry_endpoint: String::new(),
            kaniko_image: "gcr.io/kaniko-project/executor:latest".to_string(),
            fetcher_image: "amazon/aws-cli:latest".to_string(),
            ttl_seconds_after_finished: 3600,
            job_name_prefix: "hangar-build".to_string(),
        }
    }
}

/// S3-compatible object storage used to stage sources.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    /// Secret with `access-key` / `secret-key` keys, read by the fetch step.
    pub credentials_secret: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            region: "us-east-1".to_string(),
            bucket: "hangar-sources".to_string(),
            credentials_secret: "hangar-storage-credentials".to_string(),
            access_key: None,
            secret_key: None,
        }
    }
}

/// GitHub App identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GitHubConfig {
    pub api_base_url: String,
    pub app_id: Option<u64>,
    pub private_key_path: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.github.com".to_string(),
            app_id: None,
            private_key_path: None,
        }
    }
}

/// Managed build-service API credentials.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBuildConfig {
    pub api_base_url: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Build backend a vendor tag is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VendorBackend {
    Kaniko,
    SourceBuild,
}

impl HangarConfig {
    /// Load and validate configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("failed to read config file {path}: {e}"))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: HangarConfig = serde_yaml::from_str(raw).map_err(|e| {
            PipelineError::Configuration(format!("failed to parse config YAML: {e}"))
        })?;
        if config.vendors.is_empty() {
            config
                .vendors
                .insert("NCP".to_string(), VendorBackend::Kaniko);
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let pipeline = &self.pipeline;
        if pipeline.poll_initial_interval_ms == 0 {
            return Err(PipelineError::Configuration(
                "pipeline.pollInitialIntervalMs must be greater than zero".to_string(),
            ));
        }
        if pipeline.poll_max_interval_ms < pipeline.poll_initial_interval_ms {
            return Err(PipelineError::Configuration(format!(
                "pipeline.pollMaxIntervalMs ({}) is below pollInitialIntervalMs ({})",
                pipeline.poll_max_interval_ms, pipeline.poll_initial_interval_ms
            )));
        }
        if pipeline.max_concurrent_runs == 0 || pipeline.worker_threads == 0 {
            return Err(PipelineError::Configuration(
                "pipeline.maxConcurrentRuns and pipeline.workerThreads must be positive"
                    .to_string(),
            ));
        }
        if self.kubernetes.namespace.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "kubernetes.namespace must not be empty".to_string(),
            ));
        }
        if !self.vendors.is_empty() && self.build.registry_endpoint.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "build.registryEndpoint is required when a vendor is enabled".to_string(),
            ));
        }
        let needs_source_build = self
            .vendors
            .values()
            .any(|backend| *backend == VendorBackend::SourceBuild);
        if needs_source_build && self.source_build.is_none() {
            return Err(PipelineError::Configuration(
                "sourceBuild section is required by the configured vendors".to_string(),
            ));
        }
        Ok(())
    }
}

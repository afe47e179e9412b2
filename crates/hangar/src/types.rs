//! Core domain types: deployments, repositories, runtime config and the
//! transient values exchanged with build vendors.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Container port used when a deployment config carries a non-positive one.
pub const DEFAULT_CONTAINER_PORT: i32 = 8080;

/// Identifier of a deployment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(pub u64);

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a source repository record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(pub u64);

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Infrastructure vendor a repository builds on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloudVendor {
    Ncp,
    Aws,
    OnPremise,
}

impl CloudVendor {
    /// Every vendor tag the system knows about.
    pub const ALL: [CloudVendor; 3] = [Self::Ncp, Self::Aws, Self::OnPremise];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ncp => "NCP",
            Self::Aws => "AWS",
            Self::OnPremise => "ON_PREMISE",
        }
    }
}

impl fmt::Display for CloudVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudVendor {
    type Err = PipelineError;

    fn from_str(tag: &str) -> Result<Self> {
        let normalized = tag.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "NCP" => Ok(Self::Ncp),
            "AWS" => Ok(Self::Aws),
            "ON_PREMISE" | "ONPREMISE" => Ok(Self::OnPremise),
            _ => Err(PipelineError::Configuration(format!(
                "unknown cloud vendor '{tag}'"
            ))),
        }
    }
}

/// Lifecycle of a deployment.
///
/// Forward order is `Pending → UploadingSource → Building → Deploying → Success`.
/// `Failed` is reachable from every non-terminal state. `Canceled` is reserved
/// for an external operator action and is never driven by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    UploadingSource,
    Building,
    Deploying,
    Success,
    Failed,
    Canceled,
}

impl DeploymentStatus {
    /// Position along the forward path; terminal escape states have none.
    fn rank(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::UploadingSource => Some(1),
            Self::Building => Some(2),
            Self::Deploying => Some(3),
            Self::Success => Some(4),
            Self::Failed | Self::Canceled => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }

    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (Some(current), Some(target)) => target == current + 1,
            (_, None) => true,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::UploadingSource => "UPLOADING_SOURCE",
            Self::Building => "BUILDING",
            Self::Deploying => "DEPLOYING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

/// One build-and-run attempt of a repository at a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: DeploymentId,
    pub repository_id: RepositoryId,
    pub branch_name: String,
    pub commit_hash: String,
    pub storage_object_key: Option<String>,
    pub external_build_id: Option<String>,
    pub status: DeploymentStatus,
    pub fail_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// New deployment in `PENDING`, started now.
    #[must_use]
    pub fn new(
        id: DeploymentId,
        repository_id: RepositoryId,
        branch_name: impl Into<String>,
        commit_hash: impl Into<String>,
    ) -> Self {
        Self {
            id,
            repository_id,
            branch_name: branch_name.into(),
            commit_hash: commit_hash.into(),
            storage_object_key: None,
            external_build_id: None,
            status: DeploymentStatus::Pending,
            fail_reason: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// First seven characters of the commit, for labels and log lines.
    #[must_use]
    pub fn short_commit(&self) -> &str {
        let end = self
            .commit_hash
            .char_indices()
            .nth(7)
            .map_or(self.commit_hash.len(), |(idx, _)| idx);
        &self.commit_hash[..end]
    }

    fn transition(&mut self, next: DeploymentStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidState(format!(
                "deployment {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn start_upload(&mut self) -> Result<()> {
        self.transition(DeploymentStatus::UploadingSource)
    }

    /// Records the staged source key and moves to `BUILDING`.
    pub fn mark_uploaded(&mut self, storage_object_key: impl Into<String>) -> Result<()> {
        if self.storage_object_key.is_some() {
            return Err(PipelineError::InvalidState(format!(
                "deployment {} already has a staged source",
                self.id
            )));
        }
        self.transition(DeploymentStatus::Building)?;
        self.storage_object_key = Some(storage_object_key.into());
        Ok(())
    }

    /// Records the vendor build id. Status stays `BUILDING`.
    pub fn mark_build_triggered(&mut self, external_build_id: impl Into<String>) -> Result<()> {
        if self.status != DeploymentStatus::Building {
            return Err(PipelineError::InvalidState(format!(
                "deployment {} is {} and cannot record a build",
                self.id, self.status
            )));
        }
        if self.external_build_id.is_some() {
            return Err(PipelineError::InvalidState(format!(
                "deployment {} already has a build id",
                self.id
            )));
        }
        self.external_build_id = Some(external_build_id.into());
        Ok(())
    }

    pub fn start_deploying(&mut self) -> Result<()> {
        self.transition(DeploymentStatus::Deploying)
    }

    pub fn complete_success(&mut self) -> Result<()> {
        self.transition(DeploymentStatus::Success)
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(DeploymentStatus::Failed)?;
        self.fail_reason = Some(reason.into());
        Ok(())
    }
}

/// Identity of a buildable source location plus its cached build project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRepository {
    pub id: RepositoryId,
    pub owner: String,
    pub repo_name: String,
    pub git_url: String,
    pub cloud_vendor: CloudVendor,
    pub external_build_project_id: Option<String>,
}

impl SourceRepository {
    #[must_use]
    pub fn new(
        id: RepositoryId,
        owner: impl Into<String>,
        repo_name: impl Into<String>,
        cloud_vendor: CloudVendor,
    ) -> Self {
        let owner = owner.into();
        let repo_name = repo_name.into();
        let git_url = format!("https://github.com/{owner}/{repo_name}.git");
        Self {
            id,
            owner,
            repo_name,
            git_url,
            cloud_vendor,
            external_build_project_id: None,
        }
    }

    /// `owner/repo`, the key used by the installation-token cache.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo_name)
    }

    /// `{owner}-{repoName}` as a DNS-1123 label: shared by the image name and
    /// every runtime resource of the repository.
    #[must_use]
    pub fn app_name(&self) -> String {
        let raw = format!("{}-{}", self.owner, self.repo_name).to_ascii_lowercase();
        let sanitized: String = raw
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        sanitized.trim_matches('-').to_string()
    }

    /// `{registryEndpoint}/{owner}-{repoName}:latest`.
    #[must_use]
    pub fn image_uri(&self, registry_endpoint: &str) -> String {
        format!(
            "{}/{}:latest",
            registry_endpoint.trim_end_matches('/'),
            self.app_name()
        )
    }
}

/// Desired runtime shape of a repository's workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    pub repository_id: RepositoryId,
    pub min_replicas: i32,
    pub max_replicas: i32,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub container_port: i32,
    #[serde(default)]
    pub domain_url: Option<String>,
}

impl DeploymentConfig {
    #[must_use]
    pub fn effective_container_port(&self) -> i32 {
        if self.container_port > 0 {
            self.container_port
        } else {
            DEFAULT_CONTAINER_PORT
        }
    }

    /// Domain to expose through an ingress, if any.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.domain_url
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
    }
}

/// Returned by a vendor when a build has been submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    pub external_build_id: String,
    pub tracking_handle: String,
    pub image_uri: String,
}

/// One observation of a build's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatusResult {
    pub completed: bool,
    pub succeeded: bool,
    pub image_uri: Option<String>,
    pub message: String,
}

impl BuildStatusResult {
    #[must_use]
    pub fn running() -> Self {
        Self {
            completed: false,
            succeeded: false,
            image_uri: None,
            message: "running".to_string(),
        }
    }

    #[must_use]
    pub fn succeeded(image_uri: Option<String>) -> Self {
        Self {
            completed: true,
            succeeded: true,
            image_uri,
            message: "success".to_string(),
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            completed: true,
            succeeded: false,
            image_uri: None,
            message: message.into(),
        }
    }
}

/// Status snapshot handed back to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatusView {
    pub status: DeploymentStatus,
    pub fail_reason: Option<String>,
}

impl From<&Deployment> for DeploymentStatusView {
    fn from(deployment: &Deployment) -> Self {
        Self {
            status: deployment.status,
            fail_reason: deployment.fail_reason.clone(),
        }
    }
}

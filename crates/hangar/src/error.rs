//! Error taxonomy for the build-and-deploy pipeline.
//!
//! Every fallible operation in this crate returns [`Result`]. Any variant is
//! fatal to the pipeline run that produced it: the run ends by marking the
//! deployment `FAILED` with the error's display text as the reason.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Errors raised by the pipeline and its collaborators.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Installation token could not be issued (app not installed, upstream
    /// rejected the app JWT, ...). Usually needs operator action.
    #[error("Credential error: {0}")]
    Credential(String),

    /// Source archive could not be fetched, repackaged or uploaded.
    #[error("Source upload failed: {0}")]
    SourceUpload(String),

    /// Build could not be submitted to the vendor.
    #[error("Build trigger failed: {0}")]
    BuildTrigger(String),

    /// Build did not reach a terminal state within the configured timeout.
    #[error("Build timed out after {elapsed_ms}ms (limit {timeout_ms}ms)")]
    BuildTimeout { elapsed_ms: u64, timeout_ms: u64 },

    /// Build reached a terminal state but did not succeed.
    #[error("Build failed: {0}")]
    BuildFailed(String),

    /// Cluster API rejected the runtime resources.
    #[error("Deploy failed: {0}")]
    Deploy(String),

    /// No deployment config exists for the repository.
    #[error("Deployment config not found for repository {0}")]
    ConfigNotFound(String),

    /// Static configuration problem, e.g. an unknown vendor tag.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Deployment or repository does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A state transition or write-once field was misused.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A pipeline for this deployment is already in flight.
    #[error("Pipeline already running for deployment {0}")]
    AlreadyRunning(String),

    /// Persistence layer failure.
    #[error("Store error: {0}")]
    Store(String),
}

impl PipelineError {
    /// Stable machine-readable code for collaborators that map errors to responses.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Credential(_) => "CREDENTIAL_ERROR",
            Self::SourceUpload(_) => "SOURCE_UPLOAD_FAILED",
            Self::BuildTrigger(_) => "BUILD_TRIGGER_FAILED",
            Self::BuildTimeout { .. } => "BUILD_TIMEOUT",
            Self::BuildFailed(_) => "BUILD_FAILED",
            Self::Deploy(_) => "DEPLOY_FAILED",
            Self::ConfigNotFound(_) => "DEPLOYMENT_CONFIG_NOT_FOUND",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

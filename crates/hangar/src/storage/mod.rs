//! Object storage used to stage source archives for in-cluster builds.

mod memory;
mod s3;

pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

use async_trait::async_trait;

use crate::error::Result;

/// Content type of staged archives.
pub const ZIP_CONTENT_TYPE: &str = "application/zip";

/// Deterministic staging key for a deployment's source archive.
#[must_use]
pub fn source_key(deployment_id: impl std::fmt::Display) -> String {
    format!("builds/{deployment_id}/source.zip")
}

/// Minimal blob store surface the pipeline needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket name, used when building fetch commands for build jobs.
    fn bucket(&self) -> &str;

    /// S3-compatible endpoint URL the cluster reaches the store on.
    fn endpoint(&self) -> &str;

    /// Write `body` under `key`, replacing any existing object.
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;
}

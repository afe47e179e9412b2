//! S3-compatible object store.
//!
//! Path-style addressing against a custom endpoint, which is what most
//! non-AWS providers (and MinIO) expect.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use super::ObjectStore;
use crate::config::StorageConfig;
use crate::error::{PipelineError, Result};

#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    endpoint: String,
}

impl S3ObjectStore {
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() || config.bucket.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "storage.endpoint and storage.bucket are required".to_string(),
            ));
        }
        let (Some(access_key), Some(secret_key)) =
            (config.access_key.as_deref(), config.secret_key.as_deref())
        else {
            return Err(PipelineError::Configuration(
                "storage.accessKey and storage.secretKey are required".to_string(),
            ));
        };

        let credentials = Credentials::new(access_key, secret_key, None, None, "hangar-config");
        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        let size = body.len();
        debug!(bucket = %self.bucket, key, size, "Uploading object");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                PipelineError::SourceUpload(format!(
                    "upload of s3://{}/{key} failed: {}",
                    self.bucket,
                    DisplayErrorContext(&e)
                ))
            })?;

        info!(bucket = %self.bucket, key, size, "Uploaded object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_upload_credentials() {
        let config = StorageConfig {
            endpoint: "https://storage.example.com".to_string(),
            ..StorageConfig::default()
        };
        let err = S3ObjectStore::from_config(&config).unwrap_err();
        assert_eq!(err.kind(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn builds_with_custom_endpoint() {
        let config = StorageConfig {
            endpoint: "https://storage.example.com".to_string(),
            access_key: Some("ak".to_string()),
            secret_key: Some("sk".to_string()),
            ..StorageConfig::default()
        };
        let store = S3ObjectStore::from_config(&config).unwrap();
        assert_eq!(store.bucket(), "hangar-sources");
        assert_eq!(store.endpoint(), "https://storage.example.com");
    }
}

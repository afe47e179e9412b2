use std::sync::Arc;
use std::time::Duration;

use reqwest::header::LOCATION;
use reqwest::{redirect, Client};
use tracing::{debug, info};

use super::archive::strip_top_level_dir;
use crate::error::{PipelineError, Result};
use crate::github::{ACCEPT_HEADER, API_VERSION, USER_AGENT};
use crate::storage::{source_key, ObjectStore, ZIP_CONTENT_TYPE};
use crate::types::{Deployment, SourceRepository};

const DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Stages a commit's source archive into object storage.
#[derive(Clone)]
pub struct SourceStager {
    client: Client,
    api_base_url: String,
    store: Arc<dyn ObjectStore>,
}

impl SourceStager {
    pub fn new(api_base_url: impl Into<String>, store: Arc<dyn ObjectStore>) -> Result<Self> {
        // The archive endpoint answers with a redirect that must be followed
        // by hand so the bearer token is not replayed to the download host.
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| {
                PipelineError::Configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            store,
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Fetch, re-root and upload the archive; returns the storage key.
    pub async fn stage(
        &self,
        credential: &str,
        deployment: &Deployment,
        repository: &SourceRepository,
    ) -> Result<String> {
        let archive = self.download_archive(credential, deployment, repository).await?;
        let repackaged = strip_top_level_dir(&archive)?;

        let key = source_key(deployment.id);
        let original_size = archive.len();
        let repackaged_size = repackaged.len();
        self.store.put(&key, repackaged, ZIP_CONTENT_TYPE).await?;

        info!(
            deployment_id = %deployment.id,
            bucket = %self.store.bucket(),
            key = %key,
            original_size,
            repackaged_size,
            "Source staged"
        );
        Ok(key)
    }

    async fn download_archive(
        &self,
        credential: &str,
        deployment: &Deployment,
        repository: &SourceRepository,
    ) -> Result<Vec<u8>> {
        let url = format!(
            "{}/repos/{}/{}/zipball/{}",
            self.api_base_url, repository.owner, repository.repo_name, deployment.commit_hash
        );
        debug!(url = %url, "Requesting archive redirect");

        let response = self
            .client
            .get(&url)
            .bearer_auth(credential)
            .header("Accept", ACCEPT_HEADER)
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await
            .map_err(|e| PipelineError::SourceUpload(format!("archive request failed: {e}")))?;

        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::SourceUpload(format!(
                    "archive endpoint returned {status} without a redirect location"
                ))
            })?;

        let download = self
            .client
            .get(&location)
            .send()
            .await
            .map_err(|e| PipelineError::SourceUpload(format!("archive download failed: {e}")))?;
        let status = download.status();
        if !status.is_success() {
            return Err(PipelineError::SourceUpload(format!(
                "archive download returned {status}"
            )));
        }

        let bytes = download
            .bytes()
            .await
            .map_err(|e| PipelineError::SourceUpload(format!("archive download failed: {e}")))?;
        if bytes.is_empty() {
            return Err(PipelineError::SourceUpload(
                "archive download returned an empty body".to_string(),
            ));
        }
        Ok(bytes.to_vec())
    }
}

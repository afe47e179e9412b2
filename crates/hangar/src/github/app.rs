//! GitHub App client.
//!
//! Authenticates as the app with a short-lived RS256 JWT and exchanges it for
//! repository-scoped installation tokens.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::token_cache::InstallationTokenIssuer;
use super::{ACCEPT_HEADER, API_VERSION, USER_AGENT};
use crate::config::GitHubConfig;
use crate::error::{PipelineError, Result};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Backdate `iat` to tolerate clock drift between us and GitHub.
const JWT_BACKDATE_SECS: i64 = 60;

/// GitHub caps app JWTs at ten minutes.
const JWT_LIFETIME_SECS: i64 = 9 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct InstallationResponse {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
}

/// App-authenticated GitHub REST client.
#[derive(Clone)]
pub struct GitHubAppClient {
    client: Client,
    base_url: String,
    app_id: u64,
    key: EncodingKey,
}

impl GitHubAppClient {
    /// Build a client from the app id and its PEM private key.
    pub fn new(base_url: impl Into<String>, app_id: u64, private_key_pem: &[u8]) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(private_key_pem).map_err(|e| {
            PipelineError::Configuration(format!("invalid GitHub App private key: {e}"))
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| {
                PipelineError::Configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_id,
            key,
        })
    }

    pub fn from_config(config: &GitHubConfig) -> Result<Self> {
        let app_id = config.app_id.ok_or_else(|| {
            PipelineError::Configuration("github.appId is required".to_string())
        })?;
        let key_path = config.private_key_path.as_deref().ok_or_else(|| {
            PipelineError::Configuration("github.privateKeyPath is required".to_string())
        })?;
        let pem = std::fs::read(key_path).map_err(|e| {
            PipelineError::Configuration(format!("failed to read GitHub App key {key_path}: {e}"))
        })?;
        Self::new(config.api_base_url.clone(), app_id, &pem)
    }

    /// Sign a fresh app JWT.
    fn app_jwt(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - JWT_BACKDATE_SECS,
            exp: now + JWT_LIFETIME_SECS,
            iss: self.app_id.to_string(),
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| PipelineError::Credential(format!("failed to sign app JWT: {e}")))
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        Ok(builder
            .bearer_auth(self.app_jwt()?)
            .header("Accept", ACCEPT_HEADER)
            .header("X-GitHub-Api-Version", API_VERSION))
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        context: &str,
    ) -> Result<T> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PipelineError::Credential(format!("{context}: {e}")))?;
        if !status.is_success() {
            return Err(PipelineError::Credential(format!(
                "{context}: GitHub returned {status}: {text}"
            )));
        }
        serde_json::from_str(&text)
            .map_err(|e| PipelineError::Credential(format!("{context}: unexpected response: {e}")))
    }
}

#[async_trait]
impl InstallationTokenIssuer for GitHubAppClient {
    async fn installation_id(&self, owner: &str, repo: &str) -> Result<u64> {
        let url = format!("{}/repos/{owner}/{repo}/installation", self.base_url);
        debug!(url = %url, "Resolving app installation");

        let response = self
            .authorized(self.client.get(&url))?
            .send()
            .await
            .map_err(|e| PipelineError::Credential(format!("installation lookup failed: {e}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(PipelineError::Credential(format!(
                "GitHub App is not installed on {owner}/{repo}"
            )));
        }
        let installation: InstallationResponse =
            Self::handle_response(response, "installation lookup failed").await?;
        Ok(installation.id)
    }

    async fn create_installation_token(&self, installation_id: u64) -> Result<String> {
        let url = format!(
            "{}/app/installations/{installation_id}/access_tokens",
            self.base_url
        );
        let response = self
            .authorized(self.client.post(&url))?
            .send()
            .await
            .map_err(|e| PipelineError::Credential(format!("token issuance failed: {e}")))?;

        let token: AccessTokenResponse =
            Self::handle_response(response, "token issuance failed").await?;
        info!(installation_id, "Issued installation token");
        Ok(token.token)
    }
}

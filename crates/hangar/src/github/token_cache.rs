//! Installation-token cache.
//!
//! Hits are served lock-free from a concurrent map. Misses serialize on one
//! cache-wide lock and re-check before provisioning so concurrent callers for
//! the same repository never issue twice.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::Result;

/// Installation tokens live about an hour upstream; refresh well before that.
pub const TOKEN_TTL: Duration = Duration::from_secs(55 * 60);

/// Upstream operations needed to mint an installation token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstallationTokenIssuer: Send + Sync {
    /// Installation id of the app on `owner/repo`.
    async fn installation_id(&self, owner: &str, repo: &str) -> Result<u64>;

    /// Mint a new token for an installation.
    async fn create_installation_token(&self, installation_id: u64) -> Result<String>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Caches installation tokens per `owner/repo`.
pub struct InstallationTokenCache {
    issuer: Arc<dyn InstallationTokenIssuer>,
    entries: DashMap<String, CachedToken>,
    provision_lock: Mutex<()>,
    ttl: Duration,
}

impl InstallationTokenCache {
    pub fn new(issuer: Arc<dyn InstallationTokenIssuer>) -> Self {
        Self::with_ttl(issuer, TOKEN_TTL)
    }

    pub fn with_ttl(issuer: Arc<dyn InstallationTokenIssuer>, ttl: Duration) -> Self {
        Self {
            issuer,
            entries: DashMap::new(),
            provision_lock: Mutex::new(()),
            ttl,
        }
    }

    fn fresh(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| Instant::now() < entry.expires_at)
            .map(|entry| entry.token.clone())
    }

    /// Token for `owner/repo`, issuing a new one when missing or expired.
    pub async fn get_installation_token(&self, owner: &str, repo: &str) -> Result<String> {
        let key = format!("{owner}/{repo}");
        if let Some(token) = self.fresh(&key) {
            debug!(repository = %key, "Installation token cache hit");
            return Ok(token);
        }

        let _guard = self.provision_lock.lock().await;
        if let Some(token) = self.fresh(&key) {
            debug!(repository = %key, "Installation token provisioned by a concurrent caller");
            return Ok(token);
        }

        let installation_id = self.issuer.installation_id(owner, repo).await?;
        let token = self
            .issuer
            .create_installation_token(installation_id)
            .await?;
        self.entries.insert(
            key.clone(),
            CachedToken {
                token: token.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        info!(repository = %key, installation_id, "Cached new installation token");
        Ok(token)
    }
}

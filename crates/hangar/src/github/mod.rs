//! GitHub App integration: app-authenticated REST calls and the
//! installation-token cache that feeds source staging.

pub mod app;
pub mod token_cache;

pub use app::GitHubAppClient;
pub use token_cache::{InstallationTokenCache, InstallationTokenIssuer, TOKEN_TTL};

/// Media type GitHub recommends for REST calls.
pub(crate) const ACCEPT_HEADER: &str = "application/vnd.github+json";

/// Pinned REST API version.
pub(crate) const API_VERSION: &str = "2022-11-28";

/// GitHub rejects requests without a User-Agent.
pub(crate) const USER_AGENT: &str = concat!("hangar/", env!("CARGO_PKG_VERSION"));

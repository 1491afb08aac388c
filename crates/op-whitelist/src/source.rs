use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use op_common::fs::{read_optional, write_atomic};
use thiserror::Error;
use tracing::{debug, info};

use crate::policy::{self, ParseError, Policy};

#[derive(Error, Debug)]
pub enum FetchError {
    /// Network failure, timeout or non-2xx status. Keep the last good policy.
    #[error("whitelist unreachable: {0}")]
    Unreachable(String),
    #[error("whitelist rejected: {0}")]
    Parse(#[from] ParseError),
}

/// Where policies come from. The HTTP fetcher in production, fakes in tests.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn fetch(&self) -> Result<Policy, FetchError>;
}

/// Fetches the whitelist document over HTTP with a bounded timeout.
pub struct WhitelistFetcher {
    client: reqwest::Client,
    url: Option<String>,
}

impl WhitelistFetcher {
    pub fn new(url: Option<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("openpath/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Unreachable(format!("HTTP client: {e}")))?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }
}

#[async_trait]
impl PolicySource for WhitelistFetcher {
    async fn fetch(&self) -> Result<Policy, FetchError> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| FetchError::Unreachable("WHITELIST_URL is not set".to_string()))?;

        debug!(url, "Fetching whitelist");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Unreachable(format!("HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;

        let policy = policy::parse(&body)?;
        if let Some(rules) = policy.rules() {
            info!(
                domains = rules.domains.len(),
                blocked_subdomains = rules.blocked_subdomains.len(),
                blocked_paths = rules.blocked_paths.len(),
                "Whitelist fetched"
            );
        }
        Ok(policy)
    }
}

/// Persist the canonical form of the last good policy.
pub fn save_cache(policy: &Policy, path: &Path) -> std::io::Result<()> {
    write_atomic(path, policy.to_document().as_bytes())
}

/// Load the last good policy, if one was cached and still parses.
pub fn load_cache(path: &Path) -> Option<Policy> {
    let content = read_optional(path).ok()??;
    policy::parse(&content).ok()
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;

use crate::orchestrator::RetryPolicy;
use crate::transfer::DEFAULT_CHUNK_SIZE;

const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 2;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

pub fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// Host-supplied configuration for the upload pipeline. The storage
/// directory holds the durable queue (`requests/`) and staged containers
/// (`archives/`); both survive process restarts.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub storage_dir: PathBuf,
    pub chunk_size: usize,
    pub max_concurrent_uploads: usize,
    pub retry: RetryPolicy,
    pub user_agent: String,
}

impl UploaderConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        let sdk_version = env!("CARGO_PKG_VERSION");
        let mut config = Self {
            storage_dir: storage_dir.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
            retry: RetryPolicy::default(),
            user_agent: format!("ResultPack/{sdk_version}"),
        };
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Some(dir) = env_var("RESULTPACK_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Some(size) = env_var("RESULTPACK_CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.chunk_size = size;
        }
        if let Some(limit) = env_var("RESULTPACK_MAX_CONCURRENT").and_then(|v| v.parse().ok()) {
            self.max_concurrent_uploads = limit;
        }
        if let Some(attempts) = env_var("RESULTPACK_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.retry.max_attempts = attempts;
        }
    }

    pub fn requests_dir(&self) -> PathBuf {
        self.storage_dir.join("requests")
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.storage_dir.join("archives")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.requests_dir()).with_context(|| {
            format!("Failed to create {}", self.requests_dir().display())
        })?;
        std::fs::create_dir_all(self.archives_dir()).with_context(|| {
            format!("Failed to create {}", self.archives_dir().display())
        })?;
        Ok(())
    }

    /// HTTP client used for container transfers: no overall request
    /// timeout (bodies stream at link speed) but a bounded connect phase.
    pub fn build_transfer_client(&self) -> Result<Client> {
        Client::builder()
            .user_agent(self.user_agent.clone())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build transfer client")
    }
}

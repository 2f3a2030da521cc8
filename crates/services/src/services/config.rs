//! Configuration for the analytics batcher and its ingest transport.

use std::time::Duration;

use thiserror::Error;
use url::Url;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BATCH_SIZE: usize = 20;
pub const DEFAULT_RPC_NAME: &str = "ingest_analytics_batch";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("flush interval must be greater than zero")]
    ZeroFlushInterval,
    #[error("max batch size must be greater than zero")]
    ZeroBatchSize,
    #[error("invalid base url {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}

/// Batching policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatcherConfig {
    /// Period of the background flush timer
    pub flush_interval: Duration,
    /// Queue length that triggers an immediate flush
    pub max_batch_size: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl BatcherConfig {
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval);
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }
}

/// Where and how to reach the ingest RPC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub base_url: String,
    pub api_key: String,
    pub rpc_name: String,
    /// `None` leaves the HTTP client's defaults in place
    pub request_timeout: Option<Duration>,
}

impl IngestConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            rpc_name: DEFAULT_RPC_NAME.to_string(),
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Both credentials are required before anything is sent on the unload path
    pub fn has_credentials(&self) -> bool {
        !self.base_url.trim().is_empty() && !self.api_key.trim().is_empty()
    }

    /// `{base_url}/rest/v1/rpc/{rpc_name}`
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason,
        };

        let mut url = Url::parse(self.base_url.trim()).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["rest", "v1", "rpc", self.rpc_name.as_str()]);
        Ok(url)
    }
}

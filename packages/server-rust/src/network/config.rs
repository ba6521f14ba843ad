//! Host configuration.

use std::time::Duration;

use crate::service::GovernorConfig;
use crate::storage::PoolConfig;

/// Where the dispatch loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Spawned onto the tokio runtime that calls `start()`.
    Ambient,
    /// A multi-thread runtime owned by the host, torn down at shutdown.
    Dedicated { worker_threads: usize },
}

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error("dedicated execution needs at least one worker thread")]
    NoWorkerThreads,
}

/// Immutable configuration of a `ServiceHost`.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Bind address for the listener.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    pub execution: ExecutionMode,
    /// Requests allowed to run handlers at once.
    pub max_concurrency: usize,
    /// Per-request time budget.
    pub request_timeout: Duration,
    /// Serve `GET /docs/routes`.
    pub expose_docs: bool,
    /// Allowed CORS origins; `"*"` allows any.
    pub cors_origins: Vec<String>,
    pub pool_size: usize,
    pub acquire_timeout: Duration,
    /// Upper bound on draining at shutdown.
    pub shutdown_grace: Duration,
    pub max_body_bytes: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            execution: ExecutionMode::Ambient,
            max_concurrency: 64,
            request_timeout: Duration::from_secs(30),
            expose_docs: false,
            cors_origins: vec!["*".to_string()],
            pool_size: 8,
            acquire_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

impl HostConfig {
    /// Checks every limit once, before the host is built.
    ///
    /// # Errors
    ///
    /// The first non-positive limit found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::NotPositive("max_concurrency"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::NotPositive("request_timeout"));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::NotPositive("pool_size"));
        }
        if self.acquire_timeout.is_zero() {
            return Err(ConfigError::NotPositive("acquire_timeout"));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::NotPositive("max_body_bytes"));
        }
        if let ExecutionMode::Dedicated { worker_threads: 0 } = self.execution {
            return Err(ConfigError::NoWorkerThreads);
        }
        Ok(())
    }

    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn governor_config(&self) -> GovernorConfig {
        GovernorConfig {
            max_concurrency: self.max_concurrency,
            request_timeout: self.request_timeout,
        }
    }

    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool_size,
            acquire_timeout: self.acquire_timeout,
        }
    }
}

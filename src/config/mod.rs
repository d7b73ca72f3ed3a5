//! Queue configuration.
//!
//! Two layers live here:
//!
//! - `AppConfig`: process-boundary configuration read once from the
//!   environment (connection URLs, parser credentials, initial queue
//!   settings).
//! - `QueueSettings` + `ConfigStore`: the live queue configuration. The
//!   settings are persisted as a JSON document under the `queue:config`
//!   key of the queue backend and cached in-process; writes are point
//!   updates and readers may briefly observe an older value. `shard_count`
//!   is fixed at process start and is not part of the persisted document.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::queue::{BackendError, QueueBackend};

/// Key under which the live settings document is stored.
pub const CONFIG_KEY: &str = "queue:config";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The backing store failed.
    #[error("config backend error: {0}")]
    Backend(#[from] BackendError),

    /// The persisted document could not be decoded.
    #[error("config serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Live queue configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Whether the anti-starvation daemon elevates waiting entries.
    pub anti_starvation_enabled: bool,
    /// Wait threshold past which an entry counts as starving.
    pub max_wait: Duration,
    /// Number of worker tasks in the pool.
    pub worker_count: usize,
    /// Entries requested per dispatcher tick.
    pub batch_size: usize,
    /// Per-item processing deadline.
    pub processing_timeout: Duration,
    /// Number of queue shards. Fixed at process start.
    pub shard_count: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            anti_starvation_enabled: true,
            max_wait: Duration::from_secs(300),
            worker_count: 4,
            batch_size: 10,
            processing_timeout: Duration::from_secs(30),
            shard_count: 4,
        }
    }
}

/// Wire form of the live-mutable settings, as stored at [`CONFIG_KEY`].
#[derive(Debug, Serialize, Deserialize)]
struct PersistedSettings {
    enabled: bool,
    max_wait_sec: u64,
    workers: usize,
    batch: usize,
    timeout_sec: u64,
}

impl QueueSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the settings values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_count must be greater than 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.processing_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "processing_timeout must be greater than 0".to_string(),
            ));
        }
        if self.shard_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "shard_count must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Builder method to enable or disable anti-starvation.
    pub fn with_anti_starvation(mut self, enabled: bool) -> Self {
        self.anti_starvation_enabled = enabled;
        self
    }

    /// Builder method to set the starvation threshold.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Builder method to set the worker count.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Builder method to set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Builder method to set the processing timeout.
    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    /// Builder method to set the shard count.
    pub fn with_shard_count(mut self, count: usize) -> Self {
        self.shard_count = count;
        self
    }

    fn to_persisted(&self) -> PersistedSettings {
        PersistedSettings {
            enabled: self.anti_starvation_enabled,
            max_wait_sec: self.max_wait.as_secs(),
            workers: self.worker_count,
            batch: self.batch_size,
            timeout_sec: self.processing_timeout.as_secs(),
        }
    }

    fn from_persisted(persisted: PersistedSettings, shard_count: usize) -> Self {
        Self {
            anti_starvation_enabled: persisted.enabled,
            max_wait: Duration::from_secs(persisted.max_wait_sec),
            worker_count: persisted.workers,
            batch_size: persisted.batch,
            processing_timeout: Duration::from_secs(persisted.timeout_sec),
            shard_count,
        }
    }
}

/// Live view of the queue settings, shared by the dispatcher, the
/// anti-starvation daemon, and the command engine.
pub struct ConfigStore {
    backend: Arc<dyn QueueBackend>,
    cached: RwLock<QueueSettings>,
}

impl ConfigStore {
    /// Creates a store seeded with `initial`; the persisted document, if
    /// any, takes precedence after the first [`ConfigStore::load`].
    pub fn new(backend: Arc<dyn QueueBackend>, initial: QueueSettings) -> Self {
        Self {
            backend,
            cached: RwLock::new(initial),
        }
    }

    /// Returns the current settings (cached copy).
    pub async fn current(&self) -> QueueSettings {
        self.cached.read().await.clone()
    }

    /// Refreshes the cache from the persisted document and returns the
    /// result. When nothing is persisted yet, the cached settings stand.
    pub async fn load(&self) -> Result<QueueSettings, ConfigError> {
        let raw = self.backend.get(CONFIG_KEY).await?;
        match raw {
            Some(raw) => {
                let persisted: PersistedSettings = serde_json::from_str(&raw)?;
                let shard_count = self.cached.read().await.shard_count;
                let settings = QueueSettings::from_persisted(persisted, shard_count);
                settings.validate()?;
                *self.cached.write().await = settings.clone();
                Ok(settings)
            }
            None => Ok(self.current().await),
        }
    }

    /// Validates, persists, and caches new settings. `shard_count` changes
    /// are ignored; it is fixed at process start.
    pub async fn update(&self, settings: QueueSettings) -> Result<(), ConfigError> {
        let mut settings = settings;
        settings.shard_count = self.cached.read().await.shard_count;
        settings.validate()?;

        let raw = serde_json::to_string(&settings.to_persisted())?;
        self.backend.set(CONFIG_KEY, &raw).await?;
        *self.cached.write().await = settings.clone();
        info!(
            anti_starvation = settings.anti_starvation_enabled,
            max_wait_secs = settings.max_wait.as_secs(),
            workers = settings.worker_count,
            batch = settings.batch_size,
            "Queue settings updated"
        );
        Ok(())
    }

    /// Point update: toggles the anti-starvation daemon.
    pub async fn set_anti_starvation(&self, enabled: bool) -> Result<QueueSettings, ConfigError> {
        let settings = self.current().await.with_anti_starvation(enabled);
        self.update(settings.clone()).await?;
        Ok(settings)
    }

    /// Point update: sets the starvation threshold.
    pub async fn set_max_wait(&self, max_wait: Duration) -> Result<QueueSettings, ConfigError> {
        let settings = self.current().await.with_max_wait(max_wait);
        self.update(settings.clone()).await?;
        Ok(settings)
    }
}

/// Process-boundary configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL connection URL for the item store.
    pub database_url: String,
    /// Redis connection URL for the queue backend.
    pub redis_url: String,
    /// API key for the remote command parser; the mock parser is used when
    /// absent.
    pub parser_api_key: Option<String>,
    /// Endpoint for the remote command parser.
    pub parser_endpoint: Option<String>,
    /// Initial queue settings.
    pub queue: QueueSettings,
}

impl AppConfig {
    /// Reads configuration from the environment.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL (required)
    /// - `REDIS_URL`: Redis connection URL (required)
    /// - `PARSER_API_KEY`, `PARSER_ENDPOINT`: remote parser credentials
    /// - `ADQUEUE_ANTI_STARVATION`: enable the elevation daemon (default: true)
    /// - `ADQUEUE_MAX_WAIT_SECS`: starvation threshold (default: 300)
    /// - `ADQUEUE_WORKER_COUNT`: worker tasks (default: 4)
    /// - `ADQUEUE_BATCH_SIZE`: dequeue batch size (default: 10)
    /// - `ADQUEUE_PROCESSING_TIMEOUT_SECS`: per-item deadline (default: 30)
    /// - `ADQUEUE_SHARD_COUNT`: queue shards, fixed at start (default: 4)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or any value
    /// fails to parse or validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;
        let redis_url = std::env::var("REDIS_URL")
            .map_err(|_| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?;

        let mut queue = QueueSettings::default();

        if let Ok(val) = std::env::var("ADQUEUE_ANTI_STARVATION") {
            queue.anti_starvation_enabled = parse_env_bool(&val, "ADQUEUE_ANTI_STARVATION")?;
        }
        if let Ok(val) = std::env::var("ADQUEUE_MAX_WAIT_SECS") {
            let secs: u64 = parse_env_value(&val, "ADQUEUE_MAX_WAIT_SECS")?;
            queue.max_wait = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("ADQUEUE_WORKER_COUNT") {
            queue.worker_count = parse_env_value(&val, "ADQUEUE_WORKER_COUNT")?;
        }
        if let Ok(val) = std::env::var("ADQUEUE_BATCH_SIZE") {
            queue.batch_size = parse_env_value(&val, "ADQUEUE_BATCH_SIZE")?;
        }
        if let Ok(val) = std::env::var("ADQUEUE_PROCESSING_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "ADQUEUE_PROCESSING_TIMEOUT_SECS")?;
            queue.processing_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("ADQUEUE_SHARD_COUNT") {
            queue.shard_count = parse_env_value(&val, "ADQUEUE_SHARD_COUNT")?;
        }

        queue.validate()?;

        Ok(Self {
            database_url,
            redis_url,
            parser_api_key: std::env::var("PARSER_API_KEY").ok(),
            parser_endpoint: std::env::var("PARSER_ENDPOINT").ok(),
            queue,
        })
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

//! Backend selection.
//!
//! Controlled via the `[cache]` table of `murmur.toml`:
//!
//! ```toml
//! [cache]
//! url = "redis://127.0.0.1:6379/0"   # omit for the in-process backend
//! key_prefix = "murmur"
//! operation_timeout_ms = 2000
//! sweep_interval_seconds = 60
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::backend::{CacheBackend, CacheError};
use super::keys::KeyNamespace;
use super::memory::MemoryBackend;
use super::redis_backend::RedisBackend;

pub(crate) const DEFAULT_KEY_PREFIX: &str = "murmur";
pub(crate) const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 2000;
pub(crate) const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Redis URL; `None` selects the in-process backend.
    pub url: Option<String>,
    /// Deployment prefix rendered in front of every key.
    pub key_prefix: String,
    /// Upper bound for a single backend round trip.
    pub operation_timeout: Duration,
    /// How often the in-process backend drops expired keys.
    pub sweep_interval: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl From<&crate::config::CacheSettings> for BackendConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            url: settings.url.clone(),
            key_prefix: settings.key_prefix.clone(),
            operation_timeout: settings.operation_timeout,
            sweep_interval: settings.sweep_interval,
        }
    }
}

impl BackendConfig {
    pub fn key_namespace(&self) -> KeyNamespace {
        KeyNamespace::new(&self.key_prefix)
    }
}

/// The backend handle every component shares for the life of the process.
#[derive(Clone)]
pub enum ConnectedBackend {
    Memory(Arc<MemoryBackend>),
    Redis(Arc<RedisBackend>),
}

impl ConnectedBackend {
    /// Open the backend described by `config`.
    pub async fn connect(config: &BackendConfig) -> Result<Self, CacheError> {
        match config.url.as_deref() {
            Some(url) => {
                let backend = RedisBackend::connect(url, config.operation_timeout).await?;
                Ok(Self::Redis(Arc::new(backend)))
            }
            None => {
                info!(
                    target = "murmur::cache",
                    "No cache url configured; using in-process backend"
                );
                Ok(Self::Memory(Arc::new(MemoryBackend::new())))
            }
        }
    }

    pub fn shared(&self) -> Arc<dyn CacheBackend> {
        match self {
            Self::Memory(backend) => backend.clone(),
            Self::Redis(backend) => backend.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Redis(_) => "redis",
        }
    }
}

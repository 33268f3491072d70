//! Murmur shared state cache.
//!
//! A thin contract over a shared key-value store plus the key namespace that
//! every higher layer renders its keys through:
//!
//! - [`CacheBackend`]: scalar, hash, set and counter primitives
//! - [`MemoryBackend`]: in-process store for single-node setups and tests
//! - [`RedisBackend`]: shared store for multi-process deployments
//! - [`KeyNamespace`]: collision-free key rendering per deployment

mod backend;
mod config;
mod keys;
mod memory;
mod redis_backend;

pub use backend::{CacheBackend, CacheError};
pub use config::{BackendConfig, ConnectedBackend};
pub(crate) use config::{
    DEFAULT_KEY_PREFIX, DEFAULT_OPERATION_TIMEOUT_MS, DEFAULT_SWEEP_INTERVAL_SECS,
};
pub use keys::{KeyKind, KeyNamespace};
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

//! Storage contract shared by every cache backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The shared store could not be reached or did not answer in time.
    ///
    /// Transient. Never equivalent to "absent" or "already seen".
    #[error("cache unavailable: {message}")]
    Unavailable { message: String },
    #[error("cache key `{key}` holds a value of a different type")]
    WrongType { key: String },
    #[error("cache key `{key}` does not hold an integer")]
    NotAnInteger { key: String },
    #[error("cache rejected command: {message}")]
    Rejected { message: String },
}

impl CacheError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn wrong_type(key: impl Into<String>) -> Self {
        Self::WrongType { key: key.into() }
    }

    pub fn not_an_integer(key: impl Into<String>) -> Self {
        Self::NotAnInteger { key: key.into() }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, CacheError::Unavailable { .. })
    }
}

/// Shared key-value store with scalar, hash, set and counter primitives.
///
/// Every method is a single round trip. `increment` and `add_to_set` are atomic
/// against concurrent callers on the same key.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Read a scalar value.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Write a scalar value, replacing whatever the key held.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Write one field of the hash at `key`, creating the hash if needed.
    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError>;

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, CacheError>;

    /// All fields of the hash at `key`; empty when the key is absent.
    async fn get_all_fields(&self, key: &str) -> Result<HashMap<String, String>, CacheError>;

    async fn delete_field(&self, key: &str, field: &str) -> Result<(), CacheError>;

    async fn delete_key(&self, key: &str) -> Result<(), CacheError>;

    /// Increment the integer at `key`; an absent key counts from zero.
    async fn increment(&self, key: &str) -> Result<i64, CacheError>;

    /// Insert `member` into the set at `key`; `true` only when it was not present.
    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    /// Attach `ttl` to `key` unless it already expires; `false` when absent or already timed.
    async fn expire_if_unset(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

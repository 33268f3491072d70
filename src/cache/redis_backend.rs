//! Redis-backed implementation shared by every process of one deployment.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError, RedisResult};
use tracing::{info, warn};

use super::backend::{CacheBackend, CacheError};

const SOURCE: &str = "murmur::cache::redis";

/// Cache backend talking to Redis through one multiplexed, auto-reconnecting handle.
///
/// Every command is bounded by `operation_timeout`; an elapsed timeout is
/// reported as [`CacheError::Unavailable`].
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    operation_timeout: Duration,
}

impl RedisBackend {
    pub async fn connect(url: &str, operation_timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|err| CacheError::rejected(format!("invalid redis url: {err}")))?;

        let connection = match tokio::time::timeout(
            operation_timeout,
            ConnectionManager::new(client),
        )
        .await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(err)) => return Err(classify(err, "connect")),
            Err(_) => {
                return Err(CacheError::unavailable(format!(
                    "connect timed out after {}ms",
                    operation_timeout.as_millis()
                )));
            }
        };

        info!(
            target = SOURCE,
            timeout_ms = operation_timeout.as_millis() as u64,
            "Connected to redis"
        );

        Ok(Self {
            connection,
            operation_timeout,
        })
    }

    async fn guarded<T, F>(&self, command: &'static str, key: &str, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                let error = classify(err, key);
                if error.is_unavailable() {
                    warn!(
                        target = SOURCE,
                        command,
                        key,
                        error = %error,
                        "Redis command failed"
                    );
                }
                Err(error)
            }
            Err(_) => {
                warn!(
                    target = SOURCE,
                    command,
                    key,
                    timeout_ms = self.operation_timeout.as_millis() as u64,
                    "Redis command timed out"
                );
                Err(CacheError::unavailable(format!(
                    "{command} on `{key}` timed out after {}ms",
                    self.operation_timeout.as_millis()
                )))
            }
        }
    }
}

fn classify(err: RedisError, key: &str) -> CacheError {
    if err.code() == Some("WRONGTYPE") {
        return CacheError::wrong_type(key);
    }
    // BUSY/LOADING, TRYAGAIN and CLUSTERDOWN clear up on their own.
    let transient = matches!(
        err.kind(),
        ErrorKind::BusyLoadingError | ErrorKind::TryAgain | ErrorKind::ClusterDown
    );
    if transient
        || err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        return CacheError::unavailable(err.to_string());
    }
    let message = err.to_string();
    if message.contains("not an integer") {
        return CacheError::not_an_integer(key);
    }
    CacheError::rejected(message)
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection.clone();
        self.guarded("GET", key, conn.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        match ttl {
            Some(ttl) => {
                self.guarded("SETEX", key, conn.set_ex(key, value, ttl.as_secs().max(1)))
                    .await
            }
            None => self.guarded("SET", key, conn.set(key, value)).await,
        }
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: i64 = self
            .guarded("HSET", key, conn.hset(key, field, value))
            .await?;
        Ok(())
    }

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection.clone();
        self.guarded("HGET", key, conn.hget(key, field)).await
    }

    async fn get_all_fields(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let mut conn = self.connection.clone();
        self.guarded("HGETALL", key, conn.hgetall(key)).await
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: i64 = self.guarded("HDEL", key, conn.hdel(key, field)).await?;
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: i64 = self.guarded("DEL", key, conn.del(key)).await?;
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.connection.clone();
        self.guarded("INCR", key, conn.incr(key, 1_i64)).await
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let added: i64 = self.guarded("SADD", key, conn.sadd(key, member)).await?;
        Ok(added > 0)
    }

    async fn expire_if_unset(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let seconds = ttl.as_secs().max(1);
        let mut command = redis::cmd("EXPIRE");
        command.arg(key).arg(seconds).arg("NX");
        let applied: i64 = self
            .guarded("EXPIRE", key, command.query_async(&mut conn))
            .await?;
        Ok(applied == 1)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let command = redis::cmd("PING");
        let _: String = self
            .guarded("PING", "", command.query_async(&mut conn))
            .await?;
        Ok(())
    }
}

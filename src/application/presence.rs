//! Presence metadata for live real-time connections.
//!
//! One hash per deployment; one field per connection id; the field value is
//! the connection's whole metadata object serialized as JSON.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{CacheBackend, CacheError, KeyNamespace};
use crate::domain::types::ConnectionMetadata;

const SOURCE: &str = "murmur::presence";

pub struct PresenceStore {
    backend: Arc<dyn CacheBackend>,
    key: String,
}

impl PresenceStore {
    /// Build the store and discard presence left over from a previous process.
    ///
    /// Connection ids are not unique across restarts and no connection survives
    /// one, so the reset runs unconditionally before the store is handed out.
    pub async fn start(
        backend: Arc<dyn CacheBackend>,
        keys: &KeyNamespace,
    ) -> Result<Self, CacheError> {
        let key = keys.presence();
        backend.delete_key(&key).await?;
        info!(target = SOURCE, key = %key, "Presence reset on startup");
        Ok(Self { backend, key })
    }

    /// Shallow-merge `partial` into the connection's metadata and store the result.
    ///
    /// Read-merge-write, not atomic: two racing updates for the same connection
    /// keep whichever write lands last, and fields only the earlier one added
    /// may be lost. Presence is advisory, so this is accepted.
    pub async fn set_metadata(
        &self,
        connection_id: &str,
        partial: ConnectionMetadata,
    ) -> Result<ConnectionMetadata, CacheError> {
        let mut merged = self.get_metadata(connection_id).await?;
        merged.extend(partial);

        let serialized = Value::Object(merged.clone()).to_string();
        self.backend
            .set_field(&self.key, connection_id, &serialized)
            .await?;

        debug!(
            target = SOURCE,
            connection_id,
            fields = merged.len(),
            "Presence metadata updated"
        );
        Ok(merged)
    }

    /// Stored metadata, or an empty mapping when none (or nothing readable) is stored.
    pub async fn get_metadata(&self, connection_id: &str) -> Result<ConnectionMetadata, CacheError> {
        let raw = self.backend.get_field(&self.key, connection_id).await?;
        Ok(raw
            .map(|raw| parse_metadata(connection_id, &raw))
            .unwrap_or_default())
    }

    pub async fn clear_metadata(&self, connection_id: &str) -> Result<(), CacheError> {
        self.backend.delete_field(&self.key, connection_id).await?;
        debug!(target = SOURCE, connection_id, "Presence metadata cleared");
        Ok(())
    }

    /// Number of connections with recorded metadata.
    pub async fn online_count(&self) -> Result<usize, CacheError> {
        Ok(self.backend.get_all_fields(&self.key).await?.len())
    }
}

fn parse_metadata(connection_id: &str, raw: &str) -> ConnectionMetadata {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            warn!(
                target = SOURCE,
                connection_id,
                found = json_type(&other),
                "Stored presence metadata is not an object; treating as empty"
            );
            ConnectionMetadata::new()
        }
        Err(err) => {
            warn!(
                target = SOURCE,
                connection_id,
                error = %err,
                "Stored presence metadata is malformed; treating as empty"
            );
            ConnectionMetadata::new()
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

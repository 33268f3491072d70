//! Realtime gateway.
//!
//! Each WebSocket connection gets a fresh connection id and a presence entry
//! seeded with the visitor address and connect time. Text frames carrying a
//! JSON object are merged into that entry; the entry is cleared when the
//! socket closes.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use metrics::gauge;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::presence::PresenceStore;
use crate::cache::CacheError;
use crate::domain::types::{ConnectionMetadata, VisitorId};

use super::{HttpState, visitor::VisitorIdentity};

const SOURCE: &str = "murmur::realtime";

pub const METRIC_REALTIME_CONNECTIONS: &str = "murmur_realtime_connections";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame must be a JSON object")]
    NotAnObject,
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    Welcome {
        connection_id: &'a str,
        online: usize,
    },
    Metadata {
        metadata: &'a ConnectionMetadata,
    },
    Error {
        message: String,
    },
}

/// Presence bookkeeping for one live connection.
pub struct RealtimeSession {
    presence: Arc<PresenceStore>,
    connection_id: String,
}

impl RealtimeSession {
    /// Register a new connection and record who opened it.
    pub async fn open(presence: Arc<PresenceStore>, visitor: &VisitorId) -> Result<Self, CacheError> {
        let connection_id = Uuid::new_v4().to_string();

        let mut seed = ConnectionMetadata::new();
        seed.insert("ip".to_string(), Value::String(visitor.as_str().to_string()));
        if let Ok(connected_at) = OffsetDateTime::now_utc().format(&Rfc3339) {
            seed.insert("connected_at".to_string(), Value::String(connected_at));
        }
        presence.set_metadata(&connection_id, seed).await?;

        Ok(Self {
            presence,
            connection_id,
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Merge one client frame into this connection's metadata.
    pub async fn apply_frame(&self, text: &str) -> Result<ConnectionMetadata, FrameError> {
        let partial = match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => map,
            _ => return Err(FrameError::NotAnObject),
        };
        Ok(self
            .presence
            .set_metadata(&self.connection_id, partial)
            .await?)
    }

    pub async fn close(self) -> Result<(), CacheError> {
        self.presence.clear_metadata(&self.connection_id).await
    }
}

pub(super) async fn realtime(
    ws: WebSocketUpgrade,
    State(state): State<HttpState>,
    VisitorIdentity(visitor): VisitorIdentity,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.presence, visitor))
}

async fn handle_socket(mut socket: WebSocket, presence: Arc<PresenceStore>, visitor: VisitorId) {
    let session = match RealtimeSession::open(presence.clone(), &visitor).await {
        Ok(session) => session,
        Err(err) => {
            warn!(target = SOURCE, visitor = %visitor, error = %err, "Presence unavailable; refusing connection");
            let _ = send_frame(
                &mut socket,
                &ServerFrame::Error {
                    message: "presence unavailable".to_string(),
                },
            )
            .await;
            return;
        }
    };

    gauge!(METRIC_REALTIME_CONNECTIONS).increment(1.0);
    info!(
        target = SOURCE,
        connection_id = session.connection_id(),
        visitor = %visitor,
        "Realtime connection opened"
    );

    let online = presence.online_count().await.unwrap_or_default();
    let welcome = ServerFrame::Welcome {
        connection_id: session.connection_id(),
        online,
    };

    if send_frame(&mut socket, &welcome).await.is_ok() {
        while let Some(message) = socket.recv().await {
            match message {
                Ok(Message::Text(text)) => {
                    let reply = match session.apply_frame(text.as_str()).await {
                        Ok(merged) => send_frame(
                            &mut socket,
                            &ServerFrame::Metadata { metadata: &merged },
                        )
                        .await,
                        Err(err) => {
                            debug!(
                                target = SOURCE,
                                connection_id = session.connection_id(),
                                error = %err,
                                "Client frame not applied"
                            );
                            send_frame(
                                &mut socket,
                                &ServerFrame::Error {
                                    message: err.to_string(),
                                },
                            )
                            .await
                        }
                    };
                    if reply.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(
                        target = SOURCE,
                        connection_id = session.connection_id(),
                        error = %err,
                        "WebSocket receive error"
                    );
                    break;
                }
            }
        }
    }

    let connection_id = session.connection_id().to_string();
    if let Err(err) = session.close().await {
        warn!(
            target = SOURCE,
            connection_id = %connection_id,
            error = %err,
            "Presence entry could not be cleared"
        );
    }
    gauge!(METRIC_REALTIME_CONNECTIONS).decrement(1.0);
    info!(target = SOURCE, connection_id = %connection_id, "Realtime connection closed");
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame<'_>) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).map_err(axum::Error::new)?;
    socket.send(Message::Text(json.into())).await
}

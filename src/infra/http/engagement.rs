use std::str::FromStr;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;

use crate::domain::types::{EngagementAction, ResourceId, ResourceKind};

use super::{HttpState, error::ApiError, visitor::VisitorIdentity};

#[derive(Debug, Serialize)]
pub struct ReadRecorded {
    pub counted: bool,
    pub reads: u64,
}

#[derive(Debug, Serialize)]
pub struct EngagementSummary {
    pub likes: u64,
    pub reads: u64,
}

fn parse_resource(kind: &str, id: &str) -> Result<(ResourceKind, ResourceId), ApiError> {
    let kind = ResourceKind::from_str(kind)
        .map_err(|err| ApiError::not_found("Unknown resource kind", Some(err.to_string())))?;
    let id = ResourceId::parse(id)?;
    Ok((kind, id))
}

/// `204` when the like counts, `400 duplicate` when this visitor already liked.
pub(super) async fn like(
    State(state): State<HttpState>,
    Path((kind, id)): Path<(String, String)>,
    VisitorIdentity(visitor): VisitorIdentity,
) -> Result<StatusCode, ApiError> {
    let (kind, id) = parse_resource(&kind, &id)?;

    let accepted = state
        .engagement
        .record_action(EngagementAction::Like, kind, &id, &visitor)
        .await?;

    if accepted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::duplicate("Already liked"))
    }
}

pub(super) async fn read(
    State(state): State<HttpState>,
    Path((kind, id)): Path<(String, String)>,
    VisitorIdentity(visitor): VisitorIdentity,
) -> Result<Json<ReadRecorded>, ApiError> {
    let (kind, id) = parse_resource(&kind, &id)?;

    let counted = state
        .engagement
        .record_action(EngagementAction::Read, kind, &id, &visitor)
        .await?;
    let reads = state
        .engagement
        .count(EngagementAction::Read, kind, &id)
        .await?;

    Ok(Json(ReadRecorded { counted, reads }))
}

pub(super) async fn summary(
    State(state): State<HttpState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<EngagementSummary>, ApiError> {
    let (kind, id) = parse_resource(&kind, &id)?;

    let likes = state
        .engagement
        .count(EngagementAction::Like, kind, &id)
        .await?;
    let reads = state
        .engagement
        .count(EngagementAction::Read, kind, &id)
        .await?;

    Ok(Json(EngagementSummary { likes, reads }))
}

//! Visitor identity for engagement deduplication.
//!
//! Resolved from the first `X-Forwarded-For` entry, then `X-Real-IP`, then the
//! peer address of the connection.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::{HeaderMap, request::Parts};

use crate::domain::types::VisitorId;

use super::error::ApiError;

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

#[derive(Debug, Clone)]
pub struct VisitorIdentity(pub VisitorId);

impl<S> FromRequestParts<S> for VisitorIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        let ip = resolve_client_ip(&parts.headers, peer).ok_or_else(|| {
            ApiError::bad_request(
                "Visitor identity unavailable",
                Some("no forwarding header and no peer address".to_string()),
            )
        })?;

        Ok(Self(VisitorId::parse(ip.to_string())?))
    }
}

fn resolve_client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
    if let Some(first) = headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        && let Ok(ip) = first.trim().parse()
    {
        return Some(ip);
    }

    if let Some(ip) = headers
        .get(REAL_IP)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
    {
        return Some(ip);
    }

    peer
}

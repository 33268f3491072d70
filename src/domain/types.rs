//! Identifiers and enumerations shared by the presence and engagement layers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

const MAX_RESOURCE_ID_LEN: usize = 128;
const MAX_VISITOR_ID_LEN: usize = 256;

/// Metadata attached to one live real-time connection.
pub type ConnectionMetadata = serde_json::Map<String, serde_json::Value>;

/// Content kinds that visitors can engage with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Post,
    Note,
    Page,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Post => "post",
            ResourceKind::Note => "note",
            ResourceKind::Page => "page",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "post" | "posts" => Ok(ResourceKind::Post),
            "note" | "notes" => Ok(ResourceKind::Note),
            "page" | "pages" => Ok(ResourceKind::Page),
            other => Err(DomainError::validation(
                "resource_kind",
                format!("unknown resource kind `{other}`"),
            )),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engagement actions counted at most once per visitor per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementAction {
    Like,
    Read,
}

impl EngagementAction {
    pub fn as_str(self) -> &'static str {
        match self {
            EngagementAction::Like => "like",
            EngagementAction::Read => "read",
        }
    }
}

impl fmt::Display for EngagementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a content resource as supplied by the routed request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn parse(value: impl AsRef<str>) -> Result<Self, DomainError> {
        let trimmed = value.as_ref().trim();
        validate_identifier("resource_id", trimmed, MAX_RESOURCE_ID_LEN)?;
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller identity used for engagement deduplication.
///
/// Usually the caller's network address, but any stable per-visitor string works.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VisitorId(String);

impl VisitorId {
    pub fn parse(value: impl AsRef<str>) -> Result<Self, DomainError> {
        let trimmed = value.as_ref().trim();
        validate_identifier("visitor_id", trimmed, MAX_VISITOR_ID_LEN)?;
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VisitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_identifier(field: &'static str, value: &str, max_len: usize) -> Result<(), DomainError> {
    if value.is_empty() {
        return Err(DomainError::validation(field, "must not be empty"));
    }
    if value.chars().count() > max_len {
        return Err(DomainError::validation(
            field,
            format!("must be at most {max_len} characters"),
        ));
    }
    if value.chars().any(char::is_control) {
        return Err(DomainError::validation(
            field,
            "must not contain control characters",
        ));
    }
    Ok(())
}

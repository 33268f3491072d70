//! Cache key namespace.
//!
//! Renders `(deployment, kind, parts…)` tuples into literal cache keys. Each
//! segment is escaped (`\` → `\\`, `:` → `\:`) so an unescaped `:` only ever
//! separates segments and two distinct tuples never share a key string.

use crate::domain::types::{EngagementAction, ResourceId, ResourceKind};

const SEPARATOR: char = ':';
const ESCAPE: char = '\\';

/// Resource kinds that own a region of the key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Hash of live connection id → serialized metadata.
    Presence,
    /// Set of visitor ids that already acted on one resource.
    EngagementDedup,
    /// Integer count of accepted actions on one resource.
    EngagementCount,
}

impl KeyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyKind::Presence => "presence",
            KeyKind::EngagementDedup => "engagement-dedup",
            KeyKind::EngagementCount => "engagement-count",
        }
    }
}

/// Key renderer scoped to one deployment prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    pub fn new(deployment_prefix: impl AsRef<str>) -> Self {
        let mut prefix = String::new();
        push_escaped(&mut prefix, deployment_prefix.as_ref());
        Self { prefix }
    }

    pub fn render(&self, kind: KeyKind, parts: &[&str]) -> String {
        let capacity = self.prefix.len()
            + kind.as_str().len()
            + parts.iter().map(|part| part.len() + 2).sum::<usize>()
            + 1;
        let mut key = String::with_capacity(capacity);
        key.push_str(&self.prefix);
        key.push(SEPARATOR);
        key.push_str(kind.as_str());
        for part in parts {
            key.push(SEPARATOR);
            push_escaped(&mut key, part);
        }
        key
    }

    pub fn presence(&self) -> String {
        self.render(KeyKind::Presence, &[])
    }

    pub fn engagement_dedup(
        &self,
        action: EngagementAction,
        kind: ResourceKind,
        id: &ResourceId,
    ) -> String {
        self.render(
            KeyKind::EngagementDedup,
            &[action.as_str(), kind.as_str(), id.as_str()],
        )
    }

    pub fn engagement_count(
        &self,
        action: EngagementAction,
        kind: ResourceKind,
        id: &ResourceId,
    ) -> String {
        self.render(
            KeyKind::EngagementCount,
            &[action.as_str(), kind.as_str(), id.as_str()],
        )
    }
}

fn push_escaped(out: &mut String, segment: &str) {
    for ch in segment.chars() {
        if ch == SEPARATOR || ch == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(ch);
    }
}

#[cfg(test)]
fn split_segments(key: &str) -> Vec<String> {
    let mut segments = vec![String::new()];
    let mut chars = key.chars();
    while let Some(ch) = chars.next() {
        match ch {
            ESCAPE => {
                if let Some(next) = chars.next() {
                    segments.last_mut().expect("segment").push(next);
                }
            }
            SEPARATOR => segments.push(String::new()),
            other => segments.last_mut().expect("segment").push(other),
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn renders_stable_key_surface() {
        let keys = KeyNamespace::new("murmur");
        let id = ResourceId::parse("post-42").expect("valid id");

        assert_eq!(keys.presence(), "murmur:presence");
        assert_eq!(
            keys.engagement_dedup(EngagementAction::Like, ResourceKind::Post, &id),
            "murmur:engagement-dedup:like:post:post-42"
        );
        assert_eq!(
            keys.engagement_count(EngagementAction::Read, ResourceKind::Note, &id),
            "murmur:engagement-count:read:note:post-42"
        );
    }

    #[test]
    fn delimiters_inside_parts_are_escaped() {
        let keys = KeyNamespace::new("murmur");

        let joined = keys.render(KeyKind::EngagementDedup, &["a:b"]);
        let split = keys.render(KeyKind::EngagementDedup, &["a", "b"]);

        assert_eq!(joined, r"murmur:engagement-dedup:a\:b");
        assert_eq!(split, "murmur:engagement-dedup:a:b");
        assert_ne!(joined, split);
    }

    #[test]
    fn deployments_do_not_collide() {
        let first = KeyNamespace::new("blog:a");
        let second = KeyNamespace::new("blog");

        assert_ne!(
            first.render(KeyKind::Presence, &[]),
            second.render(KeyKind::Presence, &["a"])
        );
    }

    #[test]
    fn kinds_do_not_collide() {
        let keys = KeyNamespace::new("murmur");
        let parts = ["like", "post", "1"];
        assert_ne!(
            keys.render(KeyKind::EngagementDedup, &parts),
            keys.render(KeyKind::EngagementCount, &parts)
        );
    }

    fn segment() -> impl Strategy<Value = String> {
        proptest::string::string_regex(r"[a-c:\\]{0,4}").expect("valid regex")
    }

    proptest! {
        #[test]
        fn rendering_round_trips_through_segments(
            prefix in segment(),
            parts in proptest::collection::vec(segment(), 0..4),
        ) {
            let keys = KeyNamespace::new(&prefix);
            let borrowed: Vec<&str> = parts.iter().map(String::as_str).collect();
            let rendered = keys.render(KeyKind::EngagementDedup, &borrowed);

            let mut expected = vec![prefix.clone(), KeyKind::EngagementDedup.as_str().to_string()];
            expected.extend(parts.iter().cloned());
            prop_assert_eq!(split_segments(&rendered), expected);
        }

        #[test]
        fn distinct_tuples_render_distinct_keys(
            left in proptest::collection::vec(segment(), 0..3),
            right in proptest::collection::vec(segment(), 0..3),
        ) {
            let keys = KeyNamespace::new("murmur");
            let left_ref: Vec<&str> = left.iter().map(String::as_str).collect();
            let right_ref: Vec<&str> = right.iter().map(String::as_str).collect();

            let same_key = keys.render(KeyKind::EngagementCount, &left_ref)
                == keys.render(KeyKind::EngagementCount, &right_ref);
            prop_assert_eq!(same_key, left == right);
        }
    }
}

//! Deduplicated visitor engagement (likes, reads).
//!
//! Per `(action, resource)` the cache holds a set of visitor ids seen in the
//! current window and a counter of accepted actions. The set is the only
//! dedup authority; the counter is display data.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, warn};

use crate::cache::{CacheBackend, CacheError, KeyNamespace};
use crate::domain::types::{EngagementAction, ResourceId, ResourceKind, VisitorId};

const SOURCE: &str = "murmur::engagement";

pub const METRIC_ENGAGEMENT_ACCEPTED: &str = "murmur_engagement_accepted_total";
pub const METRIC_ENGAGEMENT_REJECTED: &str = "murmur_engagement_rejected_total";
pub const METRIC_CACHE_UNAVAILABLE: &str = "murmur_cache_unavailable_total";

pub(crate) const DEFAULT_LIKE_WINDOW_SECS: u64 = 24 * 60 * 60;
pub(crate) const DEFAULT_READ_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Dedup window length per action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngagementWindows {
    pub like: Duration,
    pub read: Duration,
}

impl Default for EngagementWindows {
    fn default() -> Self {
        Self {
            like: Duration::from_secs(DEFAULT_LIKE_WINDOW_SECS),
            read: Duration::from_secs(DEFAULT_READ_WINDOW_SECS),
        }
    }
}

impl From<&crate::config::EngagementSettings> for EngagementWindows {
    fn from(settings: &crate::config::EngagementSettings) -> Self {
        Self {
            like: settings.like_window,
            read: settings.read_window,
        }
    }
}

impl EngagementWindows {
    pub fn for_action(&self, action: EngagementAction) -> Duration {
        match action {
            EngagementAction::Like => self.like,
            EngagementAction::Read => self.read,
        }
    }
}

/// Accept-or-reject gate for engagement actions.
pub struct EngagementDeduper {
    backend: Arc<dyn CacheBackend>,
    keys: KeyNamespace,
    windows: EngagementWindows,
}

impl EngagementDeduper {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        keys: KeyNamespace,
        windows: EngagementWindows,
    ) -> Self {
        Self {
            backend,
            keys,
            windows,
        }
    }

    /// Record one action; `Ok(false)` means the visitor already acted in this window.
    ///
    /// Once the visitor is admitted to the set, a failing window expiry or
    /// counter increment is still an error: the action is neither accepted nor
    /// rejected from the caller's point of view. The visitor stays in the set
    /// until the window elapses.
    pub async fn record_action(
        &self,
        action: EngagementAction,
        kind: ResourceKind,
        id: &ResourceId,
        visitor: &VisitorId,
    ) -> Result<bool, CacheError> {
        let result = self.try_record(action, kind, id, visitor).await;

        match &result {
            Ok(true) => {
                counter!(METRIC_ENGAGEMENT_ACCEPTED, "action" => action.as_str()).increment(1);
            }
            Ok(false) => {
                counter!(METRIC_ENGAGEMENT_REJECTED, "action" => action.as_str()).increment(1);
                debug!(
                    target = SOURCE,
                    action = action.as_str(),
                    resource_kind = kind.as_str(),
                    resource_id = %id,
                    visitor = %visitor,
                    "Duplicate engagement rejected"
                );
            }
            Err(err) => {
                if err.is_unavailable() {
                    counter!(METRIC_CACHE_UNAVAILABLE, "action" => action.as_str()).increment(1);
                }
                warn!(
                    target = SOURCE,
                    action = action.as_str(),
                    resource_kind = kind.as_str(),
                    resource_id = %id,
                    error = %err,
                    "Engagement could not be recorded"
                );
            }
        }

        result
    }

    async fn try_record(
        &self,
        action: EngagementAction,
        kind: ResourceKind,
        id: &ResourceId,
        visitor: &VisitorId,
    ) -> Result<bool, CacheError> {
        let dedup_key = self.keys.engagement_dedup(action, kind, id);
        let admitted = self.backend.add_to_set(&dedup_key, visitor.as_str()).await?;

        // The window opens before the counter moves, so a set never outlives a
        // failed increment. Runs on rejections too: a set left without a
        // deadline by an interrupted call gets one on the next attempt.
        self.backend
            .expire_if_unset(&dedup_key, self.windows.for_action(action))
            .await?;

        if !admitted {
            return Ok(false);
        }

        let count_key = self.keys.engagement_count(action, kind, id);
        let total = self.backend.increment(&count_key).await?;

        debug!(
            target = SOURCE,
            action = action.as_str(),
            resource_kind = kind.as_str(),
            resource_id = %id,
            total,
            "Engagement accepted"
        );
        Ok(true)
    }

    /// Accepted actions recorded for the resource; 0 when never counted.
    pub async fn count(
        &self,
        action: EngagementAction,
        kind: ResourceKind,
        id: &ResourceId,
    ) -> Result<u64, CacheError> {
        let count_key = self.keys.engagement_count(action, kind, id);
        match self.backend.get(&count_key).await? {
            None => Ok(0),
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| CacheError::not_an_integer(count_key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::cache::MemoryBackend;

    fn deduper(backend: Arc<dyn CacheBackend>) -> EngagementDeduper {
        EngagementDeduper::new(
            backend,
            KeyNamespace::new("test"),
            EngagementWindows::default(),
        )
    }

    fn post(id: &str) -> ResourceId {
        ResourceId::parse(id).expect("valid resource id")
    }

    fn visitor(id: &str) -> VisitorId {
        VisitorId::parse(id).expect("valid visitor id")
    }

    #[tokio::test]
    async fn repeated_like_is_rejected_and_not_counted() {
        let engagement = deduper(Arc::new(MemoryBackend::new()));
        let id = post("post-42");
        let ip = visitor("203.0.113.5");

        let first = engagement
            .record_action(EngagementAction::Like, ResourceKind::Post, &id, &ip)
            .await
            .unwrap();
        assert!(first);
        assert_eq!(
            engagement
                .count(EngagementAction::Like, ResourceKind::Post, &id)
                .await
                .unwrap(),
            1
        );

        let second = engagement
            .record_action(EngagementAction::Like, ResourceKind::Post, &id, &ip)
            .await
            .unwrap();
        assert!(!second);
        assert_eq!(
            engagement
                .count(EngagementAction::Like, ResourceKind::Post, &id)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn distinct_visitors_are_each_counted_once() {
        let engagement = deduper(Arc::new(MemoryBackend::new()));
        let id = post("post-7");

        let mut accepted = 0;
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.1", "10.0.0.3", "10.0.0.2"] {
            if engagement
                .record_action(EngagementAction::Like, ResourceKind::Post, &id, &visitor(ip))
                .await
                .unwrap()
            {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 3);
        assert_eq!(
            engagement
                .count(EngagementAction::Like, ResourceKind::Post, &id)
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn actions_and_resources_are_independent() {
        let engagement = deduper(Arc::new(MemoryBackend::new()));
        let ip = visitor("203.0.113.5");

        for (action, kind, id) in [
            (EngagementAction::Like, ResourceKind::Post, "1"),
            (EngagementAction::Read, ResourceKind::Post, "1"),
            (EngagementAction::Like, ResourceKind::Note, "1"),
            (EngagementAction::Like, ResourceKind::Post, "2"),
        ] {
            assert!(
                engagement
                    .record_action(action, kind, &post(id), &ip)
                    .await
                    .unwrap()
            );
        }
    }

    #[tokio::test]
    async fn unknown_resource_counts_zero() {
        let engagement = deduper(Arc::new(MemoryBackend::new()));
        assert_eq!(
            engagement
                .count(EngagementAction::Read, ResourceKind::Page, &post("about"))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn visitor_may_act_again_after_the_window() {
        let backend = Arc::new(MemoryBackend::new());
        let engagement = EngagementDeduper::new(
            backend,
            KeyNamespace::new("test"),
            EngagementWindows {
                like: Duration::from_secs(60),
                read: Duration::from_secs(60),
            },
        );
        let id = post("post-42");
        let ip = visitor("203.0.113.5");

        assert!(
            engagement
                .record_action(EngagementAction::Like, ResourceKind::Post, &id, &ip)
                .await
                .unwrap()
        );
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(
            !engagement
                .record_action(EngagementAction::Like, ResourceKind::Post, &id, &ip)
                .await
                .unwrap()
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(
            engagement
                .record_action(EngagementAction::Like, ResourceKind::Post, &id, &ip)
                .await
                .unwrap()
        );
        assert_eq!(
            engagement
                .count(EngagementAction::Like, ResourceKind::Post, &id)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_burst_of_distinct_visitors_counts_exactly() {
        const VISITORS: usize = 100;
        let engagement = Arc::new(deduper(Arc::new(MemoryBackend::new())));
        let id = post("burst");

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..VISITORS {
            let engagement = engagement.clone();
            let id = id.clone();
            tasks.spawn(async move {
                engagement
                    .record_action(
                        EngagementAction::Like,
                        ResourceKind::Post,
                        &id,
                        &visitor(&format!("198.51.100.{n}")),
                    )
                    .await
            });
        }

        let mut accepted = 0;
        while let Some(result) = tasks.join_next().await {
            if result.expect("task should not panic").unwrap() {
                accepted += 1;
            }
        }

        assert_eq!(accepted, VISITORS);
        assert_eq!(
            engagement
                .count(EngagementAction::Like, ResourceKind::Post, &id)
                .await
                .unwrap(),
            VISITORS as u64
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_repeats_of_one_visitor_have_one_winner() {
        let engagement = Arc::new(deduper(Arc::new(MemoryBackend::new())));
        let id = post("post-42");

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..50 {
            let engagement = engagement.clone();
            let id = id.clone();
            tasks.spawn(async move {
                engagement
                    .record_action(
                        EngagementAction::Like,
                        ResourceKind::Post,
                        &id,
                        &visitor("203.0.113.5"),
                    )
                    .await
            });
        }

        let mut accepted = 0;
        while let Some(result) = tasks.join_next().await {
            if result.expect("task should not panic").unwrap() {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 1);
        assert_eq!(
            engagement
                .count(EngagementAction::Like, ResourceKind::Post, &id)
                .await
                .unwrap(),
            1
        );
    }

    /// Delegates to a real store; `increment` and `expire_if_unset` report the
    /// store as down for their first `n` calls.
    struct Flaky {
        inner: MemoryBackend,
        increment_failures: AtomicUsize,
        expire_failures: AtomicUsize,
    }

    impl Flaky {
        fn new(increment_failures: usize, expire_failures: usize) -> Self {
            Self {
                inner: MemoryBackend::new(),
                increment_failures: AtomicUsize::new(increment_failures),
                expire_failures: AtomicUsize::new(expire_failures),
            }
        }
    }

    fn take_failure(remaining: &AtomicUsize) -> bool {
        remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl CacheBackend for Flaky {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }

        async fn set(
            &self,
            key: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<(), CacheError> {
            self.inner.set(key, value, ttl).await
        }

        async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError> {
            self.inner.set_field(key, field, value).await
        }

        async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
            self.inner.get_field(key, field).await
        }

        async fn get_all_fields(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
            self.inner.get_all_fields(key).await
        }

        async fn delete_field(&self, key: &str, field: &str) -> Result<(), CacheError> {
            self.inner.delete_field(key, field).await
        }

        async fn delete_key(&self, key: &str) -> Result<(), CacheError> {
            self.inner.delete_key(key).await
        }

        async fn increment(&self, key: &str) -> Result<i64, CacheError> {
            if take_failure(&self.increment_failures) {
                return Err(CacheError::unavailable("connection reset"));
            }
            self.inner.increment(key).await
        }

        async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, CacheError> {
            self.inner.add_to_set(key, member).await
        }

        async fn expire_if_unset(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
            if take_failure(&self.expire_failures) {
                return Err(CacheError::unavailable("connection reset"));
            }
            self.inner.expire_if_unset(key, ttl).await
        }

        async fn ping(&self) -> Result<(), CacheError> {
            self.inner.ping().await
        }
    }

    fn minute_windows(backend: Arc<dyn CacheBackend>) -> EngagementDeduper {
        EngagementDeduper::new(
            backend,
            KeyNamespace::new("test"),
            EngagementWindows {
                like: Duration::from_secs(60),
                read: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test]
    async fn increment_outage_after_admission_fails_the_action() {
        let engagement = deduper(Arc::new(Flaky::new(usize::MAX, 0)));

        let result = engagement
            .record_action(
                EngagementAction::Like,
                ResourceKind::Post,
                &post("post-42"),
                &visitor("203.0.113.5"),
            )
            .await;

        let err = result.expect_err("outage must not look like accepted or duplicate");
        assert!(err.is_unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_increment_does_not_lock_the_visitor_out() {
        let engagement = minute_windows(Arc::new(Flaky::new(1, 0)));
        let id = post("post-42");
        let ip = visitor("203.0.113.5");

        assert!(
            engagement
                .record_action(EngagementAction::Like, ResourceKind::Post, &id, &ip)
                .await
                .is_err()
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(
            engagement
                .record_action(EngagementAction::Like, ResourceKind::Post, &id, &ip)
                .await
                .unwrap()
        );
        assert_eq!(
            engagement
                .count(EngagementAction::Like, ResourceKind::Post, &id)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_outage_fails_the_action_and_is_repaired_on_retry() {
        let engagement = minute_windows(Arc::new(Flaky::new(0, 1)));
        let id = post("post-42");
        let ip = visitor("203.0.113.5");

        let err = engagement
            .record_action(EngagementAction::Like, ResourceKind::Post, &id, &ip)
            .await
            .expect_err("outage must not look like accepted or duplicate");
        assert!(err.is_unavailable());
        assert_eq!(
            engagement
                .count(EngagementAction::Like, ResourceKind::Post, &id)
                .await
                .unwrap(),
            0
        );

        // The visitor was admitted, so the retry is a duplicate that opens the window.
        assert!(
            !engagement
                .record_action(EngagementAction::Like, ResourceKind::Post, &id, &ip)
                .await
                .unwrap()
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(
            engagement
                .record_action(EngagementAction::Like, ResourceKind::Post, &id, &ip)
                .await
                .unwrap()
        );
    }
}

//! Invalidation manager.
//!
//! Removes entries by key, by tag or wholesale, records one analytics event
//! per purged tag and then tells the edge tier. The local purge always stands,
//! whatever the edge answers.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use super::analytics::AnalyticsRecorder;
use super::clock::Clock;
use super::edge::{EdgePurgeError, EdgePurger};
use super::events::{AnalyticsEvent, EventKind};
use super::route;
use super::store::EntryStore;

/// Detail recorded for a full reset.
pub const PURGE_ALL_DETAIL: &str = "*";

/// What happened at the edge after a local purge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum EdgeOutcome {
    /// No edge purger configured.
    Disabled,
    /// Nothing to send: key purges are local only, and empty tag sets are skipped.
    Skipped,
    Purged,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagPurge {
    pub tag: String,
    pub keys: usize,
}

/// Summary of one invalidation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub keys_removed: usize,
    pub tags: Vec<TagPurge>,
    pub edge: EdgeOutcome,
}

pub struct Invalidator {
    store: Arc<EntryStore>,
    analytics: Arc<AnalyticsRecorder>,
    edge: Option<Arc<dyn EdgePurger>>,
    clock: Arc<dyn Clock>,
}

impl Invalidator {
    pub fn new(
        store: Arc<EntryStore>,
        analytics: Arc<AnalyticsRecorder>,
        edge: Option<Arc<dyn EdgePurger>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            analytics,
            edge,
            clock,
        }
    }

    pub fn has_edge(&self) -> bool {
        self.edge.is_some()
    }

    /// Remove a single key.
    pub fn purge_key(&self, key: &str) -> PurgeReport {
        self.purge_keys(&[key.to_owned()])
    }

    /// Remove explicit keys. Records one invalidation event for the batch.
    pub fn purge_keys(&self, keys: &[String]) -> PurgeReport {
        let removed = self.store.purge_keys(keys);
        info!(requested = keys.len(), removed, "purged cache keys");

        let detail = if keys.len() == 1 {
            keys[0].clone()
        } else {
            format!("{} keys", keys.len())
        };
        self.record_invalidation(detail, removed);

        PurgeReport {
            keys_removed: removed,
            tags: Vec::new(),
            edge: self.skipped_or_disabled(),
        }
    }

    /// Remove every key indexed under any of `tags`, then purge the edge.
    #[instrument(skip_all, fields(tags = tags.len()))]
    pub async fn purge_by_tags(&self, tags: &[String]) -> PurgeReport {
        let mut seen = HashSet::new();
        let tags: Vec<String> = tags
            .iter()
            .filter(|tag| seen.insert(tag.as_str()))
            .cloned()
            .collect();

        if tags.is_empty() {
            return PurgeReport {
                keys_removed: 0,
                tags: Vec::new(),
                edge: self.skipped_or_disabled(),
            };
        }

        let (keys_removed, per_tag) = self.store.purge_tags(&tags);

        let tags_report: Vec<TagPurge> = per_tag
            .into_iter()
            .map(|(tag, keys)| {
                self.record_invalidation(tag.clone(), keys);
                TagPurge { tag, keys }
            })
            .collect();

        info!(
            tags = ?tags,
            keys_removed,
            "purged cache entries by tag"
        );

        let edge = match &self.edge {
            Some(edge) => self.notify_edge(edge.purge_tags(&tags).await),
            None => EdgeOutcome::Disabled,
        };

        PurgeReport {
            keys_removed,
            tags: tags_report,
            edge,
        }
    }

    /// Drop every entry. Operator use only.
    #[instrument(skip_all)]
    pub async fn purge_all(&self) -> PurgeReport {
        let removed = self.store.clear();
        warn!(removed, "purged entire cache");
        self.record_invalidation(PURGE_ALL_DETAIL.to_owned(), removed);

        let edge = match &self.edge {
            Some(edge) => self.notify_edge(edge.purge_everything().await),
            None => EdgeOutcome::Disabled,
        };

        PurgeReport {
            keys_removed: removed,
            tags: Vec::new(),
            edge,
        }
    }

    fn skipped_or_disabled(&self) -> EdgeOutcome {
        if self.edge.is_some() {
            EdgeOutcome::Skipped
        } else {
            EdgeOutcome::Disabled
        }
    }

    fn record_invalidation(&self, detail: String, keys: usize) {
        self.analytics.record(
            AnalyticsEvent::new(EventKind::Invalidation, self.clock.now(), route::current())
                .with_detail(detail)
                .with_affected_keys(keys),
        );
    }

    fn notify_edge(&self, result: Result<(), EdgePurgeError>) -> EdgeOutcome {
        match result {
            Ok(()) => EdgeOutcome::Purged,
            Err(err) => {
                warn!(error = %err, "edge purge failed; local purge stands");
                self.analytics.record(
                    AnalyticsEvent::new(EventKind::Error, self.clock.now(), route::current())
                        .with_detail(format!("edge purge failed: {err}")),
                );
                EdgeOutcome::Failed(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::store::EntrySpec;

    #[derive(Default)]
    struct RecordingEdge {
        calls: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl EdgePurger for RecordingEdge {
        async fn purge_tags(&self, tags: &[String]) -> Result<(), EdgePurgeError> {
            self.calls.lock().expect("calls lock").push(tags.to_vec());
            if self.fail {
                Err(EdgePurgeError::Rejected {
                    status: 503,
                    body: "unavailable".to_string(),
                })
            } else {
                Ok(())
            }
        }

        async fn purge_everything(&self) -> Result<(), EdgePurgeError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(vec![PURGE_ALL_DETAIL.to_string()]);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<EntryStore>,
        analytics: Arc<AnalyticsRecorder>,
        invalidator: Invalidator,
    }

    fn fixture(edge: Option<Arc<dyn EdgePurger>>) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let store = Arc::new(EntryStore::new(
            NonZeroUsize::new(16).expect("non-zero"),
            None,
            clock.clone(),
        ));
        let analytics = Arc::new(AnalyticsRecorder::new(
            NonZeroUsize::new(64).expect("non-zero"),
        ));
        let invalidator = Invalidator::new(store.clone(), analytics.clone(), edge, clock);
        Fixture {
            store,
            analytics,
            invalidator,
        }
    }

    fn put(store: &EntryStore, key: &str, tags: &[&str]) {
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        store.set(
            key,
            Bytes::from_static(b"1"),
            EntrySpec {
                ttl: Duration::from_secs(60),
                stale_while_revalidate: None,
                tags: &tags,
            },
        );
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn purge_by_tags_isolates_untouched_entries() {
        let fx = fixture(None);
        put(&fx.store, "A", &["x"]);
        put(&fx.store, "B", &["x", "y"]);
        put(&fx.store, "C", &["y"]);

        let report = fx.invalidator.purge_by_tags(&tags(&["x"])).await;

        assert_eq!(report.keys_removed, 2);
        assert_eq!(
            report.tags,
            vec![TagPurge {
                tag: "x".to_string(),
                keys: 2
            }]
        );
        assert_eq!(report.edge, EdgeOutcome::Disabled);
        assert!(fx.store.get("A").is_none());
        assert!(fx.store.get("B").is_none());
        assert!(fx.store.get("C").is_some());
    }

    #[tokio::test]
    async fn records_one_event_per_tag() {
        let fx = fixture(None);
        put(&fx.store, "A", &["x"]);
        put(&fx.store, "B", &["x", "y"]);

        let report = fx
            .invalidator
            .purge_by_tags(&tags(&["x", "y", "x", "z"]))
            .await;
        assert_eq!(report.keys_removed, 2);
        assert_eq!(report.tags.len(), 3);

        let events = fx.analytics.events();
        assert_eq!(events.len(), 3);
        let summary: Vec<_> = events
            .iter()
            .map(|e| (e.detail.clone().unwrap_or_default(), e.affected_keys))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("x".to_string(), Some(2)),
                ("y".to_string(), Some(1)),
                ("z".to_string(), Some(0)),
            ]
        );
        assert_eq!(fx.analytics.invalidations(), 3);
    }

    #[tokio::test]
    async fn edge_failure_does_not_roll_back_local_purge() {
        let edge = Arc::new(RecordingEdge {
            fail: true,
            ..RecordingEdge::default()
        });
        let fx = fixture(Some(edge.clone()));
        put(&fx.store, "A", &["x"]);

        let report = fx.invalidator.purge_by_tags(&tags(&["x"])).await;

        assert!(matches!(report.edge, EdgeOutcome::Failed(_)));
        assert!(fx.store.get("A").is_none());
        assert_eq!(fx.analytics.errors(), 1);
        assert_eq!(edge.calls.lock().expect("calls lock").len(), 1);
    }

    #[tokio::test]
    async fn purge_all_clears_and_notifies_edge() {
        let edge = Arc::new(RecordingEdge::default());
        let fx = fixture(Some(edge.clone()));
        put(&fx.store, "A", &["x"]);
        put(&fx.store, "B", &[]);

        let report = fx.invalidator.purge_all().await;

        assert_eq!(report.keys_removed, 2);
        assert_eq!(report.edge, EdgeOutcome::Purged);
        assert!(fx.store.is_empty());
        assert_eq!(
            edge.calls.lock().expect("calls lock").as_slice(),
            &[vec![PURGE_ALL_DETAIL.to_string()]]
        );
    }

    #[tokio::test]
    async fn key_purges_stay_local() {
        let edge = Arc::new(RecordingEdge::default());
        let fx = fixture(Some(edge.clone()));
        put(&fx.store, "A", &["x"]);

        let report = fx.invalidator.purge_key("A");

        assert_eq!(report.keys_removed, 1);
        assert_eq!(report.edge, EdgeOutcome::Skipped);
        assert!(fx.store.keys_for_tags(&tags(&["x"])).is_empty());
        assert!(edge.calls.lock().expect("calls lock").is_empty());
    }

    #[tokio::test]
    async fn empty_tag_list_is_a_no_op() {
        let fx = fixture(None);
        put(&fx.store, "A", &["x"]);

        let report = fx.invalidator.purge_by_tags(&[]).await;

        assert_eq!(report.keys_removed, 0);
        assert!(fx.store.get("A").is_some());
        assert!(fx.analytics.is_empty());
    }
}

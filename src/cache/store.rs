//! Bounded entry store.
//!
//! Holds cache entries in an LRU table with per-entry expiry and keeps the
//! [`TagIndex`] in lockstep: every insert, delete, eviction and expiry touches
//! both structures inside the same critical section.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use metrics::{counter, gauge};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;

use super::clock::Clock;
use super::lock::mutex_lock;
use super::tags::TagIndex;

const SOURCE: &str = "cache::store";

const METRIC_CACHE_EVICT_TOTAL: &str = "unicache_cache_evict_total";
const METRIC_CACHE_ENTRIES: &str = "unicache_cache_entries";

/// A cached value with its lifetime and invalidation tags.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
    pub created_at: OffsetDateTime,
    /// Served as fresh until this instant.
    pub fresh_until: OffsetDateTime,
    /// Absent from this instant on; later than `fresh_until` only for
    /// strategies that tolerate stale reads.
    pub expires_at: OffsetDateTime,
    pub tags: HashSet<String>,
    pub approx_size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    fn is_fresh(&self, now: OffsetDateTime) -> bool {
        self.fresh_until > now
    }
}

/// Result of a lookup that distinguishes fresh from stale-but-servable values.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Fresh(Bytes),
    Stale(Bytes),
    Absent,
}

/// Parameters for a single insert.
#[derive(Debug, Clone)]
pub struct EntrySpec<'a> {
    pub ttl: Duration,
    pub stale_while_revalidate: Option<Duration>,
    pub tags: &'a [String],
}

/// Outcome of an insert.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    pub stored: bool,
    pub evicted: Vec<String>,
}

/// Point-in-time counters for operators.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub capacity: usize,
    pub approx_bytes: usize,
    pub max_bytes: Option<usize>,
    pub tags: usize,
    pub tagged_keys: usize,
    pub pending_fills: usize,
}

/// A fill registered before its producer runs. Purges that touch its key or
/// any of its tags mark it invalidated so the late value is not stored.
struct PendingFill {
    key: String,
    tags: HashSet<String>,
    invalidated: bool,
}

struct StoreInner {
    entries: LruCache<String, CacheEntry>,
    tags: TagIndex,
    approx_bytes: usize,
    pending: HashMap<u64, PendingFill>,
    next_fill: u64,
}

impl StoreInner {
    fn invalidate_fills(&mut self, mut affects: impl FnMut(&PendingFill) -> bool) {
        for fill in self.pending.values_mut() {
            if !fill.invalidated && affects(fill) {
                fill.invalidated = true;
            }
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.tags.remove_key(key);
        self.approx_bytes = self.approx_bytes.saturating_sub(entry.approx_size_bytes);
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (key, entry) = self.entries.pop_lru()?;
        self.tags.remove_key(&key);
        self.approx_bytes = self.approx_bytes.saturating_sub(entry.approx_size_bytes);
        Some(key)
    }

    /// Fetch a live entry, dropping it when expired. Promotes recency on hit.
    fn live(&mut self, key: &str, now: OffsetDateTime) -> Option<&CacheEntry> {
        let expired = self.entries.peek(key)?.is_expired(now);
        if expired {
            self.remove(key);
            return None;
        }
        self.entries.get(key)
    }
}

/// LRU entry table plus tag index behind one mutex.
pub struct EntryStore {
    inner: Mutex<StoreInner>,
    capacity: NonZeroUsize,
    max_bytes: Option<NonZeroUsize>,
    clock: Arc<dyn Clock>,
}

impl EntryStore {
    pub fn new(capacity: NonZeroUsize, max_bytes: Option<NonZeroUsize>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries: LruCache::new(capacity),
                tags: TagIndex::new(),
                approx_bytes: 0,
                pending: HashMap::new(),
                next_fill: 0,
            }),
            capacity,
            max_bytes,
            clock,
        }
    }

    /// Fresh value for `key`, if any.
    ///
    /// Entries past their hard expiry are removed here. Stale entries are left
    /// in place for [`lookup`](Self::lookup) but reported as absent.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        match self.lookup(key) {
            Lookup::Fresh(value) => Some(value),
            Lookup::Stale(_) | Lookup::Absent => None,
        }
    }

    pub fn lookup(&self, key: &str) -> Lookup {
        let now = self.clock.now();
        let mut inner = mutex_lock(&self.inner, SOURCE, "lookup");
        match inner.live(key, now) {
            Some(entry) if entry.is_fresh(now) => Lookup::Fresh(entry.value.clone()),
            Some(entry) => Lookup::Stale(entry.value.clone()),
            None => Lookup::Absent,
        }
    }

    /// Store `value` under `key`, evicting least-recently-used entries first
    /// when the store is full.
    pub fn set(&self, key: &str, value: Bytes, spec: EntrySpec<'_>) -> InsertOutcome {
        let mut inner = mutex_lock(&self.inner, SOURCE, "set");
        self.insert_locked(&mut inner, key, value, spec)
    }

    /// Register a fill for `key` before its producer runs.
    ///
    /// The returned [`Fill`] stores its value only if no purge touched `key`
    /// or one of `tags` in the meantime. Dropping it unfinished releases the
    /// registration.
    pub fn begin_fill(self: &Arc<Self>, key: &str, tags: &[String]) -> Fill {
        let mut inner = mutex_lock(&self.inner, SOURCE, "begin_fill");
        let id = inner.next_fill;
        inner.next_fill = inner.next_fill.wrapping_add(1);
        inner.pending.insert(
            id,
            PendingFill {
                key: key.to_owned(),
                tags: tags.iter().cloned().collect(),
                invalidated: false,
            },
        );
        Fill {
            store: Arc::clone(self),
            id,
        }
    }

    fn complete_fill(&self, id: u64, value: Bytes, spec: EntrySpec<'_>) -> InsertOutcome {
        let mut inner = mutex_lock(&self.inner, SOURCE, "complete_fill");
        match inner.pending.remove(&id) {
            Some(fill) if fill.invalidated => {
                debug!(key = %fill.key, "skipping fill raced by invalidation");
                InsertOutcome::default()
            }
            Some(fill) => self.insert_locked(&mut inner, &fill.key, value, spec),
            None => InsertOutcome::default(),
        }
    }

    fn abandon_fill(&self, id: u64) {
        mutex_lock(&self.inner, SOURCE, "abandon_fill")
            .pending
            .remove(&id);
    }

    fn insert_locked(
        &self,
        inner: &mut StoreInner,
        key: &str,
        value: Bytes,
        spec: EntrySpec<'_>,
    ) -> InsertOutcome {
        let now = self.clock.now();
        let fresh_until = now + spec.ttl;
        let expires_at = fresh_until + spec.stale_while_revalidate.unwrap_or(Duration::ZERO);
        let tags: HashSet<String> = spec.tags.iter().cloned().collect();
        let approx_size_bytes =
            key.len() + value.len() + tags.iter().map(String::len).sum::<usize>();

        let mut outcome = InsertOutcome::default();

        // An overwrite always retires the previous value, even when the new
        // one cannot be stored.
        inner.remove(key);

        if let Some(max) = self.max_bytes
            && approx_size_bytes > max.get()
        {
            debug!(key, approx_size_bytes, "value exceeds byte budget; not cached");
            gauge!(METRIC_CACHE_ENTRIES).set(inner.entries.len() as f64);
            return outcome;
        }

        while inner.entries.len() >= self.capacity.get()
            || self
                .max_bytes
                .is_some_and(|max| inner.approx_bytes + approx_size_bytes > max.get())
        {
            match inner.evict_lru() {
                Some(evicted) => outcome.evicted.push(evicted),
                None => break,
            }
        }

        inner.tags.add_tags(key, &tags);
        inner.approx_bytes += approx_size_bytes;
        inner.entries.put(
            key.to_owned(),
            CacheEntry {
                key: key.to_owned(),
                value,
                created_at: now,
                fresh_until,
                expires_at,
                tags,
                approx_size_bytes,
            },
        );
        outcome.stored = true;

        if !outcome.evicted.is_empty() {
            counter!(METRIC_CACHE_EVICT_TOTAL).increment(outcome.evicted.len() as u64);
            debug!(key, evicted = outcome.evicted.len(), "evicted least recently used entries");
        }
        gauge!(METRIC_CACHE_ENTRIES).set(inner.entries.len() as f64);

        outcome
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut inner = mutex_lock(&self.inner, SOURCE, "delete");
        inner.invalidate_fills(|fill| fill.key == key);
        let removed = inner.remove(key).is_some();
        if removed {
            gauge!(METRIC_CACHE_ENTRIES).set(inner.entries.len() as f64);
        }
        removed
    }

    /// Delete every key indexed under any of `tags`.
    ///
    /// Returns the number of distinct keys removed and the count matched by
    /// each requested tag, in request order.
    pub fn purge_tags(&self, tags: &[String]) -> (usize, Vec<(String, usize)>) {
        let mut inner = mutex_lock(&self.inner, SOURCE, "purge_tags");
        inner.invalidate_fills(|fill| tags.iter().any(|tag| fill.tags.contains(tag)));

        let per_tag: Vec<(String, HashSet<String>)> = tags
            .iter()
            .map(|tag| (tag.clone(), inner.tags.keys_for_tag(tag)))
            .collect();

        let mut removed = 0;
        for (_, keys) in &per_tag {
            for key in keys {
                if inner.remove(key).is_some() {
                    removed += 1;
                }
            }
        }
        gauge!(METRIC_CACHE_ENTRIES).set(inner.entries.len() as f64);

        let per_tag = per_tag
            .into_iter()
            .map(|(tag, keys)| (tag, keys.len()))
            .collect();
        (removed, per_tag)
    }

    /// Delete the given keys, returning how many were live.
    pub fn purge_keys(&self, keys: &[String]) -> usize {
        let mut inner = mutex_lock(&self.inner, SOURCE, "purge_keys");
        inner.invalidate_fills(|fill| keys.contains(&fill.key));
        let removed = keys.iter().filter(|key| inner.remove(key).is_some()).count();
        gauge!(METRIC_CACHE_ENTRIES).set(inner.entries.len() as f64);
        removed
    }

    /// Remove every entry whose hard expiry has passed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = mutex_lock(&self.inner, SOURCE, "sweep_expired");

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }
        gauge!(METRIC_CACHE_ENTRIES).set(inner.entries.len() as f64);

        expired.len()
    }

    /// Drop everything. Returns the number of entries removed.
    pub fn clear(&self) -> usize {
        let mut inner = mutex_lock(&self.inner, SOURCE, "clear");
        let count = inner.entries.len();
        inner.entries.clear();
        inner.tags.clear();
        inner.approx_bytes = 0;
        inner.invalidate_fills(|_| true);
        gauge!(METRIC_CACHE_ENTRIES).set(0.0);
        count
    }

    pub fn keys_for_tags(&self, tags: &[String]) -> HashSet<String> {
        mutex_lock(&self.inner, SOURCE, "keys_for_tags")
            .tags
            .keys_for_tags(tags)
    }

    pub fn tags_for_key(&self, key: &str) -> HashSet<String> {
        mutex_lock(&self.inner, SOURCE, "tags_for_key")
            .tags
            .tags_for_key(key)
    }

    /// Number of stored entries, including ones not yet swept.
    pub fn len(&self) -> usize {
        mutex_lock(&self.inner, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }

    pub fn stats(&self) -> StoreStats {
        let inner = mutex_lock(&self.inner, SOURCE, "stats");
        StoreStats {
            entries: inner.entries.len(),
            capacity: self.capacity.get(),
            approx_bytes: inner.approx_bytes,
            max_bytes: self.max_bytes.map(NonZeroUsize::get),
            tags: inner.tags.tag_count(),
            tagged_keys: inner.tags.key_count(),
            pending_fills: inner.pending.len(),
        }
    }
}

/// Registration of an in-flight fill, created by [`EntryStore::begin_fill`].
pub struct Fill {
    store: Arc<EntryStore>,
    id: u64,
}

impl Fill {
    /// Store the produced value unless a purge invalidated this fill.
    pub fn complete(self, value: Bytes, spec: EntrySpec<'_>) -> InsertOutcome {
        self.store.complete_fill(self.id, value, spec)
    }
}

impl Drop for Fill {
    fn drop(&mut self) {
        self.store.abandon_fill(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;
    use crate::cache::clock::ManualClock;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    fn spec(ttl_ms: u64, tags: &[String]) -> EntrySpec<'_> {
        EntrySpec {
            ttl: Duration::from_millis(ttl_ms),
            stale_while_revalidate: None,
            tags,
        }
    }

    fn store_with(capacity: usize) -> (EntryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = EntryStore::new(
            NonZeroUsize::new(capacity).expect("non-zero capacity"),
            None,
            clock.clone(),
        );
        (store, clock)
    }

    #[test]
    fn set_then_get_round_trips() {
        let (store, _) = store_with(8);
        let t = tags(&["events"]);
        store.set("events:list", Bytes::from_static(b"[1,2,3]"), spec(1000, &t));

        assert_eq!(store.get("events:list"), Some(Bytes::from_static(b"[1,2,3]")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_key_is_absent() {
        let (store, _) = store_with(8);
        assert_eq!(store.get("nope"), None);
        assert_eq!(store.lookup("nope"), Lookup::Absent);
        assert!(!store.delete("nope"));
    }

    #[test]
    fn expired_entry_is_absent_and_unindexed() {
        let (store, clock) = store_with(8);
        let t = tags(&["leaderboard", "hackathon:1"]);
        store.set("leaderboard", Bytes::from_static(b"{}"), spec(1000, &t));

        clock.advance(Duration::from_millis(999));
        assert!(store.get("leaderboard").is_some());

        clock.advance(Duration::from_millis(1));
        assert_eq!(store.get("leaderboard"), None);
        assert!(store.keys_for_tags(&t).is_empty());
        assert!(store.tags_for_key("leaderboard").is_empty());
        assert_eq!(store.stats().tags, 0);
        assert!(store.is_empty());
    }

    #[test]
    fn stale_window_is_visible_only_to_lookup() {
        let (store, clock) = store_with(8);
        let t = tags(&["companies"]);
        store.set(
            "companies",
            Bytes::from_static(b"[]"),
            EntrySpec {
                ttl: Duration::from_millis(100),
                stale_while_revalidate: Some(Duration::from_millis(50)),
                tags: &t,
            },
        );

        clock.advance(Duration::from_millis(120));
        assert_eq!(store.get("companies"), None);
        assert_eq!(store.lookup("companies"), Lookup::Stale(Bytes::from_static(b"[]")));
        assert_eq!(store.len(), 1);

        clock.advance(Duration::from_millis(30));
        assert_eq!(store.lookup("companies"), Lookup::Absent);
        assert!(store.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let (store, _) = store_with(3);
        let none: Vec<String> = Vec::new();
        store.set("a", Bytes::from_static(b"1"), spec(10_000, &none));
        store.set("b", Bytes::from_static(b"2"), spec(10_000, &none));
        store.set("c", Bytes::from_static(b"3"), spec(10_000, &none));

        // Touch `a` so `b` becomes least recently used.
        assert!(store.get("a").is_some());

        let outcome = store.set("d", Bytes::from_static(b"4"), spec(10_000, &none));
        assert_eq!(outcome.evicted, vec!["b".to_string()]);

        assert!(store.get("b").is_none());
        for key in ["a", "c", "d"] {
            assert!(store.get(key).is_some(), "{key} should survive");
        }
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn eviction_cleans_tag_index() {
        let (store, _) = store_with(1);
        let first = tags(&["x"]);
        let second = tags(&["y"]);
        store.set("a", Bytes::from_static(b"1"), spec(10_000, &first));
        store.set("b", Bytes::from_static(b"2"), spec(10_000, &second));

        assert!(store.keys_for_tags(&first).is_empty());
        assert_eq!(store.keys_for_tags(&second).len(), 1);
        assert_eq!(store.stats().tags, 1);
    }

    #[test]
    fn overwrite_replaces_tags_without_evicting() {
        let (store, _) = store_with(2);
        let x = tags(&["x"]);
        let y = tags(&["y"]);
        store.set("a", Bytes::from_static(b"1"), spec(10_000, &x));
        store.set("b", Bytes::from_static(b"2"), spec(10_000, &x));

        let outcome = store.set("a", Bytes::from_static(b"3"), spec(10_000, &y));
        assert!(outcome.evicted.is_empty());
        assert_eq!(store.get("a"), Some(Bytes::from_static(b"3")));
        assert_eq!(store.keys_for_tags(&x), HashSet::from(["b".to_string()]));
        assert_eq!(store.keys_for_tags(&y), HashSet::from(["a".to_string()]));
    }

    #[test]
    fn purge_tags_reports_per_tag_counts() {
        let (store, _) = store_with(8);
        store.set("a", Bytes::from_static(b"1"), spec(10_000, &tags(&["x"])));
        store.set("b", Bytes::from_static(b"2"), spec(10_000, &tags(&["x", "y"])));
        store.set("c", Bytes::from_static(b"3"), spec(10_000, &tags(&["y"])));

        let (removed, per_tag) = store.purge_tags(&tags(&["x"]));
        assert_eq!(removed, 2);
        assert_eq!(per_tag, vec![("x".to_string(), 2)]);

        assert!(store.get("a").is_none());
        assert!(store.get("b").is_none());
        assert!(store.get("c").is_some());
        assert_eq!(store.keys_for_tags(&tags(&["y"])), HashSet::from(["c".to_string()]));
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let (store, clock) = store_with(8);
        let none: Vec<String> = Vec::new();
        let t = tags(&["short"]);
        store.set("short", Bytes::from_static(b"1"), spec(100, &t));
        store.set("long", Bytes::from_static(b"2"), spec(10_000, &none));

        clock.advance(Duration::from_millis(200));
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.keys_for_tags(&t).is_empty());
        assert!(store.get("long").is_some());
    }

    fn shared_store(capacity: usize) -> Arc<EntryStore> {
        Arc::new(store_with(capacity).0)
    }

    #[test]
    fn fill_after_matching_tag_purge_is_skipped() {
        let store = shared_store(8);
        let t = tags(&["x"]);
        let fill = store.begin_fill("a", &t);

        store.purge_tags(&t);

        let outcome = fill.complete(Bytes::from_static(b"1"), spec(1000, &t));
        assert!(!outcome.stored);
        assert!(store.get("a").is_none());

        let outcome = store
            .begin_fill("a", &t)
            .complete(Bytes::from_static(b"1"), spec(1000, &t));
        assert!(outcome.stored);
    }

    #[test]
    fn unrelated_purges_leave_fill_intact() {
        let store = shared_store(8);
        let t = tags(&["leaderboard"]);
        let fill = store.begin_fill("leaderboard", &t);

        store.purge_tags(&tags(&["company:9"]));
        store.purge_keys(&tags(&["other"]));
        store.delete("another");

        let outcome = fill.complete(Bytes::from_static(b"[]"), spec(1000, &t));
        assert!(outcome.stored);
        assert_eq!(store.get("leaderboard"), Some(Bytes::from_static(b"[]")));
        assert_eq!(store.stats().pending_fills, 0);
    }

    #[test]
    fn key_purge_and_clear_invalidate_fills() {
        let store = shared_store(8);
        let none: Vec<String> = Vec::new();

        let by_key = store.begin_fill("a", &none);
        let by_delete = store.begin_fill("b", &none);
        let by_clear = store.begin_fill("c", &none);
        store.purge_keys(&tags(&["a"]));
        store.delete("b");
        store.clear();

        for fill in [by_key, by_delete, by_clear] {
            assert!(!fill.complete(Bytes::from_static(b"1"), spec(1000, &none)).stored);
        }
        assert!(store.is_empty());
    }

    #[test]
    fn dropped_fill_is_released() {
        let store = shared_store(8);
        let fill = store.begin_fill("a", &[]);
        assert_eq!(store.stats().pending_fills, 1);

        drop(fill);
        assert_eq!(store.stats().pending_fills, 0);
    }

    #[test]
    fn byte_budget_evicts_until_it_fits() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = EntryStore::new(
            NonZeroUsize::new(10).expect("non-zero"),
            NonZeroUsize::new(10),
            clock,
        );
        let none: Vec<String> = Vec::new();

        store.set("a", Bytes::from_static(b"1234"), spec(1000, &none));
        store.set("b", Bytes::from_static(b"1234"), spec(1000, &none));
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());

        let outcome = store.set("c", Bytes::from_static(b"0123456789"), spec(1000, &none));
        assert!(!outcome.stored);
        assert!(store.get("b").is_some());
        assert!(store.stats().approx_bytes <= 10);
    }

    #[test]
    fn oversized_overwrite_drops_previous_value() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = EntryStore::new(
            NonZeroUsize::new(10).expect("non-zero"),
            NonZeroUsize::new(16),
            clock,
        );
        let t = tags(&["p"]);

        assert!(store.set("profile", Bytes::from_static(b"old"), spec(1000, &t)).stored);
        let outcome = store.set("profile", Bytes::from(vec![b'x'; 64]), spec(1000, &t));

        assert!(!outcome.stored);
        assert_eq!(store.get("profile"), None);
        assert!(store.keys_for_tags(&t).is_empty());
        assert_eq!(store.stats().approx_bytes, 0);
    }

    #[test]
    fn clear_empties_store_and_index() {
        let (store, _) = store_with(8);
        store.set("a", Bytes::from_static(b"1"), spec(1000, &tags(&["x"])));
        store.set("b", Bytes::from_static(b"2"), spec(1000, &tags(&["y"])));

        assert_eq!(store.clear(), 2);
        let stats = store.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.tags, 0);
        assert_eq!(stats.approx_bytes, 0);
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let (store, _) = store_with(8);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.inner.lock().expect("store lock should be acquired");
            panic!("poison store lock");
        }));

        let none: Vec<String> = Vec::new();
        store.set("a", Bytes::from_static(b"1"), spec(1000, &none));
        assert!(store.get("a").is_some());
    }
}

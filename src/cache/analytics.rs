//! Analytics recorder.
//!
//! Events go into a fixed-capacity ring buffer (oldest dropped first) while
//! running counters are bumped in O(1). Aggregations are computed on demand
//! from a copy of the buffer so a snapshot never holds up `record`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::Serialize;

use super::events::{AnalyticsEvent, EventKind};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::analytics";

const METRIC_CACHE_HIT_TOTAL: &str = "unicache_cache_hit_total";
const METRIC_CACHE_MISS_TOTAL: &str = "unicache_cache_miss_total";
const METRIC_CACHE_ERROR_TOTAL: &str = "unicache_cache_error_total";
const METRIC_CACHE_INVALIDATION_TOTAL: &str = "unicache_cache_invalidation_total";

#[derive(Debug, Default)]
struct Counters {
    total_requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    errors: AtomicU64,
}

/// Append-only event log with running totals.
pub struct AnalyticsRecorder {
    buffer: Mutex<VecDeque<AnalyticsEvent>>,
    capacity: NonZeroUsize,
    counters: Counters,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnalyticsSnapshot {
    pub overview: Overview,
    pub by_strategy: Vec<StrategyBreakdown>,
    pub top_routes: Vec<RouteBreakdown>,
    /// One bucket per UTC hour of day, `0..24`.
    pub by_hour: Vec<HourBucket>,
    /// Newest first.
    pub recent: Vec<AnalyticsEvent>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Overview {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub buffered_events: usize,
    pub buffer_capacity: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StrategyBreakdown {
    pub strategy: String,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub avg_response_time_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RouteBreakdown {
    pub route: String,
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub avg_response_time_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct HourBucket {
    pub hour: u8,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub errors: u64,
}

/// `hits / (hits + misses)`, or 0 when nothing was requested.
pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

#[derive(Default)]
struct Tally {
    hits: u64,
    misses: u64,
    errors: u64,
    response_time_total: u64,
    response_time_samples: u64,
}

impl Tally {
    fn add(&mut self, event: &AnalyticsEvent) {
        match event.kind {
            EventKind::Hit => self.hits += 1,
            EventKind::Miss => self.misses += 1,
            EventKind::Error => self.errors += 1,
            EventKind::Invalidation => {}
        }
        if let Some(ms) = event.response_time_ms {
            self.response_time_total = self.response_time_total.saturating_add(ms);
            self.response_time_samples += 1;
        }
    }

    fn requests(&self) -> u64 {
        self.hits + self.misses
    }

    fn avg_response_time_ms(&self) -> Option<f64> {
        (self.response_time_samples > 0)
            .then(|| self.response_time_total as f64 / self.response_time_samples as f64)
    }
}

impl AnalyticsRecorder {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.get())),
            capacity,
            counters: Counters::default(),
        }
    }

    /// Append an event and bump its counters.
    pub fn record(&self, event: AnalyticsEvent) {
        match event.kind {
            EventKind::Hit => {
                self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
            }
            EventKind::Miss => {
                self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_MISS_TOTAL).increment(1);
            }
            EventKind::Invalidation => {
                self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_INVALIDATION_TOTAL).increment(1);
            }
            EventKind::Error => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_ERROR_TOTAL).increment(1);
            }
        }

        let mut buffer = mutex_lock(&self.buffer, SOURCE, "record");
        if buffer.len() >= self.capacity.get() {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }

    pub fn hits(&self) -> u64 {
        self.counters.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.counters.misses.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.counters.errors.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> u64 {
        self.counters.invalidations.load(Ordering::Relaxed)
    }

    /// Number of events currently buffered.
    pub fn len(&self) -> usize {
        mutex_lock(&self.buffer, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the buffered events, oldest first.
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        mutex_lock(&self.buffer, SOURCE, "events")
            .iter()
            .cloned()
            .collect()
    }

    /// Aggregate the buffer into per-strategy, per-route and per-hour views.
    pub fn snapshot(&self, recent_limit: usize, top_routes: usize) -> AnalyticsSnapshot {
        let events = self.events();

        let hits = self.hits();
        let misses = self.misses();
        let overview = Overview {
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            hits,
            misses,
            invalidations: self.invalidations(),
            errors: self.errors(),
            hit_rate: hit_rate(hits, misses),
            buffered_events: events.len(),
            buffer_capacity: self.capacity.get(),
        };

        let mut strategies: BTreeMap<&str, Tally> = BTreeMap::new();
        let mut routes: HashMap<&str, Tally> = HashMap::new();
        let mut hours = [HourBucket::default(); 24];

        for event in &events {
            if let Some(strategy) = event.strategy.as_deref() {
                strategies.entry(strategy).or_default().add(event);
            }
            if event.kind != EventKind::Invalidation {
                routes.entry(event.route.as_str()).or_default().add(event);
            }

            let bucket = &mut hours[usize::from(event.timestamp.hour())];
            match event.kind {
                EventKind::Hit => bucket.hits += 1,
                EventKind::Miss => bucket.misses += 1,
                EventKind::Invalidation => bucket.invalidations += 1,
                EventKind::Error => bucket.errors += 1,
            }
        }

        let by_strategy = strategies
            .into_iter()
            .map(|(strategy, tally)| StrategyBreakdown {
                strategy: strategy.to_owned(),
                hits: tally.hits,
                misses: tally.misses,
                errors: tally.errors,
                hit_rate: hit_rate(tally.hits, tally.misses),
                avg_response_time_ms: tally.avg_response_time_ms(),
            })
            .collect();

        let mut route_rows: Vec<RouteBreakdown> = routes
            .into_iter()
            .map(|(route, tally)| RouteBreakdown {
                route: route.to_owned(),
                requests: tally.requests(),
                hits: tally.hits,
                misses: tally.misses,
                errors: tally.errors,
                hit_rate: hit_rate(tally.hits, tally.misses),
                avg_response_time_ms: tally.avg_response_time_ms(),
            })
            .collect();
        route_rows.sort_by(|a, b| b.requests.cmp(&a.requests).then_with(|| a.route.cmp(&b.route)));
        route_rows.truncate(top_routes);

        let by_hour = hours
            .into_iter()
            .enumerate()
            .map(|(hour, bucket)| HourBucket {
                hour: hour as u8,
                ..bucket
            })
            .collect();

        let recent = events.iter().rev().take(recent_limit).cloned().collect();

        AnalyticsSnapshot {
            overview,
            by_strategy,
            top_routes: route_rows,
            by_hour,
            recent,
        }
    }

    /// Drop every buffered event and zero the counters.
    pub fn reset(&self) {
        let mut buffer = mutex_lock(&self.buffer, SOURCE, "reset");
        buffer.clear();
        for counter in [
            &self.counters.total_requests,
            &self.counters.hits,
            &self.counters.misses,
            &self.counters.invalidations,
            &self.counters.errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::OffsetDateTime;
    use time::macros::datetime;

    use super::*;

    fn recorder(capacity: usize) -> AnalyticsRecorder {
        AnalyticsRecorder::new(NonZeroUsize::new(capacity).expect("non-zero"))
    }

    fn event(kind: EventKind, at: OffsetDateTime, route: &str, strategy: &str) -> AnalyticsEvent {
        AnalyticsEvent::new(kind, at, route).with_strategy(strategy)
    }

    #[test]
    fn hit_rate_is_zero_without_requests() {
        let snapshot = recorder(8).snapshot(10, 10);
        assert_eq!(snapshot.overview.hit_rate, 0.0);
        assert_eq!(snapshot.overview.total_requests, 0);
        assert_eq!(snapshot.by_hour.len(), 24);
        assert!(snapshot.recent.is_empty());
    }

    #[test]
    fn hit_rate_matches_scripted_sequence() {
        let recorder = recorder(64);
        let at = datetime!(2024-05-01 09:15 UTC);
        for _ in 0..3 {
            recorder.record(event(EventKind::Hit, at, "/api/events", "API"));
        }
        recorder.record(event(EventKind::Miss, at, "/api/events", "API"));

        let overview = recorder.snapshot(0, 0).overview;
        assert_eq!(overview.hits, 3);
        assert_eq!(overview.misses, 1);
        assert_eq!(overview.total_requests, 4);
        assert_eq!(overview.hit_rate, 0.75);
    }

    #[test]
    fn ring_buffer_drops_oldest_but_counters_keep_totals() {
        let recorder = recorder(2);
        let at = datetime!(2024-05-01 09:00 UTC);
        recorder.record(event(EventKind::Miss, at, "/a", "API").with_detail("first"));
        recorder.record(event(EventKind::Hit, at, "/a", "API").with_detail("second"));
        recorder.record(event(EventKind::Hit, at, "/a", "API").with_detail("third"));

        let snapshot = recorder.snapshot(10, 10);
        assert_eq!(snapshot.overview.buffered_events, 2);
        assert_eq!(snapshot.overview.total_requests, 3);

        let details: Vec<_> = snapshot
            .recent
            .iter()
            .filter_map(|e| e.detail.as_deref())
            .collect();
        assert_eq!(details, vec!["third", "second"]);
    }

    #[test]
    fn groups_by_strategy_route_and_hour() {
        let recorder = recorder(64);
        let morning = datetime!(2024-05-01 09:10 UTC);
        let evening = datetime!(2024-05-01 21:45 UTC);

        recorder.record(event(EventKind::Hit, morning, "/api/leaderboard", "SHORT"));
        recorder.record(
            event(EventKind::Miss, morning, "/api/leaderboard", "SHORT")
                .with_response_time(Duration::from_millis(30)),
        );
        recorder.record(
            event(EventKind::Miss, evening, "/api/leaderboard", "SHORT")
                .with_response_time(Duration::from_millis(10)),
        );
        recorder.record(event(EventKind::Hit, evening, "/api/companies", "API"));
        recorder.record(
            AnalyticsEvent::new(EventKind::Invalidation, evening, "/admin").with_detail("leaderboard"),
        );

        let snapshot = recorder.snapshot(10, 1);

        let strategies: Vec<_> = snapshot.by_strategy.iter().map(|s| s.strategy.as_str()).collect();
        assert_eq!(strategies, vec!["API", "SHORT"]);
        let short = &snapshot.by_strategy[1];
        assert_eq!((short.hits, short.misses), (1, 2));
        assert_eq!(short.avg_response_time_ms, Some(20.0));

        assert_eq!(snapshot.top_routes.len(), 1);
        assert_eq!(snapshot.top_routes[0].route, "/api/leaderboard");
        assert_eq!(snapshot.top_routes[0].requests, 3);

        assert_eq!(snapshot.by_hour[9].hits, 1);
        assert_eq!(snapshot.by_hour[9].misses, 1);
        assert_eq!(snapshot.by_hour[21].misses, 1);
        assert_eq!(snapshot.by_hour[21].invalidations, 1);
        assert_eq!(snapshot.by_hour[21].hour, 21);

        assert_eq!(snapshot.overview.invalidations, 1);
    }

    #[test]
    fn huge_response_times_saturate() {
        let recorder = recorder(8);
        let at = datetime!(2024-05-01 09:00 UTC);
        for _ in 0..2 {
            recorder.record(
                event(EventKind::Miss, at, "/slow", "API").with_response_time(Duration::MAX),
            );
        }

        let snapshot = recorder.snapshot(10, 10);
        assert_eq!(snapshot.by_strategy[0].misses, 2);
        assert!(snapshot.by_strategy[0].avg_response_time_ms.is_some());
    }

    #[test]
    fn reset_clears_everything() {
        let recorder = recorder(8);
        let at = datetime!(2024-05-01 09:00 UTC);
        recorder.record(event(EventKind::Hit, at, "/a", "API"));
        recorder.record(event(EventKind::Error, at, "/a", "API"));

        recorder.reset();

        assert!(recorder.is_empty());
        let overview = recorder.snapshot(10, 10).overview;
        assert_eq!(overview.hits, 0);
        assert_eq!(overview.errors, 0);
    }

    #[test]
    fn record_survives_poisoned_buffer() {
        use std::panic::{AssertUnwindSafe, catch_unwind};

        let recorder = recorder(8);
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = recorder.buffer.lock().expect("buffer lock should be acquired");
            panic!("poison analytics buffer");
        }));

        recorder.record(event(EventKind::Hit, datetime!(2024-05-01 09:00 UTC), "/a", "API"));
        assert_eq!(recorder.len(), 1);
    }
}

//! Engine tuning knobs.

use std::num::NonZeroUsize;
use std::time::Duration;

const DEFAULT_CAPACITY: NonZeroUsize = non_zero(10_000);
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5_000;
const DEFAULT_ANALYTICS_CAPACITY: NonZeroUsize = non_zero(10_000);
const DEFAULT_ANALYTICS_RECENT_LIMIT: usize = 50;
const DEFAULT_ANALYTICS_TOP_ROUTES: usize = 10;

const fn non_zero(value: usize) -> NonZeroUsize {
    match NonZeroUsize::new(value) {
        Some(value) => value,
        None => NonZeroUsize::MIN,
    }
}

/// Runtime configuration of a [`CacheEngine`](super::CacheEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of live entries.
    pub capacity: NonZeroUsize,
    /// Optional budget on approximate entry bytes.
    pub max_bytes: Option<NonZeroUsize>,
    /// How often the background sweeper drops expired entries.
    pub sweep_interval: Duration,
    /// Ring buffer size of the analytics recorder.
    pub analytics_capacity: NonZeroUsize,
    /// Default number of raw events in an analytics snapshot.
    pub analytics_recent_limit: usize,
    /// Number of routes in the snapshot's top list.
    pub analytics_top_routes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_bytes: None,
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            analytics_capacity: DEFAULT_ANALYTICS_CAPACITY,
            analytics_recent_limit: DEFAULT_ANALYTICS_RECENT_LIMIT,
            analytics_top_routes: DEFAULT_ANALYTICS_TOP_ROUTES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            capacity: settings.capacity,
            max_bytes: settings.max_bytes,
            sweep_interval: settings.sweep_interval,
            analytics_capacity: settings.analytics_capacity,
            analytics_recent_limit: settings.analytics_recent_limit,
            analytics_top_routes: settings.analytics_top_routes,
        }
    }
}

impl CacheConfig {
    pub fn with_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.capacity = capacity;
        self
    }
}

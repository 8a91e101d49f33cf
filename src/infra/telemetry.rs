use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every cache metric. Safe to call repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "unicache_cache_hit_total",
            Unit::Count,
            "Total number of cached-query hits, including stale hits."
        );
        describe_counter!(
            "unicache_cache_miss_total",
            Unit::Count,
            "Total number of cached-query misses."
        );
        describe_counter!(
            "unicache_cache_error_total",
            Unit::Count,
            "Total number of producer, decode and edge-purge failures."
        );
        describe_counter!(
            "unicache_cache_evict_total",
            Unit::Count,
            "Total number of entries evicted due to capacity or byte budget."
        );
        describe_counter!(
            "unicache_cache_invalidation_total",
            Unit::Count,
            "Total number of invalidation events (one per purged tag)."
        );
        describe_gauge!(
            "unicache_cache_entries",
            Unit::Count,
            "Current number of entries in the store."
        );
        describe_histogram!(
            "unicache_cache_producer_ms",
            Unit::Milliseconds,
            "Producer latency on cache misses in milliseconds."
        );
    });
}

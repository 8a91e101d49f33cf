//! Tag-indexed, multi-strategy in-memory cache.
//!
//! - **Entry store**: bounded LRU table with per-entry expiry, kept in
//!   lockstep with the **tag index**.
//! - **Strategies**: named TTL and `Cache-Control` policies.
//! - **Single flight**: one producer run per cold key.
//! - **Invalidation**: by key, by tag, or everything, with an optional edge purge.
//! - **Analytics**: ring buffer of hit/miss/invalidation/error events.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! capacity = 10000
//! sweep_interval_ms = 5000
//!
//! [[cache.strategies]]
//! name = "LEADERBOARD"
//! ttl_ms = 1000
//! cache_control = "public, max-age=1"
//! ```

mod analytics;
mod clock;
mod config;
mod edge;
mod engine;
mod error;
mod events;
mod flight;
mod invalidation;
mod keys;
mod lock;
mod middleware;
mod response;
pub mod route;
mod store;
pub mod strategy;
mod sweeper;
mod tags;

pub use analytics::{
    AnalyticsRecorder, AnalyticsSnapshot, HourBucket, Overview, RouteBreakdown,
    StrategyBreakdown, hit_rate,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use edge::{EdgePurgeError, EdgePurger, HttpEdgePurger};
pub use engine::{CacheEngine, CacheEngineBuilder, EngineStats, STALE_DETAIL, StrategySummary};
pub use error::{CacheError, SharedError};
pub use events::{AnalyticsEvent, EventKind};
pub use flight::{FlightRole, SingleFlight};
pub use invalidation::{EdgeOutcome, PURGE_ALL_DETAIL, PurgeReport, TagPurge};
pub use keys::{CacheKey, hash_value};
pub use middleware::route_context_layer;
pub use response::{
    CacheStatus, X_CACHE, X_CACHE_STRATEGY, X_EDGE_CACHEABLE, create_response, with_cache_status,
};
pub use store::{CacheEntry, EntrySpec, EntryStore, Fill, InsertOutcome, Lookup, StoreStats};
pub use strategy::{Strategy, StrategyRegistry, builtin_strategies};
pub use sweeper::spawn_sweeper;
pub use tags::TagIndex;

//! The cache engine: cached queries, typed get/set, responses and purges.
//!
//! One [`CacheEngine`] is built at startup and shared as `Arc<CacheEngine>`
//! with every handler. It owns the entry store, strategy table, single-flight
//! map, analytics recorder and invalidation manager.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::response::Response;
use bytes::Bytes;
use metrics::histogram;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use super::analytics::{AnalyticsRecorder, AnalyticsSnapshot};
use super::clock::{Clock, SystemClock};
use super::config::CacheConfig;
use super::edge::EdgePurger;
use super::error::CacheError;
use super::events::{AnalyticsEvent, EventKind};
use super::flight::SingleFlight;
use super::invalidation::{Invalidator, PurgeReport};
use super::response::{CacheStatus, create_response, with_cache_status};
use super::route;
use super::store::{EntrySpec, EntryStore, Lookup, StoreStats};
use super::strategy::{Strategy, StrategyRegistry};

const METRIC_CACHE_PRODUCER_MS: &str = "unicache_cache_producer_ms";

/// Detail attached to hits served from the stale window.
pub const STALE_DETAIL: &str = "stale";

/// Serializable view of a registered strategy.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StrategySummary {
    pub name: String,
    pub ttl_ms: u64,
    pub cache_control: String,
    pub edge_cacheable: bool,
    pub stale_while_revalidate_ms: Option<u64>,
}

impl From<&Strategy> for StrategySummary {
    fn from(strategy: &Strategy) -> Self {
        Self {
            name: strategy.name().to_owned(),
            ttl_ms: millis(strategy.ttl()),
            cache_control: strategy
                .cache_control()
                .to_str()
                .unwrap_or_default()
                .to_owned(),
            edge_cacheable: strategy.is_edge_cacheable(),
            stale_while_revalidate_ms: strategy.stale_window().map(millis),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngineStats {
    pub store: StoreStats,
    pub in_flight: usize,
    pub strategies: Vec<StrategySummary>,
    pub edge_purge_enabled: bool,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Collaborators used to build a [`CacheEngine`].
pub struct CacheEngineBuilder {
    config: CacheConfig,
    strategies: StrategyRegistry,
    edge: Option<Arc<dyn EdgePurger>>,
    clock: Arc<dyn Clock>,
}

impl CacheEngineBuilder {
    pub fn strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn edge_purger(mut self, edge: Arc<dyn EdgePurger>) -> Self {
        self.edge = Some(edge);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> CacheEngine {
        let store = Arc::new(EntryStore::new(
            self.config.capacity,
            self.config.max_bytes,
            self.clock.clone(),
        ));
        let analytics = Arc::new(AnalyticsRecorder::new(self.config.analytics_capacity));
        let invalidator = Invalidator::new(
            store.clone(),
            analytics.clone(),
            self.edge,
            self.clock.clone(),
        );

        CacheEngine {
            store,
            strategies: Arc::new(self.strategies),
            flights: SingleFlight::new(),
            analytics,
            invalidator,
            clock: self.clock,
            config: self.config,
        }
    }
}

pub struct CacheEngine {
    store: Arc<EntryStore>,
    strategies: Arc<StrategyRegistry>,
    flights: SingleFlight<Bytes>,
    analytics: Arc<AnalyticsRecorder>,
    invalidator: Invalidator,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
}

impl CacheEngine {
    /// Start building an engine with built-in strategies and the system clock.
    pub fn builder(config: CacheConfig) -> CacheEngineBuilder {
        CacheEngineBuilder {
            config,
            strategies: StrategyRegistry::with_builtins(),
            edge: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn new(config: CacheConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    /// Fresh value stored under `key`.
    ///
    /// A value that no longer decodes as `T` is dropped and reported as absent.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let bytes = self.store.get(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                self.discard_undecodable(key, None, &route::current(), &err);
                None
            }
        }
    }

    /// Store `value` under `key` with the lifetime of `strategy_name`.
    ///
    /// # Panics
    ///
    /// Panics when `strategy_name` is not registered.
    pub fn set<T>(
        &self,
        key: &str,
        value: &T,
        strategy_name: &str,
        tags: &[&str],
    ) -> Result<(), CacheError>
    where
        T: Serialize,
    {
        let strategy = self.strategies.resolve(strategy_name);
        let bytes = Bytes::from(serde_json::to_vec(value)?);
        let tags: Vec<String> = tags.iter().map(|t| (*t).to_owned()).collect();
        self.store.set(
            key,
            bytes,
            EntrySpec {
                ttl: strategy.ttl(),
                stale_while_revalidate: strategy.stale_window(),
                tags: &tags,
            },
        );
        Ok(())
    }

    /// Remove `key` without recording an invalidation.
    pub fn delete(&self, key: &str) -> bool {
        self.store.delete(key)
    }

    /// Return the cached value for `key` or produce, cache and return it.
    ///
    /// Concurrent callers for a cold key share a single `producer` run.
    /// Producer failures reach every waiter and are never cached.
    ///
    /// # Panics
    ///
    /// Panics when `strategy_name` is not registered.
    pub async fn cached_query<T, E, F, Fut>(
        &self,
        key: &str,
        strategy_name: &str,
        tags: &[&str],
        producer: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: StdError + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.cached_query_with_status(key, strategy_name, tags, producer)
            .await
            .map(|(value, _)| value)
    }

    /// [`cached_query`](Self::cached_query) that also reports how the value was served.
    #[instrument(skip_all, fields(key = key, strategy = strategy_name))]
    pub async fn cached_query_with_status<T, E, F, Fut>(
        &self,
        key: &str,
        strategy_name: &str,
        tags: &[&str],
        producer: F,
    ) -> Result<(T, CacheStatus), CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: StdError + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let strategy = self.strategies.resolve(strategy_name).clone();
        let route = route::current();
        let started = Instant::now();

        match self.store.lookup(key) {
            Lookup::Fresh(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    debug!(outcome = "hit", "serving cached value");
                    self.record(EventKind::Hit, &strategy, &route, started.elapsed(), None);
                    return Ok((value, CacheStatus::Hit));
                }
                Err(err) => self.discard_undecodable(key, Some(&strategy), &route, &err),
            },
            Lookup::Stale(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    debug!(outcome = "stale", "serving stale value, refreshing in background");
                    self.record(
                        EventKind::Hit,
                        &strategy,
                        &route,
                        started.elapsed(),
                        Some(STALE_DETAIL.to_owned()),
                    );
                    let work = self.flight_work(key, strategy, tags, producer, route);
                    drop(self.flights.join(key, work));
                    return Ok((value, CacheStatus::Stale));
                }
                Err(err) => self.discard_undecodable(key, Some(&strategy), &route, &err),
            },
            Lookup::Absent => {}
        }

        debug!(outcome = "miss", "resolving through single flight");
        self.record(EventKind::Miss, &strategy, &route, started.elapsed(), None);
        let work = self.flight_work(key, strategy, tags, producer, route);
        let bytes = self.flights.run(key, work).await?;
        let value = serde_json::from_slice::<T>(&bytes)
            .map_err(|err| CacheError::Decode(Arc::new(err)))?;
        Ok((value, CacheStatus::Miss))
    }

    /// Build the work run by a single flight: produce, encode, store.
    fn flight_work<T, E, F, Fut>(
        &self,
        key: &str,
        strategy: Strategy,
        tags: &[&str],
        producer: F,
        route: String,
    ) -> impl FnOnce() -> FlightTask
    where
        T: Serialize + Send + 'static,
        E: StdError + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = key.to_owned();
        let tags: Vec<String> = tags.iter().map(|t| (*t).to_owned()).collect();
        let store = self.store.clone();
        let analytics = self.analytics.clone();
        let clock = self.clock.clone();

        move || {
            let fill = store.begin_fill(&key, &tags);
            Box::pin(async move {
                let started = Instant::now();
                let produced = producer().await;
                let elapsed = started.elapsed();
                histogram!(METRIC_CACHE_PRODUCER_MS, "strategy" => strategy.name().to_owned())
                    .record(elapsed.as_secs_f64() * 1000.0);

                let outcome = produced
                    .map_err(CacheError::producer)
                    .and_then(|value| Ok(Bytes::from(serde_json::to_vec(&value)?)));

                match outcome {
                    Ok(bytes) => {
                        let stored = fill.complete(
                            bytes.clone(),
                            EntrySpec {
                                ttl: strategy.ttl(),
                                stale_while_revalidate: strategy.stale_window(),
                                tags: &tags,
                            },
                        );
                        debug!(key = %key, stored = stored.stored, "producer completed");
                        Ok(bytes)
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "producer failed; nothing cached");
                        analytics.record(
                            AnalyticsEvent::new(EventKind::Error, clock.now(), route)
                                .with_strategy(strategy.name())
                                .with_response_time(elapsed)
                                .with_detail(err.to_string()),
                        );
                        Err(err)
                    }
                }
            }) as FlightTask
        }
    }

    /// Serialize `value` with the headers of `strategy_name`.
    ///
    /// # Panics
    ///
    /// Panics when `strategy_name` is not registered.
    pub fn create_response<T>(&self, value: &T, strategy_name: &str) -> Response
    where
        T: Serialize,
    {
        create_response(value, self.strategies.resolve(strategy_name))
    }

    /// [`cached_query`](Self::cached_query) rendered as a response with an
    /// `x-cache` header.
    pub async fn cached_response<T, E, F, Fut>(
        &self,
        key: &str,
        strategy_name: &str,
        tags: &[&str],
        producer: F,
    ) -> Result<Response, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: StdError + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (value, status) = self
            .cached_query_with_status(key, strategy_name, tags, producer)
            .await?;
        Ok(with_cache_status(
            self.create_response(&value, strategy_name),
            status,
        ))
    }

    pub fn purge_key(&self, key: &str) -> PurgeReport {
        self.invalidator.purge_key(key)
    }

    pub fn purge_keys(&self, keys: &[String]) -> PurgeReport {
        self.invalidator.purge_keys(keys)
    }

    /// Invalidate every entry tagged with any of `tags`. Call after writes.
    pub async fn purge_by_tags<S>(&self, tags: &[S]) -> PurgeReport
    where
        S: AsRef<str>,
    {
        let tags: Vec<String> = tags.iter().map(|t| t.as_ref().to_owned()).collect();
        self.invalidator.purge_by_tags(&tags).await
    }

    /// Drop everything. Reserved for operator resets.
    pub async fn purge_all(&self) -> PurgeReport {
        self.invalidator.purge_all().await
    }

    /// Remove expired entries now.
    pub fn sweep_expired(&self) -> usize {
        let removed = self.store.sweep_expired();
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            store: self.store.stats(),
            in_flight: self.flights.in_flight(),
            strategies: self.strategies.iter().map(StrategySummary::from).collect(),
            edge_purge_enabled: self.invalidator.has_edge(),
        }
    }

    pub fn analytics(&self) -> &AnalyticsRecorder {
        &self.analytics
    }

    /// Aggregated analytics with the configured top-route count.
    pub fn analytics_snapshot(&self, recent_limit: Option<usize>) -> AnalyticsSnapshot {
        self.analytics.snapshot(
            recent_limit.unwrap_or(self.config.analytics_recent_limit),
            self.config.analytics_top_routes,
        )
    }

    pub fn reset_analytics(&self) {
        self.analytics.reset();
    }

    fn record(
        &self,
        kind: EventKind,
        strategy: &Strategy,
        route: &str,
        elapsed: Duration,
        detail: Option<String>,
    ) {
        let mut event = AnalyticsEvent::new(kind, self.clock.now(), route)
            .with_strategy(strategy.name())
            .with_response_time(elapsed);
        event.detail = detail;
        self.analytics.record(event);
    }

    fn discard_undecodable(
        &self,
        key: &str,
        strategy: Option<&Strategy>,
        route: &str,
        err: &serde_json::Error,
    ) {
        warn!(key, error = %err, "cached value failed to decode; dropping entry");
        self.store.delete(key);
        let mut event = AnalyticsEvent::new(EventKind::Error, self.clock.now(), route)
            .with_detail(format!("decode failed: {err}"));
        event.strategy = strategy.map(|s| s.name().to_owned());
        self.analytics.record(event);
    }
}

type FlightTask = futures::future::BoxFuture<'static, Result<Bytes, CacheError>>;

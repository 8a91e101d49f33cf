//! Named caching strategies.
//!
//! A strategy fixes how long a value lives, which `Cache-Control` header the
//! response carries, whether an edge tier may also keep it, and how long a
//! stale copy may still be served while it is refreshed.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::http::HeaderValue;

use super::error::CacheError;

pub const STATIC: &str = "STATIC";
pub const API: &str = "API";
pub const SHORT: &str = "SHORT";
pub const PRIVATE: &str = "PRIVATE";
pub const REALTIME: &str = "REALTIME";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    name: String,
    ttl: Duration,
    cache_control: HeaderValue,
    edge_cacheable: bool,
    stale_while_revalidate: Option<Duration>,
}

impl Strategy {
    /// Build a strategy, validating the TTL and header template.
    pub fn new(
        name: impl Into<String>,
        ttl: Duration,
        cache_control: &str,
    ) -> Result<Self, CacheError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CacheError::configuration("strategy name must not be empty"));
        }
        if ttl.is_zero() {
            return Err(CacheError::configuration(format!(
                "strategy `{name}` must have a positive ttl"
            )));
        }
        let cache_control = HeaderValue::from_str(cache_control).map_err(|err| {
            CacheError::configuration(format!(
                "strategy `{name}` has an invalid cache-control value: {err}"
            ))
        })?;

        Ok(Self {
            name,
            ttl,
            cache_control,
            edge_cacheable: false,
            stale_while_revalidate: None,
        })
    }

    pub fn edge_cacheable(mut self, edge_cacheable: bool) -> Self {
        self.edge_cacheable = edge_cacheable;
        self
    }

    pub fn stale_while_revalidate(mut self, window: Option<Duration>) -> Self {
        self.stale_while_revalidate = window.filter(|w| !w.is_zero());
        self
    }

    fn builtin(
        name: &'static str,
        ttl: Duration,
        cache_control: &'static str,
        edge_cacheable: bool,
        stale_while_revalidate: Option<Duration>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            ttl,
            cache_control: HeaderValue::from_static(cache_control),
            edge_cacheable,
            stale_while_revalidate,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn cache_control(&self) -> &HeaderValue {
        &self.cache_control
    }

    pub fn is_edge_cacheable(&self) -> bool {
        self.edge_cacheable
    }

    pub fn stale_window(&self) -> Option<Duration> {
        self.stale_while_revalidate
    }
}

/// The strategies every deployment starts with.
pub fn builtin_strategies() -> Vec<Strategy> {
    vec![
        Strategy::builtin(
            STATIC,
            Duration::from_secs(24 * 60 * 60),
            "public, max-age=86400, immutable",
            true,
            None,
        ),
        Strategy::builtin(
            API,
            Duration::from_secs(5 * 60),
            "public, max-age=300, stale-while-revalidate=60",
            true,
            Some(Duration::from_secs(60)),
        ),
        Strategy::builtin(
            SHORT,
            Duration::from_secs(60),
            "public, max-age=60, must-revalidate",
            true,
            None,
        ),
        Strategy::builtin(
            PRIVATE,
            Duration::from_secs(60),
            "private, no-store",
            false,
            None,
        ),
        Strategy::builtin(
            REALTIME,
            Duration::from_secs(5),
            "no-cache, must-revalidate",
            false,
            None,
        ),
    ]
}

/// Startup-time table of strategies, frozen once handed to the engine.
#[derive(Debug, Clone, Default)]
pub struct StrategyRegistry {
    strategies: BTreeMap<String, Strategy>,
}

impl StrategyRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with [`builtin_strategies`].
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for strategy in builtin_strategies() {
            registry.replace(strategy);
        }
        registry
    }

    /// Add a strategy. Registering a name twice is a configuration error.
    pub fn register(&mut self, strategy: Strategy) -> Result<(), CacheError> {
        if self.strategies.contains_key(strategy.name()) {
            return Err(CacheError::configuration(format!(
                "strategy `{}` is already registered",
                strategy.name()
            )));
        }
        self.strategies.insert(strategy.name.clone(), strategy);
        Ok(())
    }

    /// Add or overwrite a strategy. Used when configuration redefines a built-in.
    pub fn replace(&mut self, strategy: Strategy) -> Option<Strategy> {
        self.strategies.insert(strategy.name.clone(), strategy)
    }

    /// Look up a strategy that must exist.
    ///
    /// # Panics
    ///
    /// Panics when `name` was never registered. Serving a response under the
    /// wrong cache policy is a caller bug, not a runtime condition.
    pub fn resolve(&self, name: &str) -> &Strategy {
        match self.strategies.get(name) {
            Some(strategy) => strategy,
            None => panic!(
                "unknown cache strategy `{name}` (registered: {})",
                self.names().join(", ")
            ),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Strategy> {
        self.strategies.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.strategies.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Strategy> {
        self.strategies.values()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

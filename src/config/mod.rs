//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::HashSet,
    net::SocketAddr,
    num::NonZeroUsize,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{Strategy, StrategyRegistry};

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "unicache";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_CAPACITY: u64 = 10_000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5_000;
const DEFAULT_ANALYTICS_CAPACITY: u64 = 10_000;
const DEFAULT_ANALYTICS_RECENT_LIMIT: usize = 50;
const DEFAULT_ANALYTICS_TOP_ROUTES: usize = 10;
const DEFAULT_EDGE_TIMEOUT_MS: u64 = 5_000;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub edge: EdgeSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub capacity: NonZeroUsize,
    pub max_bytes: Option<NonZeroUsize>,
    pub sweep_interval: Duration,
    pub analytics_capacity: NonZeroUsize,
    pub analytics_recent_limit: usize,
    pub analytics_top_routes: usize,
    /// Strategies declared in configuration, validated. A name matching a
    /// built-in replaces it.
    pub strategies: Vec<Strategy>,
}

impl CacheSettings {
    /// Built-in strategies overlaid with the configured ones.
    pub fn strategy_registry(&self) -> StrategyRegistry {
        let mut registry = StrategyRegistry::with_builtins();
        for strategy in &self.strategies {
            registry.replace(strategy.clone());
        }
        registry
    }
}

#[derive(Debug, Clone)]
pub struct EdgeSettings {
    pub purge_url: Option<Url>,
    pub api_token: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("UNICACHE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::CheckConfig) | None => {}
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    edge: RawEdgeSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(capacity) = overrides.cache_capacity {
            self.cache.capacity = Some(capacity);
        }
        if let Some(max_bytes) = overrides.cache_max_bytes {
            self.cache.max_bytes = Some(max_bytes);
        }
        if let Some(interval) = overrides.cache_sweep_interval_ms {
            self.cache.sweep_interval_ms = Some(interval);
        }
        if let Some(capacity) = overrides.analytics_capacity {
            self.cache.analytics_capacity = Some(capacity);
        }
        if let Some(url) = overrides.edge_purge_url.as_ref() {
            self.edge.purge_url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            edge,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let edge = build_edge_settings(edge)?;

        Ok(Self {
            server,
            logging,
            cache,
            edge,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let capacity = non_zero_usize(
        cache.capacity.unwrap_or(DEFAULT_CACHE_CAPACITY),
        "cache.capacity",
    )?;

    let max_bytes = cache
        .max_bytes
        .map(|value| non_zero_usize(value, "cache.max_bytes"))
        .transpose()?;

    let sweep_interval_ms = cache.sweep_interval_ms.unwrap_or(DEFAULT_SWEEP_INTERVAL_MS);
    if sweep_interval_ms == 0 {
        return Err(LoadError::invalid(
            "cache.sweep_interval_ms",
            "must be greater than zero",
        ));
    }

    let analytics_capacity = non_zero_usize(
        cache
            .analytics_capacity
            .unwrap_or(DEFAULT_ANALYTICS_CAPACITY),
        "cache.analytics_capacity",
    )?;

    let strategies = build_strategies(cache.strategies)?;

    Ok(CacheSettings {
        capacity,
        max_bytes,
        sweep_interval: Duration::from_millis(sweep_interval_ms),
        analytics_capacity,
        analytics_recent_limit: cache
            .analytics_recent_limit
            .unwrap_or(DEFAULT_ANALYTICS_RECENT_LIMIT),
        analytics_top_routes: cache
            .analytics_top_routes
            .unwrap_or(DEFAULT_ANALYTICS_TOP_ROUTES),
        strategies,
    })
}

fn build_strategies(raw: Vec<RawStrategySettings>) -> Result<Vec<Strategy>, LoadError> {
    let mut seen = HashSet::new();
    let mut strategies = Vec::with_capacity(raw.len());

    for entry in raw {
        let name = entry
            .name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| LoadError::invalid("cache.strategies.name", "must not be empty"))?;

        if !seen.insert(name.clone()) {
            return Err(LoadError::invalid(
                "cache.strategies",
                format!("strategy `{name}` is declared more than once"),
            ));
        }

        let ttl_ms = entry.ttl_ms.ok_or_else(|| {
            LoadError::invalid("cache.strategies.ttl_ms", format!("missing for `{name}`"))
        })?;
        let cache_control = entry.cache_control.ok_or_else(|| {
            LoadError::invalid(
                "cache.strategies.cache_control",
                format!("missing for `{name}`"),
            )
        })?;

        let strategy = Strategy::new(name, Duration::from_millis(ttl_ms), &cache_control)
            .map_err(|err| LoadError::invalid("cache.strategies", err.to_string()))?
            .edge_cacheable(entry.edge_cacheable.unwrap_or(false))
            .stale_while_revalidate(entry.stale_while_revalidate_ms.map(Duration::from_millis));

        strategies.push(strategy);
    }

    Ok(strategies)
}

fn build_edge_settings(edge: RawEdgeSettings) -> Result<EdgeSettings, LoadError> {
    let purge_url = edge
        .purge_url
        .and_then(|value| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .map(|value| {
            Url::parse(&value)
                .map_err(|err| LoadError::invalid("edge.purge_url", format!("invalid url: {err}")))
        })
        .transpose()?;

    if let Some(url) = purge_url.as_ref()
        && !matches!(url.scheme(), "http" | "https")
    {
        return Err(LoadError::invalid(
            "edge.purge_url",
            "scheme must be http or https",
        ));
    }

    let api_token = edge.api_token.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let timeout_ms = edge.timeout_ms.unwrap_or(DEFAULT_EDGE_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "edge.timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(EdgeSettings {
        purge_url,
        api_token,
        timeout: Duration::from_millis(timeout_ms),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    capacity: Option<u64>,
    max_bytes: Option<u64>,
    sweep_interval_ms: Option<u64>,
    analytics_capacity: Option<u64>,
    analytics_recent_limit: Option<usize>,
    analytics_top_routes: Option<usize>,
    strategies: Vec<RawStrategySettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStrategySettings {
    name: Option<String>,
    ttl_ms: Option<u64>,
    cache_control: Option<String>,
    edge_cacheable: Option<bool>,
    stale_while_revalidate_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEdgeSettings {
    purge_url: Option<String>,
    api_token: Option<String>,
    timeout_ms: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the unicache binary.
#[derive(Debug, Parser)]
#[command(name = "unicache", version, about = "Tag-indexed response cache service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "UNICACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the cache operator service.
    Serve(Box<ServeArgs>),
    /// Validate configuration and print the resolved strategies.
    #[command(name = "check-config")]
    CheckConfig,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the operator listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the operator listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the maximum number of cache entries.
    #[arg(long = "cache-capacity", value_name = "COUNT")]
    pub cache_capacity: Option<u64>,

    /// Override the approximate byte budget of the cache.
    #[arg(long = "cache-max-bytes", value_name = "BYTES")]
    pub cache_max_bytes: Option<u64>,

    /// Override the expiry sweep interval.
    #[arg(long = "cache-sweep-interval-ms", value_name = "MILLISECONDS")]
    pub cache_sweep_interval_ms: Option<u64>,

    /// Override the analytics ring buffer size.
    #[arg(long = "analytics-capacity", value_name = "COUNT")]
    pub analytics_capacity: Option<u64>,

    /// Override the edge purge endpoint.
    #[arg(long = "edge-purge-url", value_name = "URL")]
    pub edge_purge_url: Option<String>,
}

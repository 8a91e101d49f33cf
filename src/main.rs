use std::{future::IntoFuture, process, sync::Arc};

use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use unicache::{
    application::error::AppError,
    cache::{CacheConfig, CacheEngine, EdgePurger, HttpEdgePurger, StrategySummary, spawn_sweeper},
    config,
    infra::{error::InfraError, http, telemetry},
};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    match command {
        config::Command::Serve(_) => {
            telemetry::init(&settings.logging)?;
            run_serve(settings).await
        }
        config::Command::CheckConfig => run_check_config(&settings),
    }
}

fn run_check_config(settings: &config::Settings) -> Result<(), AppError> {
    let registry = settings.cache.strategy_registry();
    let summaries: Vec<StrategySummary> = registry.iter().map(StrategySummary::from).collect();
    let rendered = serde_json::to_string_pretty(&summaries)
        .map_err(|err| AppError::unexpected(format!("failed to render strategies: {err}")))?;
    println!("{rendered}");
    Ok(())
}

fn build_engine(settings: &config::Settings) -> Result<CacheEngine, AppError> {
    let mut builder = CacheEngine::builder(CacheConfig::from(&settings.cache))
        .strategies(settings.cache.strategy_registry());

    if let Some(url) = settings.edge.purge_url.clone() {
        let purger = HttpEdgePurger::new(
            url,
            settings.edge.api_token.as_deref(),
            settings.edge.timeout,
        )
        .map_err(|err| InfraError::configuration(format!("edge purger: {err}")))?;
        info!(url = %purger.url(), "edge purge enabled");
        builder = builder.edge_purger(Arc::new(purger) as Arc<dyn EdgePurger>);
    }

    Ok(builder.build())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let engine = Arc::new(build_engine(&settings)?);
    let sweeper = spawn_sweeper(engine.clone(), settings.cache.sweep_interval);

    info!(
        capacity = settings.cache.capacity.get(),
        strategies = engine.strategies().len(),
        "cache engine ready"
    );

    let result = serve_http(&settings, engine).await;

    sweeper.abort();
    let _ = sweeper.await;

    result
}

async fn serve_http(settings: &config::Settings, engine: Arc<CacheEngine>) -> Result<(), AppError> {
    let router = http::build_operator_router(engine);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "operator listener bound");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .into_future();

    let grace = settings.server.graceful_shutdown;
    let drain_deadline = async move {
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        () = drain_deadline => {
            warn!(grace_secs = grace.as_secs(), "graceful shutdown timed out");
        }
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => {
            error!(error = %err, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}

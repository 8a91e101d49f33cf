//! Operator HTTP surface over a shared [`CacheEngine`].

pub mod error;
pub mod handlers;
pub mod middleware;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use crate::cache::{CacheEngine, route_context_layer};

use self::middleware::{log_responses, set_request_context};

pub fn build_operator_router(engine: Arc<CacheEngine>) -> Router {
    Router::new()
        .route("/cache/health", get(handlers::health))
        .route("/cache/stats", get(handlers::stats))
        .route("/cache/analytics", get(handlers::analytics))
        .route("/cache/analytics/reset", post(handlers::reset_analytics))
        .route("/cache/purge", post(handlers::purge))
        .route("/cache/purge-all", post(handlers::purge_all))
        .route_layer(axum_middleware::from_fn(route_context_layer))
        .with_state(engine)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

//! Operator endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use tracing::info;

use crate::cache::{AnalyticsSnapshot, CacheEngine, EngineStats, PurgeReport};

use super::error::ApiError;

const MAX_RECENT_EVENTS: usize = 1_000;

#[derive(Debug, Default, Deserialize)]
pub struct AnalyticsQuery {
    pub recent: Option<usize>,
}

/// Body of `POST /cache/purge`. Exactly one of the two lists must be non-empty.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PurgeRequest {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub keys: Vec<String>,
}

pub async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub async fn analytics(
    State(engine): State<Arc<CacheEngine>>,
    query: Result<Query<AnalyticsQuery>, QueryRejection>,
) -> Result<Json<AnalyticsSnapshot>, ApiError> {
    let Query(query) = query?;
    let recent = query.recent.map(|limit| limit.min(MAX_RECENT_EVENTS));
    Ok(Json(engine.analytics_snapshot(recent)))
}

pub async fn stats(State(engine): State<Arc<CacheEngine>>) -> Json<EngineStats> {
    Json(engine.stats())
}

pub async fn purge(
    State(engine): State<Arc<CacheEngine>>,
    payload: Result<Json<PurgeRequest>, JsonRejection>,
) -> Result<Json<PurgeReport>, ApiError> {
    let Json(request) = payload?;
    let tags = normalize(request.tags);
    let keys = normalize(request.keys);

    let report = match (tags.is_empty(), keys.is_empty()) {
        (false, true) => engine.purge_by_tags(&tags).await,
        (true, false) => engine.purge_keys(&keys),
        (true, true) => {
            return Err(ApiError::invalid_input(
                "nothing to purge",
                Some("provide a non-empty `tags` or `keys` list".to_string()),
            ));
        }
        (false, false) => {
            return Err(ApiError::invalid_input(
                "ambiguous purge request",
                Some("send either `tags` or `keys`, not both".to_string()),
            ));
        }
    };

    Ok(Json(report))
}

pub async fn purge_all(State(engine): State<Arc<CacheEngine>>) -> Json<PurgeReport> {
    Json(engine.purge_all().await)
}

pub async fn reset_analytics(State(engine): State<Arc<CacheEngine>>) -> StatusCode {
    engine.reset_analytics();
    info!("analytics reset by operator");
    StatusCode::NO_CONTENT
}

fn normalize(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .collect()
}

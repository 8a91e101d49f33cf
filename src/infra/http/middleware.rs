use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, Request},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;
use crate::cache::{X_CACHE, X_CACHE_STRATEGY};

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);
    response
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis();
    let cache = CacheContext::from_headers(response.headers());

    if status.is_client_error() || status.is_server_error() {
        let report = response.extensions_mut().remove::<ErrorReport>();
        let (source, messages) = match report {
            Some(report) => (report.source, report.messages),
            None => ("unknown", Vec::new()),
        };
        let detail = messages
            .first()
            .cloned()
            .unwrap_or_else(|| "no diagnostic available".to_string());

        if status.is_server_error() {
            error!(
                target = "unicache::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                elapsed_ms = elapsed_ms,
                cache = cache.status.as_deref(),
                strategy = cache.strategy.as_deref(),
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                "request failed",
            );
        } else {
            warn!(
                target = "unicache::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                elapsed_ms = elapsed_ms,
                cache = cache.status.as_deref(),
                strategy = cache.strategy.as_deref(),
                source = source,
                detail = %detail,
                request_id = request_id,
                "client request error",
            );
        }
    } else if cache.status.is_some() {
        debug!(
            target = "unicache::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms = elapsed_ms,
            cache = cache.status.as_deref(),
            strategy = cache.strategy.as_deref(),
            request_id = request_id,
            "cached response served",
        );
    }

    response
}

/// How the cache served a response, read back from its headers.
#[derive(Debug, Default, PartialEq, Eq)]
struct CacheContext {
    status: Option<String>,
    strategy: Option<String>,
}

impl CacheContext {
    fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        Self {
            status: read(&X_CACHE),
            strategy: read(&X_CACHE_STRATEGY),
        }
    }
}

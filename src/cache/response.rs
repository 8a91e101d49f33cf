//! Response builder: attaches strategy headers to a resolved value.

use axum::{
    Json,
    http::{HeaderName, HeaderValue, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use super::strategy::Strategy;

pub const X_EDGE_CACHEABLE: HeaderName = HeaderName::from_static("x-edge-cacheable");
pub const X_CACHE_STRATEGY: HeaderName = HeaderName::from_static("x-cache-strategy");
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// How a cached response was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Stale,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Stale => "STALE",
            Self::Miss => "MISS",
        }
    }
}

/// Serialize `value` as JSON and tag it with the strategy's cache headers.
pub fn create_response<T>(value: &T, strategy: &Strategy) -> Response
where
    T: Serialize,
{
    let mut response = Json(value).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, strategy.cache_control().clone());
    if strategy.is_edge_cacheable() {
        headers.insert(X_EDGE_CACHEABLE, HeaderValue::from_static("true"));
    }
    if let Ok(name) = HeaderValue::from_str(strategy.name()) {
        headers.insert(X_CACHE_STRATEGY, name);
    }
    response
}

/// Mark a response with how the cache served it.
pub fn with_cache_status(mut response: Response, status: CacheStatus) -> Response {
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static(status.as_str()));
    response
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::cache::strategy::{PRIVATE, STATIC, StrategyRegistry};

    #[test]
    fn attaches_cache_control_verbatim() {
        let registry = StrategyRegistry::with_builtins();
        let response = create_response(&json!({"ok": true}), registry.resolve(STATIC));

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(
            headers.get(header::CACHE_CONTROL).expect("cache-control set"),
            "public, max-age=86400, immutable"
        );
        assert_eq!(headers.get(&X_EDGE_CACHEABLE).expect("edge header set"), "true");
        assert_eq!(headers.get(&X_CACHE_STRATEGY).expect("strategy header set"), STATIC);
        assert_eq!(
            headers.get(header::CONTENT_TYPE).expect("content-type set"),
            "application/json"
        );
    }

    #[test]
    fn private_strategy_is_not_edge_cacheable() {
        let registry = StrategyRegistry::with_builtins();
        let response = create_response(&vec![1, 2, 3], registry.resolve(PRIVATE));

        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).expect("cache-control set"),
            "private, no-store"
        );
        assert!(response.headers().get(&X_EDGE_CACHEABLE).is_none());
    }

    #[test]
    fn custom_template_is_passed_through() {
        let strategy = Strategy::new("FEED", Duration::from_secs(30), "public, s-maxage=30")
            .expect("valid strategy");
        let response = with_cache_status(create_response(&"ok", &strategy), CacheStatus::Stale);

        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).expect("cache-control set"),
            "public, s-maxage=30"
        );
        assert_eq!(response.headers().get(&X_CACHE).expect("x-cache set"), "STALE");
    }
}

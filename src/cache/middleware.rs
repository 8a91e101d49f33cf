//! Request middleware that scopes the route context.

use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::Next,
    response::Response,
};
use tracing::instrument;

use super::route;

/// Attribute cache events raised while handling the request to its route.
///
/// Uses the matched route template (`/api/events/{id}`) when available so
/// per-route analytics do not fragment by path parameter; falls back to the
/// raw path.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn route_context_layer(request: Request<Body>, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());

    route::scope(route, next.run(request)).await
}

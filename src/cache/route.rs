//! Route context for analytics events.
//!
//! Handlers run inside [`scope`] (usually via
//! [`route_context_layer`](super::route_context_layer)) so cache events can be
//! attributed to the route that triggered them without threading it through
//! every call.

use std::future::Future;

/// Route reported when no scope is active.
pub const UNKNOWN_ROUTE: &str = "unknown";

tokio::task_local! {
    static ROUTE: String;
}

/// Run `future` with `route` as the current route.
pub async fn scope<F>(route: impl Into<String>, future: F) -> F::Output
where
    F: Future,
{
    ROUTE.scope(route.into(), future).await
}

/// The route of the enclosing scope, or [`UNKNOWN_ROUTE`].
///
/// Task-locals are not inherited by spawned tasks; capture the route before
/// spawning.
pub fn current() -> String {
    ROUTE
        .try_with(Clone::clone)
        .unwrap_or_else(|_| UNKNOWN_ROUTE.to_owned())
}

//! Single-flight coordination for cache misses.
//!
//! Concurrent callers asking for the same key share one execution of the
//! work. The work runs in its own tokio task, so a caller that stops waiting
//! never cancels it for the others, and its slot is released before the
//! result is handed out.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::debug;

use super::error::CacheError;

type FlightFuture<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

/// In-flight work keyed by cache key.
pub struct SingleFlight<T> {
    flights: Arc<DashMap<String, FlightFuture<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
        }
    }
}

/// Whether a caller started the work or joined a running flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Follower,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Await the flight for `key`, starting it with `work` if none is running.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let (_, flight) = self.join(key, work);
        flight.await
    }

    /// Join or start the flight for `key` without waiting for it.
    ///
    /// Dropping the returned future leaves the work running; this is how
    /// background refreshes are started.
    pub fn join<F, Fut>(&self, key: &str, work: F) -> (FlightRole, FlightFuture<T>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        match self.flights.entry(key.to_owned()) {
            Entry::Occupied(occupied) => {
                debug!(key, "joining in-flight producer");
                (FlightRole::Follower, occupied.get().clone())
            }
            Entry::Vacant(vacant) => {
                let guard = FlightGuard {
                    key: key.to_owned(),
                    flights: Arc::clone(&self.flights),
                };
                let task = work();
                let handle = tokio::spawn(async move {
                    let _guard = guard;
                    task.await
                });
                let flight = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(err) => Err(CacheError::aborted(err.to_string())),
                    }
                }
                .boxed()
                .shared();
                vacant.insert(flight.clone());
                (FlightRole::Leader, flight)
            }
        }
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.flights.contains_key(key)
    }

    /// Number of keys with running work.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

/// Releases the flight slot when the work finishes, fails or panics.
struct FlightGuard<T> {
    key: String,
    flights: Arc<DashMap<String, FlightFuture<T>>>,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.flights.remove(&self.key);
    }
}

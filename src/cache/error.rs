use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Producer failure shared by every waiter of a single flight.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache configuration error: {message}")]
    Configuration { message: String },
    #[error("producer failed: {0}")]
    Producer(#[source] SharedError),
    #[error("producer task aborted: {message}")]
    Aborted { message: String },
    #[error("failed to encode value for cache: {0}")]
    Encode(#[source] Arc<serde_json::Error>),
    #[error("failed to decode cached value: {0}")]
    Decode(#[source] Arc<serde_json::Error>),
}

impl CacheError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn producer<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Producer(Arc::new(error))
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }

    /// Borrow the producer's original error as its concrete type.
    pub fn producer_error<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match self {
            Self::Producer(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub fn is_producer(&self) -> bool {
        matches!(self, Self::Producer(_))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(error: serde_json::Error) -> Self {
        Self::Encode(Arc::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error, PartialEq)]
    #[error("database unavailable")]
    struct DbDown;

    #[test]
    fn producer_error_keeps_original() {
        let error = CacheError::producer(DbDown);
        assert!(error.is_producer());
        assert_eq!(error.producer_error::<DbDown>(), Some(&DbDown));
        assert_eq!(error.to_string(), "producer failed: database unavailable");

        let source = error.source().expect("producer error has a source");
        assert_eq!(source.to_string(), "database unavailable");
    }

    #[test]
    fn clones_share_the_same_failure() {
        let error = CacheError::producer(DbDown);
        let cloned = error.clone();
        match (&error, &cloned) {
            (CacheError::Producer(a), CacheError::Producer(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected producer errors"),
        }
    }
}

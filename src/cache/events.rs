//! Cache analytics events.

use std::time::Duration;

use serde::{Serialize, Serializer};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

/// What happened to a cache request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Hit,
    Miss,
    Invalidation,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Invalidation => "invalidation",
            Self::Error => "error",
        }
    }
}

/// A single recorded cache event. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsEvent {
    /// Unique identifier (UUIDv4).
    pub id: Uuid,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: OffsetDateTime,
    pub kind: EventKind,
    pub strategy: Option<String>,
    pub route: String,
    pub response_time_ms: Option<u64>,
    /// Keys removed by an invalidation.
    pub affected_keys: Option<u64>,
    /// Free-form context: the purged tag, `stale`, an error message.
    pub detail: Option<String>,
}

impl AnalyticsEvent {
    pub fn new(kind: EventKind, timestamp: OffsetDateTime, route: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            kind,
            strategy: None,
            route: route.into(),
            response_time_ms: None,
            affected_keys: None,
            detail: None,
        }
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn with_response_time(mut self, elapsed: Duration) -> Self {
        self.response_time_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_affected_keys(mut self, count: usize) -> Self {
        self.affected_keys = Some(count as u64);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

fn serialize_timestamp<S>(timestamp: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let formatted = timestamp
        .format(&Rfc3339)
        .map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&formatted)
}

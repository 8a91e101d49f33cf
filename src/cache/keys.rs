//! Cache key construction.
//!
//! Keys are plain strings so callers can pick any scheme; [`CacheKey`] gives
//! handlers a consistent `namespace:name=value` layout.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    rendered: String,
}

impl CacheKey {
    pub fn new(namespace: &str) -> Self {
        Self {
            rendered: namespace.to_owned(),
        }
    }

    /// Append a `name=value` segment.
    pub fn part(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.rendered.push(':');
        self.rendered.push_str(name);
        self.rendered.push('=');
        self.rendered.push_str(&value.to_string());
        self
    }

    /// Append a segment holding the hash of `value`, for long or structured input.
    pub fn hashed_part<T: Hash>(self, name: &str, value: &T) -> Self {
        self.part(name, format_args!("{:016x}", hash_value(value)))
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.rendered
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.rendered
    }
}

/// Compute a hash for any hashable value.
pub fn hash_value<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

//! Bidirectional tag index.
//!
//! Tracks `tag -> keys` and `key -> tags` so a write can find every cached
//! entry it affects. The index is owned by [`EntryStore`](super::EntryStore)
//! and mutated only inside the store's critical section.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct TagIndex {
    /// Maps tags to every live key annotated with them
    tag_to_keys: HashMap<String, HashSet<String>>,
    /// Maps live keys to the tags they were stored under
    key_to_tags: HashMap<String, HashSet<String>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `key` under `tags`, replacing any tags it had before.
    pub fn add_tags<I, S>(&mut self, key: &str, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.remove_key(key);

        let tags: HashSet<String> = tags.into_iter().map(|t| t.as_ref().to_owned()).collect();
        if tags.is_empty() {
            return;
        }

        for tag in &tags {
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_owned());
        }
        self.key_to_tags.insert(key.to_owned(), tags);
    }

    /// Strip `key` from every tag bucket, dropping buckets left empty.
    pub fn remove_key(&mut self, key: &str) {
        let Some(tags) = self.key_to_tags.remove(key) else {
            return;
        };

        for tag in tags {
            if let Some(keys) = self.tag_to_keys.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(&tag);
                }
            }
        }
    }

    /// Union of the keys indexed under any of `tags`.
    pub fn keys_for_tags<I, S>(&self, tags: I) -> HashSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keys = HashSet::new();
        for tag in tags {
            if let Some(bucket) = self.tag_to_keys.get(tag.as_ref()) {
                keys.extend(bucket.iter().cloned());
            }
        }
        keys
    }

    pub fn keys_for_tag(&self, tag: &str) -> HashSet<String> {
        self.tag_to_keys.get(tag).cloned().unwrap_or_default()
    }

    pub fn tags_for_key(&self, key: &str) -> HashSet<String> {
        self.key_to_tags.get(key).cloned().unwrap_or_default()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.key_to_tags.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.tag_to_keys.clear();
        self.key_to_tags.clear();
    }

    /// Number of non-empty tag buckets.
    pub fn tag_count(&self) -> usize {
        self.tag_to_keys.len()
    }

    /// Number of keys carrying at least one tag.
    pub fn key_count(&self) -> usize {
        self.key_to_tags.len()
    }
}

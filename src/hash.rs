//! Cache of bucket hashes learned from responses, keyed by route template.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// A bucket hash announced by the API for a route template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketHash {
    /// The opaque bucket identifier.
    pub value: String,
    /// When a request last used this hash.
    pub last_access: Instant,
}

/// Maps `METHOD:bucket_route` keys to the bucket hash the API assigned.
#[derive(Debug, Default)]
pub(crate) struct HashCache {
    entries: DashMap<String, BucketHash>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the hash for `key`, refreshing its last access time.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.get_mut(key).map(|mut entry| {
            entry.last_access = Instant::now();
            entry.value.clone()
        })
    }

    /// Record the hash for `key`. Returns the hash it replaced, if it differed.
    pub fn set(&self, key: &str, value: &str) -> Option<String> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.last_access = now;
                (entry.value != value).then(|| std::mem::replace(&mut entry.value, value.to_string()))
            }
            None => {
                self.entries.insert(
                    key.to_string(),
                    BucketHash {
                        value: value.to_string(),
                        last_access: now,
                    },
                );
                None
            }
        }
    }

    /// Remove every entry that has not been accessed within `lifetime`.
    pub fn sweep(&self, lifetime: Duration) -> Vec<(String, BucketHash)> {
        let now = Instant::now();
        let mut swept = Vec::new();
        self.entries.retain(|key, hash| {
            let keep = now.saturating_duration_since(hash.last_access) <= lifetime;
            if !keep {
                swept.push((key.clone(), hash.clone()));
            }
            keep
        });
        swept
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

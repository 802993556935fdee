//! Per-job async mutexes.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Per-key async mutex with stale entry cleanup.
///
/// Different keys lock concurrently while operations on the same key are
/// serialized. Every write to a job's state happens under its key.
#[derive(Clone)]
pub struct KeyedLocks<K>
where
    K: Eq + Hash,
{
    locks: Arc<DashMap<K, (Arc<Mutex<()>>, Instant)>>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Get or create the lock for `key`, refreshing its last-access time.
    pub fn get(&self, key: &K) -> Arc<Mutex<()>> {
        let now = Instant::now();
        self.locks
            .entry(key.clone())
            .and_modify(|(_, last_access)| *last_access = now)
            .or_insert_with(|| (Arc::new(Mutex::new(())), now))
            .0
            .clone()
    }

    /// Remove entries idle for longer than `max_age` that nobody holds.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.locks.len();
        self.locks.retain(|_, (lock, last_access)| {
            // strong_count == 1 means only the map holds it
            Arc::strong_count(lock) > 1 || now.duration_since(*last_access) <= max_age
        });
        before.saturating_sub(self.locks.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

// ---------------------------------------------------------------------------
// DedupCache
// ---------------------------------------------------------------------------

/// Expiring key set. A live key is guaranteed not eligible for reuse until its
/// expiry passes; absence guarantees nothing.
///
/// Expired entries are dropped lazily on lookup and in bulk by `purge_expired`.
pub struct DedupCache<K = String>
where
    K: Eq + Hash + Clone,
{
    /// key → expiry instant
    entries: DashMap<K, Instant>,
}

impl<K> DedupCache<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        // The read guard must be gone before remove_if touches the same shard.
        let live = self.entries.get(key).map(|expiry| *expiry > now);
        match live {
            Some(true) => true,
            Some(false) => {
                self.entries.remove_if(key, |_, expiry| *expiry <= now);
                false
            }
            None => false,
        }
    }

    /// Mark `key` for `ttl`. An existing later expiry is kept.
    pub fn set(&self, key: K, ttl: Duration) {
        let expiry = Instant::now() + ttl;
        self.entries
            .entry(key)
            .and_modify(|e| {
                if expiry > *e {
                    *e = expiry;
                }
            })
            .or_insert(expiry);
    }

    /// Atomic check-and-set: returns true and marks the key if it was absent or expired.
    pub fn try_claim(&self, key: K, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.entries.entry(key) {
            Entry::Occupied(mut o) => {
                if *o.get() > now {
                    false
                } else {
                    o.insert(now + ttl);
                    true
                }
            }
            Entry::Vacant(v) => {
                v.insert(now + ttl);
                true
            }
        }
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, expiry| *expiry > now);
        before.saturating_sub(self.entries.len())
    }

    /// Entry count, including expired entries not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K> Default for DedupCache<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

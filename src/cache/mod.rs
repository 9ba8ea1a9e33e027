//! TTL and capacity bounded cache of last-known counts per key.
//!
//! This cache absorbs read bursts so that not every read hits storage. Two
//! bounds are enforced:
//!  1. entries older than the configured TTL are treated as absent on `get`
//!     (and removed on the spot)
//!  2. inserting into a full cache evicts the least-recently-used entry
//!
//! Hit/miss counters are updated under the same lock as the lookup itself,
//! so [`TtlCache::stats`] is always consistent with the access pattern.
//!
//! The implementation uses a [`HashMap`] wrapped by a [`Mutex`] and does
//! nothing fancy around performance. Recency is a monotonically increasing
//! sequence number per access; eviction scans for the minimum. For the
//! capacities this cache is configured with, the scan is not worth replacing
//! with an intrusive list.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{event, Level};

use crate::error::{Error, Result};

#[derive(Debug)]
struct CacheEntry {
    value: u64,
    inserted_at: Instant,
    last_used: u64,
}

/// Counters exposed through the metrics surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<Bytes, CacheEntry>,
    hits: u64,
    misses: u64,
    use_seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.use_seq += 1;
        self.use_seq
    }

    /// Removes the least-recently-used entry. Only called on a non-empty map.
    fn evict_lru(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone());

        if let Some(key) = victim {
            event!(Level::DEBUG, "evicting lru cache entry for key {:?}", key);
            self.entries.remove(&key);
        }
    }
}

#[derive(Debug)]
pub struct TtlCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl TtlCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// A fail to acquire the lock is a [`Error::Logic`] since the only reason
    /// for it is [`Mutex`] poisoning
    fn acquire_lock(&self) -> Result<MutexGuard<Inner>> {
        self.inner.lock().map_err(|_| Error::Logic {
            reason: "Unable to acquire lock for TtlCache - poisoned...".to_string(),
        })
    }

    fn entry_is_live(&self, entry: &CacheEntry) -> bool {
        entry.inserted_at.elapsed() < self.ttl
    }

    /// Returns the cached count for the key, or [`None`] on a miss.
    /// An entry whose age exceeds the TTL counts as a miss and is dropped.
    pub fn get(&self, key: &[u8]) -> Result<Option<u64>> {
        let mut guard = self.acquire_lock()?;

        let live = match guard.entries.get(key) {
            Some(entry) => self.entry_is_live(entry),
            None => {
                guard.misses += 1;
                return Ok(None);
            }
        };

        if !live {
            guard.entries.remove(key);
            guard.misses += 1;
            return Ok(None);
        }

        guard.hits += 1;
        let seq = guard.next_seq();
        let entry = guard.entries.get_mut(key).unwrap();
        entry.last_used = seq;
        Ok(Some(entry.value))
    }

    /// Inserts or replaces the cached count for the key, restarting its TTL window
    pub fn put(&self, key: &Bytes, value: u64) -> Result<()> {
        let mut guard = self.acquire_lock()?;
        let seq = guard.next_seq();

        if let Some(entry) = guard.entries.get_mut(key) {
            entry.value = value;
            entry.inserted_at = Instant::now();
            entry.last_used = seq;
            return Ok(());
        }

        if guard.entries.len() >= self.capacity {
            guard.evict_lru();
        }

        guard.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                last_used: seq,
            },
        );

        Ok(())
    }

    /// Optimistic write-path update: increment the cached count by one,
    /// creating the entry at 1 if absent (or expired) and extending the TTL
    /// window of a live entry. Returns the new cached value.
    pub fn bump(&self, key: &Bytes) -> Result<u64> {
        let mut guard = self.acquire_lock()?;
        let seq = guard.next_seq();

        let live = guard
            .entries
            .get(key)
            .map(|e| self.entry_is_live(e))
            .unwrap_or(false);

        if live {
            let entry = guard.entries.get_mut(key).unwrap();
            entry.value += 1;
            entry.inserted_at = Instant::now();
            entry.last_used = seq;
            return Ok(entry.value);
        }

        guard.entries.remove(key);
        if guard.entries.len() >= self.capacity {
            guard.evict_lru();
        }

        guard.entries.insert(
            key.clone(),
            CacheEntry {
                value: 1,
                inserted_at: Instant::now(),
                last_used: seq,
            },
        );

        Ok(1)
    }

    pub fn invalidate(&self, key: &[u8]) -> Result<()> {
        let mut guard = self.acquire_lock()?;
        guard.entries.remove(key);
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let guard = self.acquire_lock()?;
        Ok(CacheStats {
            hits: guard.hits,
            misses: guard.misses,
            size: guard.entries.len(),
        })
    }
}

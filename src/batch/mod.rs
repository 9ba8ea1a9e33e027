//! Write batching.
//!
//! Increments are accumulated per key in a [`PendingBuffer`] and pushed to
//! storage by a [`BatchWriter`] on a fixed interval, collapsing N visits to
//! the same key into a single storage round trip. The buffer never rejects
//! an increment: when it grows past its configured key limit the caller is
//! told to kick an early flush instead.
//!
//! Committing a flushed key subtracts the flushed amount rather than removing
//! the entry outright, so increments that landed while the flush was on the
//! wire are preserved for the next cycle.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{event, instrument, Level};

use crate::error::{Error, Result};
use crate::storage::ShardRegistry;

/// What [`PendingBuffer::record`] tells the caller about buffer pressure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    WithinLimit,
    /// The buffer now holds at least `size_limit` distinct keys. The
    /// increment was accepted anyway; the caller should trigger a flush.
    LimitReached { pending_keys: usize },
}

#[derive(Debug)]
pub struct PendingBuffer {
    size_limit: usize,
    deltas: Mutex<HashMap<Bytes, u64>>,
}

impl PendingBuffer {
    pub fn new(size_limit: usize) -> Self {
        Self {
            size_limit,
            deltas: Mutex::new(HashMap::new()),
        }
    }

    fn acquire_lock(&self) -> Result<MutexGuard<HashMap<Bytes, u64>>> {
        self.deltas.lock().map_err(|_| Error::Logic {
            reason: "Unable to acquire pending buffer lock".to_string(),
        })
    }

    /// Adds `delta` to the pending amount for `key`. Never drops the
    /// increment, even past the size limit.
    pub fn record(&self, key: &Bytes, delta: u64) -> Result<RecordOutcome> {
        let mut guard = self.acquire_lock()?;
        *guard.entry(key.clone()).or_insert(0) += delta;

        if guard.len() >= self.size_limit {
            Ok(RecordOutcome::LimitReached {
                pending_keys: guard.len(),
            })
        } else {
            Ok(RecordOutcome::WithinLimit)
        }
    }

    /// Pending (not yet flushed) amount for `key`, 0 if none
    pub fn pending_delta(&self, key: &[u8]) -> Result<u64> {
        Ok(self.acquire_lock()?.get(key).copied().unwrap_or(0))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.acquire_lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.acquire_lock()?.is_empty())
    }

    /// Point-in-time copy of every pending entry. Entries are not removed -
    /// see [`Self::commit`].
    pub fn snapshot(&self) -> Result<Vec<(Bytes, u64)>> {
        Ok(self
            .acquire_lock()?
            .iter()
            .map(|(key, delta)| (key.clone(), *delta))
            .collect())
    }

    /// Marks `flushed` increments for `key` as durably stored. Anything
    /// recorded since the snapshot stays pending.
    pub fn commit(&self, key: &[u8], flushed: u64) -> Result<()> {
        let mut guard = self.acquire_lock()?;
        if let Some(delta) = guard.get_mut(key) {
            *delta = delta.saturating_sub(flushed);
            if *delta == 0 {
                guard.remove(key);
            }
        }
        Ok(())
    }

    /// Discards the pending amount for `key` without flushing it
    pub fn clear(&self, key: &[u8]) -> Result<()> {
        self.acquire_lock()?.remove(key);
        Ok(())
    }

    /// Drains the whole buffer. Only used when shutting down.
    pub fn take_all(&self) -> Result<HashMap<Bytes, u64>> {
        Ok(mem::take(&mut *self.acquire_lock()?))
    }
}

#[derive(Debug, Default)]
struct FlushStats {
    last_flush_at: Mutex<Option<Instant>>,
    flush_failures: AtomicU64,
    dropped_deltas: AtomicU64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    pub flushed_keys: usize,
    pub failed_keys: usize,
}

#[derive(Debug)]
pub struct BatchWriter {
    buffer: Arc<PendingBuffer>,
    registry: Arc<ShardRegistry>,
    stats: FlushStats,
}

impl BatchWriter {
    pub fn new(buffer: Arc<PendingBuffer>, registry: Arc<ShardRegistry>) -> Self {
        Self {
            buffer,
            registry,
            stats: FlushStats::default(),
        }
    }

    /// Pushes every pending delta to its owning node, fanning out one
    /// increment per key. Keys that fail stay pending and are retried on the
    /// next cycle.
    #[instrument(name = "batch::flush_once", level = "debug", skip(self))]
    pub async fn flush_once(&self) -> Result<FlushOutcome> {
        let snapshot = self.buffer.snapshot()?;
        if snapshot.is_empty() {
            return Ok(FlushOutcome::default());
        }

        let mut in_flight = FuturesUnordered::new();
        for (key, delta) in snapshot {
            let registry = self.registry.clone();
            in_flight.push(async move {
                let res = registry.increment(&key, delta).await;
                (key, delta, res)
            });
        }

        let mut outcome = FlushOutcome::default();
        let mut failed_keys = Vec::new();
        while let Some((key, delta, res)) = in_flight.next().await {
            match res {
                Ok(_) => {
                    self.buffer.commit(&key, delta)?;
                    outcome.flushed_keys += 1;
                }
                Err(err) => {
                    event!(
                        Level::WARN,
                        "flush failed for key {:?}: {} - will retry next cycle",
                        key,
                        err
                    );
                    failed_keys.push(String::from_utf8_lossy(&key).into_owned());
                    outcome.failed_keys += 1;
                }
            }
        }

        if failed_keys.is_empty() {
            if let Ok(mut last) = self.stats.last_flush_at.lock() {
                *last = Some(Instant::now());
            }
            Ok(outcome)
        } else {
            self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
            Err(Error::PartialFlushFailure { failed_keys })
        }
    }

    /// Final drain on shutdown, bounded by the grace period. Whatever cannot
    /// be flushed in time is dropped and counted.
    pub async fn shutdown_flush(&self, grace: Duration) {
        match tokio::time::timeout(grace, self.flush_once()).await {
            Ok(Ok(outcome)) => {
                event!(
                    Level::INFO,
                    "shutdown flush drained {} keys",
                    outcome.flushed_keys
                );
            }
            Ok(Err(err)) => {
                event!(Level::ERROR, "shutdown flush failed: {}", err);
            }
            Err(_) => {
                event!(
                    Level::ERROR,
                    "shutdown flush did not finish within {:?}",
                    grace
                );
            }
        }

        let remaining = match self.buffer.take_all() {
            Ok(remaining) => remaining,
            Err(err) => {
                event!(Level::ERROR, "unable to drain pending buffer: {}", err);
                return;
            }
        };
        if !remaining.is_empty() {
            let dropped: u64 = remaining.values().sum();
            self.stats.dropped_deltas.fetch_add(dropped, Ordering::Relaxed);
            event!(
                Level::ERROR,
                "dropping {} unflushed increments across {} keys",
                dropped,
                remaining.len()
            );
        }
    }

    /// Time since the last fully successful flush
    pub fn last_flush_age(&self) -> Option<Duration> {
        self.stats
            .last_flush_at
            .lock()
            .ok()
            .and_then(|last| last.map(|at| at.elapsed()))
    }

    pub fn flush_failures(&self) -> u64 {
        self.stats.flush_failures.load(Ordering::Relaxed)
    }

    pub fn dropped_deltas(&self) -> u64 {
        self.stats.dropped_deltas.load(Ordering::Relaxed)
    }
}

/// Flushes on the configured interval, or immediately when `kick` fires
/// (buffer size limit reached), until the shutdown signal arrives.
pub async fn run_flush_loop(
    writer: Arc<BatchWriter>,
    interval: Duration,
    kick: Arc<Notify>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick resolves immediately and would flush an empty buffer
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = writer.flush_once().await {
                    event!(Level::WARN, "periodic flush incomplete: {}", err);
                }
            }
            _ = kick.notified() => {
                event!(Level::DEBUG, "pending buffer reached its size limit, flushing early");
                if let Err(err) = writer.flush_once().await {
                    event!(Level::WARN, "early flush incomplete: {}", err);
                }
            }
            _ = &mut shutdown => {
                event!(Level::DEBUG, "flush loop received shutdown signal");
                return;
            }
        }
    }
}

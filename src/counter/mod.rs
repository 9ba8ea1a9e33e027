//! Counter service: the orchestration layer tying ring, registry, cache and
//! batch writer together.
//!
//! This is the surface the embedding layer (HTTP handler, CLI, test harness)
//! talks to. Writes never touch storage inline: [`VisitCounter::record_visit`]
//! bumps the cache optimistically and parks the increment in the pending
//! buffer for the flush loop to drain. Reads serve from the cache when they
//! can and otherwise merge the stored count with whatever is still pending
//! for the key, so a just-recorded visit is never under-reported.
//!
//! The staleness window this introduces: a count read from the cache can lag
//! storage by up to the cache TTL, and storage can lag the true count by up to
//! one flush interval. Resets are the exception and go to storage first.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{event, instrument, Level};

use crate::batch::{run_flush_loop, BatchWriter, FlushOutcome, PendingBuffer, RecordOutcome};
use crate::cache::{CacheStats, TtlCache};
use crate::config::Config;
use crate::error::Result;
use crate::storage::client::Factory;
use crate::storage::probe::run_probe_loop;
use crate::storage::retry::RetryPolicy;
use crate::storage::ShardRegistry;

/// Where a returned count came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Served from a live cache entry
    Cache,
    /// Read from the owning storage node (possibly topped up with a pending
    /// delta)
    Storage { node: String },
    /// Storage has never seen the key; the count exists only in the pending
    /// buffer
    Buffered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountLookup {
    pub count: u64,
    pub source: Source,
}

/// Aggregated view of the service internals for external reporting
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cache: CacheStats,
    pub pending_keys: usize,
    pub node_health: HashMap<String, bool>,
    pub healthy_nodes: usize,
    pub last_flush_age_ms: Option<u64>,
    pub flush_failures: u64,
    pub dropped_deltas: u64,
}

/// Handles to the background loops spawned by [`VisitCounter::start`].
/// Pass back to [`VisitCounter::shutdown`] for an orderly drain.
pub struct ServiceTasks {
    flush_shutdown: oneshot::Sender<()>,
    flush_handle: JoinHandle<()>,
    probe_shutdown: oneshot::Sender<()>,
    probe_handle: JoinHandle<()>,
}

pub struct VisitCounter {
    config: Config,
    cache: TtlCache,
    buffer: Arc<PendingBuffer>,
    registry: Arc<ShardRegistry>,
    writer: Arc<BatchWriter>,
    flush_kick: Arc<Notify>,
}

impl VisitCounter {
    pub async fn new(config: Config, factory: &dyn Factory) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(
            ShardRegistry::new(
                &config.storage_nodes,
                config.virtual_nodes,
                RetryPolicy::new(config.retry.max_attempts, config.retry_base_backoff()),
                config.operation_timeout(),
                factory,
            )
            .await?,
        );

        let cache = TtlCache::new(config.cache_ttl(), config.cache.capacity);
        let buffer = Arc::new(PendingBuffer::new(config.batch.size_limit));
        let writer = Arc::new(BatchWriter::new(buffer.clone(), registry.clone()));

        Ok(Self {
            config,
            cache,
            buffer,
            registry,
            writer,
            flush_kick: Arc::new(Notify::new()),
        })
    }

    /// Spawns the flush and probe loops. Call once after construction.
    pub fn start(&self) -> ServiceTasks {
        let (flush_shutdown, flush_rx) = oneshot::channel();
        let flush_handle = tokio::spawn(run_flush_loop(
            self.writer.clone(),
            self.config.batch_interval(),
            self.flush_kick.clone(),
            flush_rx,
        ));

        let (probe_shutdown, probe_rx) = oneshot::channel();
        let probe_handle = tokio::spawn(run_probe_loop(
            self.registry.clone(),
            self.config.probe_interval(),
            probe_rx,
        ));

        ServiceTasks {
            flush_shutdown,
            flush_handle,
            probe_shutdown,
            probe_handle,
        }
    }

    /// Stops the background loops and performs a final best-effort drain of
    /// the pending buffer, bounded by the configured grace period
    pub async fn shutdown(&self, tasks: ServiceTasks) {
        let _ = tasks.probe_shutdown.send(());
        let _ = tasks.flush_shutdown.send(());
        if let Err(err) = tasks.probe_handle.await {
            event!(Level::ERROR, "probe loop panicked: {}", err);
        }
        if let Err(err) = tasks.flush_handle.await {
            event!(Level::ERROR, "flush loop panicked: {}", err);
        }

        self.writer
            .shutdown_flush(self.config.shutdown_grace())
            .await;
    }

    /// Records one visit for the key. Never performs storage I/O - the
    /// increment lands in the pending buffer and the cached count is bumped
    /// optimistically. Returns the new cached estimate.
    #[instrument(name = "counter::record_visit", level = "debug", skip(self, key))]
    pub fn record_visit(&self, key: &Bytes) -> Result<u64> {
        let estimate = self.cache.bump(key)?;

        if let RecordOutcome::LimitReached { pending_keys } = self.buffer.record(key, 1)? {
            event!(
                Level::DEBUG,
                "pending buffer holds {} keys, kicking an early flush",
                pending_keys
            );
            self.flush_kick.notify_one();
        }

        Ok(estimate)
    }

    /// Returns the current count for the key with provenance.
    ///
    /// Cache hit wins. On a miss the stored count is read from the owning
    /// node and any still-unflushed delta is added on top before the cache is
    /// repopulated. A key storage has never seen counts as 0.
    #[instrument(name = "counter::get_count", level = "debug", skip(self, key))]
    pub async fn get_count(&self, key: &Bytes) -> Result<CountLookup> {
        if let Some(count) = self.cache.get(key)? {
            return Ok(CountLookup {
                count,
                source: Source::Cache,
            });
        }

        let read = self.registry.get(key).await?;
        let pending = self.buffer.pending_delta(key)?;
        let count = read.value.unwrap_or(0) + pending;
        self.cache.put(key, count)?;

        let source = if read.value.is_none() && pending > 0 {
            Source::Buffered
        } else {
            Source::Storage { node: read.node }
        };
        Ok(CountLookup { count, source })
    }

    /// Resets the count for the key to zero.
    ///
    /// Storage is reset first; the pending delta and cache entry are only
    /// cleared once that succeeds, so a failed reset leaves the pre-reset
    /// count fully observable.
    #[instrument(name = "counter::reset_count", level = "debug", skip(self, key))]
    pub async fn reset_count(&self, key: &Bytes) -> Result<()> {
        self.registry.reset(key).await?;
        self.buffer.clear(key)?;
        self.cache.invalidate(key)?;
        Ok(())
    }

    /// Administrative drain of the pending buffer, outside the normal cycle
    pub async fn flush_now(&self) -> Result<FlushOutcome> {
        self.writer.flush_once().await
    }

    pub fn metrics(&self) -> Result<MetricsSnapshot> {
        Ok(MetricsSnapshot {
            cache: self.cache.stats()?,
            pending_keys: self.buffer.len()?,
            node_health: self.registry.health_snapshot(),
            healthy_nodes: self.registry.healthy_node_count(),
            last_flush_age_ms: self
                .writer
                .last_flush_age()
                .map(|age| age.as_millis() as u64),
            flush_failures: self.writer.flush_failures(),
            dropped_deltas: self.writer.dropped_deltas(),
        })
    }

    /// Which storage node owns the key under the current topology
    pub fn owner_of(&self, key: &[u8]) -> Result<String> {
        self.registry.owner_of(key)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::{Source, VisitCounter};
    use crate::config::{BatchConfig, CacheConfig, Config, RetryConfig};
    use crate::storage::mock::{MockFactory, MockFactoryBuilder};
    use crate::test_utils::fault::When;

    const NODE_A: &str = "127.0.0.1:7001";
    const NODE_B: &str = "127.0.0.1:7002";

    fn test_config() -> Config {
        Config {
            storage_nodes: vec![NODE_A.to_string(), NODE_B.to_string()],
            virtual_nodes: 20,
            cache: CacheConfig {
                ttl_ms: 5000,
                capacity: 100,
            },
            batch: BatchConfig {
                interval_ms: 60_000,
                size_limit: 100,
            },
            retry: RetryConfig {
                max_attempts: 2,
                base_backoff_ms: 10,
            },
            operation_timeout_ms: 1000,
            probe_interval_ms: 30_000,
            shutdown_grace_ms: 2000,
        }
    }

    async fn initialize(factory: &MockFactory) -> VisitCounter {
        VisitCounter::new(test_config(), factory).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn record_then_get_never_under_reports() {
        let factory = MockFactoryBuilder::new().build();
        let counter = initialize(&factory).await;
        let key = Bytes::from("page1");

        for _ in 0..3 {
            counter.record_visit(&key).unwrap();
        }

        // before any flush the count is served from the optimistic cache entry
        let lookup = counter.get_count(&key).await.unwrap();
        assert_eq!(lookup.count, 3);
        assert_eq!(lookup.source, Source::Cache);

        // after the cache entry expires the pending delta still covers it
        tokio::time::advance(Duration::from_millis(6000)).await;
        let lookup = counter.get_count(&key).await.unwrap();
        assert_eq!(lookup.count, 3);
        assert_eq!(lookup.source, Source::Buffered);
    }

    #[tokio::test(start_paused = true)]
    async fn flushed_count_is_storage_backed() {
        let factory = MockFactoryBuilder::new().build();
        let counter = initialize(&factory).await;
        let key = Bytes::from("page1");

        for _ in 0..3 {
            counter.record_visit(&key).unwrap();
        }
        counter.flush_now().await.unwrap();
        tokio::time::advance(Duration::from_millis(6000)).await;

        let owner = counter.owner_of(&key).unwrap();
        let lookup = counter.get_count(&key).await.unwrap();
        assert_eq!(lookup.count, 3);
        assert_eq!(lookup.source, Source::Storage { node: owner });

        // the miss repopulated the cache
        let lookup = counter.get_count(&key).await.unwrap();
        assert_eq!(lookup.source, Source::Cache);
    }

    #[tokio::test(start_paused = true)]
    async fn stored_count_is_merged_with_pending_delta() {
        let factory = MockFactoryBuilder::new().build();
        let counter = initialize(&factory).await;
        let key = Bytes::from("page1");

        counter.record_visit(&key).unwrap();
        counter.flush_now().await.unwrap();

        // two more visits land after the flush
        counter.record_visit(&key).unwrap();
        counter.record_visit(&key).unwrap();
        tokio::time::advance(Duration::from_millis(6000)).await;

        let lookup = counter.get_count(&key).await.unwrap();
        assert_eq!(lookup.count, 3);
        assert!(matches!(lookup.source, Source::Storage { .. }));
    }

    #[tokio::test]
    async fn unknown_key_counts_as_zero() {
        let factory = MockFactoryBuilder::new().build();
        let counter = initialize(&factory).await;

        let lookup = counter.get_count(&Bytes::from("never seen")).await.unwrap();
        assert_eq!(lookup.count, 0);
        assert!(matches!(lookup.source, Source::Storage { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_returns_the_key_to_zero() {
        let factory = MockFactoryBuilder::new().build();
        let counter = initialize(&factory).await;
        let key = Bytes::from("page1");

        for _ in 0..5 {
            counter.record_visit(&key).unwrap();
        }
        counter.flush_now().await.unwrap();
        counter.record_visit(&key).unwrap();

        counter.reset_count(&key).await.unwrap();

        let lookup = counter.get_count(&key).await.unwrap();
        assert_eq!(lookup.count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reset_leaves_the_old_count_observable() {
        let factory = MockFactoryBuilder::new()
            .with_reset_fault(When::Always)
            .build();
        let counter = initialize(&factory).await;
        let key = Bytes::from("page1");

        counter.record_visit(&key).unwrap();
        counter.flush_now().await.unwrap();

        let err = counter.reset_count(&key).await.err().unwrap();
        assert!(err.is_storage_unavailable());

        // neither the cache entry nor storage were touched
        let lookup = counter.get_count(&key).await.unwrap();
        assert_eq!(lookup.count, 1);
        tokio::time::advance(Duration::from_millis(6000)).await;
        let lookup = counter.get_count(&key).await.unwrap();
        assert_eq!(lookup.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_node_serves_cache_until_expiry() {
        let factory = MockFactoryBuilder::new()
            .with_get_fault(When::Always)
            .build();
        let counter = initialize(&factory).await;
        let key = Bytes::from("page1");

        counter.record_visit(&key).unwrap();

        // cache entry is live, storage never consulted
        let lookup = counter.get_count(&key).await.unwrap();
        assert_eq!(lookup.count, 1);
        assert_eq!(lookup.source, Source::Cache);

        // once it expires the read has to hit the unreachable node
        tokio::time::advance(Duration::from_millis(6000)).await;
        let err = counter.get_count(&key).await.err().unwrap();
        assert!(err.is_storage_unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_pressure_kicks_an_early_flush() {
        let factory = MockFactoryBuilder::new().build();
        let mut config = test_config();
        config.batch.size_limit = 2;
        let counter = VisitCounter::new(config, &factory).await.unwrap();
        let tasks = counter.start();

        counter.record_visit(&Bytes::from("page a")).unwrap();
        counter.record_visit(&Bytes::from("page b")).unwrap();

        // the kick flushes well before the 60s interval
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.metrics().unwrap().pending_keys, 0);

        counter.shutdown(tasks).await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_pending_increments() {
        let factory = MockFactoryBuilder::new().build();
        let counter = initialize(&factory).await;
        let tasks = counter.start();

        let key = Bytes::from("page1");
        counter.record_visit(&key).unwrap();
        counter.record_visit(&key).unwrap();

        counter.shutdown(tasks).await;

        let owner = counter.owner_of(&key).unwrap();
        assert_eq!(factory.handle(&owner).store.current(&key).unwrap(), Some(2));
        assert_eq!(counter.metrics().unwrap().dropped_deltas, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_counts_what_it_cannot_drain() {
        let factory = MockFactoryBuilder::new()
            .with_incr_fault(When::Always)
            .build();
        let counter = initialize(&factory).await;
        let tasks = counter.start();

        counter.record_visit(&Bytes::from("page1")).unwrap();
        counter.record_visit(&Bytes::from("page2")).unwrap();

        counter.shutdown(tasks).await;

        let metrics = counter.metrics().unwrap();
        assert_eq!(metrics.pending_keys, 0);
        assert_eq!(metrics.dropped_deltas, 2);
    }

    #[tokio::test]
    async fn metrics_reflect_the_internals() {
        let factory = MockFactoryBuilder::new().build();
        let counter = initialize(&factory).await;

        counter.record_visit(&Bytes::from("page a")).unwrap();
        counter.record_visit(&Bytes::from("page a")).unwrap();
        counter.record_visit(&Bytes::from("page b")).unwrap();

        let metrics = counter.metrics().unwrap();
        assert_eq!(metrics.pending_keys, 2);
        assert_eq!(metrics.cache.size, 2);
        assert!(metrics.node_health.values().all(|healthy| *healthy));
        assert_eq!(metrics.healthy_nodes, 2);
        assert_eq!(metrics.last_flush_age_ms, None);

        counter.flush_now().await.unwrap();
        let metrics = counter.metrics().unwrap();
        assert_eq!(metrics.pending_keys, 0);
        assert!(metrics.last_flush_age_ms.is_some());
    }

    #[tokio::test]
    async fn misconfigured_counter_is_rejected_at_construction() {
        let factory = MockFactoryBuilder::new().build();
        let mut config = test_config();
        config.storage_nodes.clear();

        let err = VisitCounter::new(config, &factory).await.err().unwrap();
        assert!(err.is_no_available_node());
    }
}

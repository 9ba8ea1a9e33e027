//! Mock implementation for [`NodeClient`] with fault injection
//!
//! The mock wraps an [`InMemoryNode`], so successful operations behave like a
//! real node. Faults are shared behind an [`Arc`], which lets a test fail a
//! node mid-run and heal it later through the factory's [`MockNodeHandle`].

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;

use super::client::{Factory, NodeClient};
use super::in_memory::InMemoryNode;
use crate::error::{Error, Result};
use crate::test_utils::fault::{Fault, When};

#[derive(Debug, Clone, Default)]
pub struct MockFaults {
    pub incr: Fault,
    pub get: Fault,
    pub reset: Fault,
    pub ping: Fault,
}

impl MockFaults {
    pub fn all(when: When) -> Self {
        Self {
            incr: Fault { when: when.clone() },
            get: Fault { when: when.clone() },
            reset: Fault { when: when.clone() },
            ping: Fault { when },
        }
    }
}

#[derive(Debug, Default)]
pub struct MockStats {
    pub incr: AtomicUsize,
    pub get: AtomicUsize,
    pub reset: AtomicUsize,
    pub ping: AtomicUsize,
}

/// Shared view of a single mocked node: flip its faults, read its call stats
/// and inspect the backing store
#[derive(Debug, Clone)]
pub struct MockNodeHandle {
    pub addr: String,
    pub faults: Arc<Mutex<MockFaults>>,
    pub stats: Arc<MockStats>,
    pub store: InMemoryNode,
}

impl MockNodeHandle {
    fn new(addr: String, faults: MockFaults) -> Self {
        Self {
            addr,
            faults: Arc::new(Mutex::new(faults)),
            stats: Arc::new(MockStats::default()),
            store: InMemoryNode::default(),
        }
    }

    pub fn set_faults(&self, faults: MockFaults) {
        *self.faults.lock().unwrap() = faults;
    }
}

#[derive(Debug)]
pub struct MockNodeClient {
    handle: MockNodeHandle,
    latency: Option<Duration>,
}

impl MockNodeClient {
    fn check_fault(&self, op: &str, pick: impl Fn(&MockFaults) -> Fault) -> Result<()> {
        let fault = pick(&self.handle.faults.lock().unwrap());
        match fault.when {
            When::Always => Err(Error::Io {
                reason: format!("Mocked error on {} for node {}", op, self.handle.addr),
            }),
            When::Never => Ok(()),
        }
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn incr(&self, key: &[u8], delta: u64) -> Result<u64> {
        self.handle.stats.incr.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;
        self.check_fault("incr", |f| f.incr.clone())?;
        self.handle.store.incr(key, delta).await
    }

    async fn get(&self, key: &[u8]) -> Result<Option<u64>> {
        self.handle.stats.get.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;
        self.check_fault("get", |f| f.get.clone())?;
        self.handle.store.get(key).await
    }

    async fn reset(&self, key: &[u8]) -> Result<()> {
        self.handle.stats.reset.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;
        self.check_fault("reset", |f| f.reset.clone())?;
        self.handle.store.reset(key).await
    }

    async fn ping(&self) -> Result<()> {
        self.handle.stats.ping.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;
        self.check_fault("ping", |f| f.ping.clone())
    }
}

pub struct MockFactory {
    default_faults: MockFaults,
    latency: Option<Duration>,
    nodes: Mutex<HashMap<String, MockNodeHandle>>,
}

impl MockFactory {
    /// Returns the handle for the given address, creating the node if needed.
    /// The handle stays live after clients are built, so tests can flip faults
    /// on a node the registry is already talking to.
    pub fn handle(&self, addr: &str) -> MockNodeHandle {
        let mut guard = self.nodes.lock().unwrap();
        guard
            .entry(addr.to_string())
            .or_insert_with(|| MockNodeHandle::new(addr.to_string(), self.default_faults.clone()))
            .clone()
    }
}

#[async_trait]
impl Factory for MockFactory {
    async fn get(&self, addr: String) -> Result<Box<dyn NodeClient>> {
        let handle = self.handle(&addr);
        Ok(Box::new(MockNodeClient {
            handle,
            latency: self.latency,
        }))
    }
}

pub struct MockFactoryBuilder {
    faults: MockFaults,
    latency: Option<Duration>,
}

impl Default for MockFactoryBuilder {
    fn default() -> Self {
        Self {
            faults: MockFaults::default(),
            latency: None,
        }
    }
}

impl MockFactoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_incr_fault(mut self, when: When) -> Self {
        self.faults.incr = Fault { when };
        self
    }

    pub fn with_get_fault(mut self, when: When) -> Self {
        self.faults.get = Fault { when };
        self
    }

    pub fn with_reset_fault(mut self, when: When) -> Self {
        self.faults.reset = Fault { when };
        self
    }

    pub fn with_ping_fault(mut self, when: When) -> Self {
        self.faults.ping = Fault { when };
        self
    }

    /// Every call against every node observes this delay before responding.
    /// Combined with a paused clock this drives the per-call timeout tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn build(self) -> MockFactory {
        MockFactory {
            default_faults: self.faults,
            latency: self.latency,
            nodes: Default::default(),
        }
    }
}

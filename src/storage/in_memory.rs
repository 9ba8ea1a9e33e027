//! An in-process [`NodeClient`] implementation
//!
//! This implementation keeps counters in a [`HashMap`] wrapped by a [`Mutex`]
//! and does nothing fancy around performance. It backs tests and embedded
//! single-process deployments; the [`InMemoryFactory`] hands out one shared
//! store per address so a "cluster" of addresses behaves like distinct nodes.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::instrument;

use super::client::{Factory, NodeClient};
use crate::error::{Error, Result};

/// Type alias for the underlying datastructure used to store the counters
type Counters = HashMap<Bytes, u64>;

#[derive(Clone, Debug, Default)]
pub struct InMemoryNode {
    inner: Arc<Mutex<Counters>>,
}

impl InMemoryNode {
    /// A fail to acquire a lock is considered a [`Error::Logic`] since the only
    /// reason why an [`Error`] should be returned is in case of [`Mutex`] poisoning
    fn acquire_lock(&self) -> Result<MutexGuard<Counters>> {
        match self.inner.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => Err(Error::Logic {
                reason: "Unable to acquire lock for InMemoryNode - poisoned...".to_string(),
            }),
        }
    }

    /// Test/assertion helper: current value without going through the client interface
    pub fn current(&self, key: &[u8]) -> Result<Option<u64>> {
        let guard = self.acquire_lock()?;
        Ok(guard.get(key).copied())
    }
}

#[async_trait]
impl NodeClient for InMemoryNode {
    #[instrument(name = "storage::in_memory::incr", level = "debug", skip(self))]
    async fn incr(&self, key: &[u8], delta: u64) -> Result<u64> {
        let mut guard = self.acquire_lock()?;
        let value = guard.entry(Bytes::copy_from_slice(key)).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    #[instrument(name = "storage::in_memory::get", level = "debug", skip(self))]
    async fn get(&self, key: &[u8]) -> Result<Option<u64>> {
        let guard = self.acquire_lock()?;
        Ok(guard.get(key).copied())
    }

    #[instrument(name = "storage::in_memory::reset", level = "debug", skip(self))]
    async fn reset(&self, key: &[u8]) -> Result<()> {
        let mut guard = self.acquire_lock()?;
        guard.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Hands out one [`InMemoryNode`] per address, creating stores on demand
#[derive(Debug, Default)]
pub struct InMemoryFactory {
    nodes: Mutex<HashMap<String, InMemoryNode>>,
}

impl InMemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared store behind the given address, creating it if needed.
    /// Tests use this to assert on what a "node" has absorbed.
    pub fn node(&self, addr: &str) -> InMemoryNode {
        let mut guard = self.nodes.lock().unwrap();
        guard.entry(addr.to_string()).or_default().clone()
    }
}

#[async_trait]
impl Factory for InMemoryFactory {
    async fn get(&self, addr: String) -> Result<Box<dyn NodeClient>> {
        Ok(Box::new(self.node(&addr)))
    }
}

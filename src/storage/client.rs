//! Client interface for a single storage node.
//!
//! The core is protocol-agnostic at this boundary: it only needs the three
//! counter primitives (atomic increment-by-delta, point read, reset) plus a
//! lightweight liveness probe. Keys and counts are not interpreted beyond that.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::error::Result;

/// Trait that defines the primitive operations the counter core issues
/// against a single storage node
#[async_trait]
pub trait NodeClient: Debug + Send + Sync {
    /// Atomically increments the counter stored under `key` by `delta`,
    /// creating it at `delta` if absent. Returns the new value.
    async fn incr(&self, key: &[u8], delta: u64) -> Result<u64>;

    /// Point read. [`None`] means the node has never seen the key.
    async fn get(&self, key: &[u8]) -> Result<Option<u64>>;

    /// Removes the counter stored under `key`
    async fn reset(&self, key: &[u8]) -> Result<()>;

    /// Liveness probe - a no-op command that only proves the node is reachable
    async fn ping(&self) -> Result<()>;
}

/// Factory is the abstraction that allows different [`NodeClient`]
/// implementations to be plugged into the [`crate::storage::ShardRegistry`]
#[async_trait]
pub trait Factory: Send + Sync {
    /// the factory method that receives a node addr and returns a trait object
    /// for [`NodeClient`]
    async fn get(&self, addr: String) -> Result<Box<dyn NodeClient>>;
}

//! Shard registry: the single interface the rest of the core uses to talk to
//! the backing storage nodes.
//!
//! Every operation routes through the [`HashRing`] to find the owning node,
//! then issues the primitive against that node's client with a bounded number
//! of retries and a per-call timeout. On failure after the retry budget the
//! node is marked as possibly offline and the operation surfaces
//! [`Error::StorageUnavailable`]; a background probe (see [`probe`])
//! periodically re-checks nodes and restores their status.
//!
//! There is deliberately no re-routing to a different node on failure: the
//! key's owner is fixed by the ring, so unavailability of the owning node
//! makes that key's data unavailable until the node recovers. Masking that by
//! answering from a non-owner would silently serve wrong counts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{event, instrument, Level};

pub mod client;
pub mod in_memory;
pub mod mock;
pub mod probe;
pub mod retry;

use crate::error::{Error, Result};
use crate::ring::HashRing;
use client::{Factory, NodeClient};
use retry::{with_retries, RetryPolicy};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NodeStatus {
    /// Node is reachable
    Ok,
    /// Node is unreachable - could be transient. The health probe keeps
    /// re-checking it and real operations keep being attempted against it.
    PossiblyOffline,
}

#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub status: NodeStatus,
    pub last_checked: Instant,
}

/// Result of a point read: the value (if the node has seen the key) and the
/// node that served it, used for provenance tagging upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRead {
    pub value: Option<u64>,
    pub node: String,
}

#[derive(Debug)]
struct NodeSlot {
    client: Box<dyn NodeClient>,
    health: Mutex<NodeHealth>,
}

#[derive(Debug)]
pub struct ShardRegistry {
    ring: HashRing,
    nodes: HashMap<String, NodeSlot>,
    policy: RetryPolicy,
    op_timeout: Duration,
}

impl ShardRegistry {
    /// Builds the ring and one client per configured node. The topology is
    /// immutable after this point.
    pub async fn new(
        addrs: &[String],
        virtual_nodes: usize,
        policy: RetryPolicy,
        op_timeout: Duration,
        factory: &dyn Factory,
    ) -> Result<Self> {
        if addrs.is_empty() {
            return Err(Error::NoAvailableNode);
        }

        let mut ring = HashRing::default();
        let mut nodes = HashMap::new();
        for addr in addrs {
            ring.add_node(addr, virtual_nodes)?;
            let client = factory.get(addr.clone()).await?;
            nodes.insert(
                addr.clone(),
                NodeSlot {
                    client,
                    health: Mutex::new(NodeHealth {
                        status: NodeStatus::Ok,
                        last_checked: Instant::now(),
                    }),
                },
            );
        }

        Ok(Self {
            ring,
            nodes,
            policy,
            op_timeout,
        })
    }

    fn owner_slot(&self, key: &[u8]) -> Result<(&str, &NodeSlot)> {
        let owner = self.ring.route(key)?;
        let slot = self.nodes.get(owner).ok_or_else(|| Error::Logic {
            reason: format!(
                "ring owner {} missing from the registry. This should never happen.",
                owner
            ),
        })?;
        Ok((owner, slot))
    }

    /// Bounds a single storage round trip by the configured per-call timeout
    async fn bounded<T>(&self, op_name: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Io {
                reason: format!("{} timed out after {:?}", op_name, self.op_timeout),
            }),
        }
    }

    /// Health flips are driven by the outcome of real operations as well as
    /// by the probe, so a node that answers a get is immediately Ok again.
    fn mark_outcome(&self, addr: &str, slot: &NodeSlot, success: bool) {
        let Ok(mut health) = slot.health.lock() else {
            return;
        };

        health.last_checked = Instant::now();
        match (success, &health.status) {
            (true, NodeStatus::PossiblyOffline) => {
                event!(Level::INFO, "storage node {} is back online", addr);
                health.status = NodeStatus::Ok;
            }
            (false, NodeStatus::Ok) => {
                event!(
                    Level::WARN,
                    "marking storage node {} as possibly offline",
                    addr
                );
                health.status = NodeStatus::PossiblyOffline;
            }
            _ => {}
        }
    }

    fn unavailable(&self, key: &[u8], node: &str, err: Error) -> Error {
        Error::StorageUnavailable {
            key: Bytes::copy_from_slice(key),
            node: node.to_string(),
            reason: err.to_string(),
        }
    }

    /// Atomically increments the counter for `key` on its owning node
    #[instrument(level = "debug", skip(self, key))]
    pub async fn increment(&self, key: &[u8], delta: u64) -> Result<u64> {
        let (owner, slot) = self.owner_slot(key)?;
        let res = with_retries(&self.policy, || {
            self.bounded("increment", slot.client.incr(key, delta))
        })
        .await;

        self.mark_outcome(owner, slot, res.is_ok());
        res.map_err(|err| self.unavailable(key, owner, err))
    }

    /// Point read from the owning node. `value: None` means the node has
    /// never seen the key.
    #[instrument(level = "debug", skip(self, key))]
    pub async fn get(&self, key: &[u8]) -> Result<StorageRead> {
        let (owner, slot) = self.owner_slot(key)?;
        let res = with_retries(&self.policy, || self.bounded("get", slot.client.get(key))).await;

        self.mark_outcome(owner, slot, res.is_ok());
        match res {
            Ok(value) => Ok(StorageRead {
                value,
                node: owner.to_string(),
            }),
            Err(err) => Err(self.unavailable(key, owner, err)),
        }
    }

    /// Removes the counter for `key` from its owning node
    #[instrument(level = "debug", skip(self, key))]
    pub async fn reset(&self, key: &[u8]) -> Result<()> {
        let (owner, slot) = self.owner_slot(key)?;
        let res = with_retries(&self.policy, || {
            self.bounded("reset", slot.client.reset(key))
        })
        .await;

        self.mark_outcome(owner, slot, res.is_ok());
        res.map_err(|err| self.unavailable(key, owner, err))
    }

    /// Single liveness probe against one node. No retries - the probe loop
    /// comes back around on its own.
    pub async fn ping(&self, addr: &str) -> Result<()> {
        let slot = self.nodes.get(addr).ok_or_else(|| Error::Logic {
            reason: format!("unknown storage node {}", addr),
        })?;

        let res = self.bounded("ping", slot.client.ping()).await;
        self.mark_outcome(addr, slot, res.is_ok());
        res
    }

    /// Which node owns the given key. Exposed so that callers can reason
    /// about placement (tests, operational tooling).
    pub fn owner_of(&self, key: &[u8]) -> Result<String> {
        Ok(self.ring.route(key)?.to_string())
    }

    pub fn node_addrs(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn health_snapshot(&self) -> HashMap<String, bool> {
        self.nodes
            .iter()
            .map(|(addr, slot)| {
                let healthy = slot
                    .health
                    .lock()
                    .map(|h| h.status == NodeStatus::Ok)
                    .unwrap_or(false);
                (addr.clone(), healthy)
            })
            .collect()
    }

    pub fn healthy_node_count(&self) -> usize {
        self.health_snapshot().values().filter(|h| **h).count()
    }
}

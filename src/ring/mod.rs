//! Consistent hash ring used to decide which storage node owns a given key.
//!
//! The goal of consistent hashing is to enable the counter to decide
//! which storage node should own a specific key. It does it by creating a
//! fixed hash space - in this case from [0, 2^128) - and computing the hash
//! of both the storage nodes and the keys being stored. The node that owns
//! the key is the first node whose hash is higher than the hash of the key,
//! wrapping back to the first position when none is (the hash space is viewed
//! as a circular buffer, hence "hash ring").
//!
//! Each physical node is inserted multiple times under `"<addr>:<replica>"`
//! labels (virtual nodes). This smooths the load distribution: with a single
//! position per node, the arc sizes are whatever the hash function happens to
//! produce; with a few dozen positions per node the arcs average out.
//!
//! **The important property of consistent hashing is that adding or removing
//! a node only remaps the keys whose clockwise successor changed - roughly
//! 1/(N+1) of them - instead of nearly all keys as modulo hashing would.**

use std::collections::HashMap;
use std::io::Cursor;

use murmur3::murmur3_x86_128;

use crate::error::{Error, Result};

/// Let's force the usage of hash functions that return u128 for now..
type RingPosition = u128;

/// A single virtual position on the ring and the physical node that owns it
#[derive(Debug, Clone, Eq, PartialEq)]
struct RingEntry {
    position: RingPosition,
    owner: String,
}

/// The hash ring itself.
///
/// Implementation notes:
///  1. Passing a function pointer might not be ideal since we already have traits for Hash/Hasher..
///     one downside is that a function pointer requires the entire byte slice to be
///     passed at once. Since we only hash keys and short `addr:replica` labels here,
///     this is not a problem, and it makes the deterministic table-driven tests trivial.
#[derive(Debug)]
pub struct HashRing {
    /// virtual positions, sorted by position
    entries: Vec<RingEntry>,
    /// physical nodes and how many virtual positions each one holds
    nodes: HashMap<String, usize>,
    hash_fn: fn(&[u8]) -> RingPosition,
}

impl HashRing {
    pub fn new_with_hash_fn(hash_fn: fn(&[u8]) -> RingPosition) -> Self {
        Self {
            entries: Vec::new(),
            nodes: HashMap::new(),
            hash_fn,
        }
    }

    /// Adds a new node to the hash ring with the given number of virtual positions.
    ///
    /// Adding a node that is already present is idempotent: its previous virtual
    /// positions are dropped and recomputed.
    pub fn add_node(&mut self, addr: &str, virtual_count: usize) -> Result<()> {
        if virtual_count == 0 {
            return Err(Error::InvalidConfig {
                reason: format!("node {} must have at least one virtual position", addr),
            });
        }

        if self.nodes.contains_key(addr) {
            self.remove_node(addr);
        }

        for replica in 0..virtual_count {
            let label = format!("{}:{}", addr, replica);
            let position = (self.hash_fn)(label.as_bytes());
            match self.entries.binary_search_by(|e| e.position.cmp(&position)) {
                Ok(_) => {
                    return Err(Error::Logic {
                        reason: format!(
                            "hash collision on ring position {} while adding node {}",
                            position, addr
                        ),
                    })
                }
                Err(index) => self.entries.insert(
                    index,
                    RingEntry {
                        position,
                        owner: addr.to_string(),
                    },
                ),
            }
        }

        self.nodes.insert(addr.to_string(), virtual_count);
        Ok(())
    }

    /// Removes an existing node and all of its virtual positions from the ring
    pub fn remove_node(&mut self, addr: &str) {
        if self.nodes.remove(addr).is_none() {
            return;
        }

        self.entries.retain(|e| e.owner != addr);
    }

    /// Finds the owner of a given key.
    ///
    /// The owner is the node at the first virtual position >= hash(key),
    /// wrapping around to the first position of the ring when the key hashes
    /// past the last one.
    ///
    /// Returns [`Error::NoAvailableNode`] if the ring has no nodes.
    pub fn route(&self, key: &[u8]) -> Result<&str> {
        if self.entries.is_empty() {
            return Err(Error::NoAvailableNode);
        }

        let key_hash = (self.hash_fn)(key);
        let index = self.entries.partition_point(|e| e.position < key_hash) % self.entries.len();

        Ok(&self.entries[index].owner)
    }

    /// Number of physical nodes on the ring
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Virtual positions held by each physical node
    pub fn position_distribution(&self) -> HashMap<String, usize> {
        self.nodes.clone()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new_with_hash_fn(murmur3_hash)
    }
}

pub fn murmur3_hash(key: &[u8]) -> RingPosition {
    murmur3_x86_128(&mut Cursor::new(key), 0).unwrap()
}

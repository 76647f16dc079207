//! Key partitioning and partition ownership.
//!
//! Keys are partitioned by a stable FNV-1a hash of the normalized path, so
//! every member computes the same partition for a key without coordination.
//! Partitions are spread over the member list round-robin; a membership
//! change moves the partitions of departed members onto the survivors.

use crate::cluster::NodeId;

/// Number of partitions the key space is divided into.
///
/// Fixed for the lifetime of the cluster. Larger than any realistic member
/// count so ownership moves in small increments on membership change.
pub const DEFAULT_PARTITION_COUNT: usize = 271;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable FNV-1a hash of a normalized path.
pub fn hash_key(key: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maps keys to partitions and partitions to owning members.
#[derive(Debug)]
pub struct PartitionTable {
    count: usize,
}

impl PartitionTable {
    /// Creates a table with the given fixed partition count.
    pub fn new(count: usize) -> PartitionTable {
        PartitionTable { count }
    }

    /// The fixed partition count.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Partition index of a key.
    pub fn partition_of(&self, key: &str) -> usize {
        (hash_key(key) % self.count as u64) as usize
    }

    /// Owner of a partition under the given member list, or `None` when the
    /// cluster is empty.
    pub fn owner_of<'a>(&self, partition: usize, members: &'a [NodeId]) -> Option<&'a NodeId> {
        if members.is_empty() {
            return None;
        }
        members.get(partition % members.len())
    }

    /// Owner of the partition holding `key`.
    pub fn owner_of_key<'a>(&self, key: &str, members: &'a [NodeId]) -> Option<&'a NodeId> {
        self.owner_of(self.partition_of(key), members)
    }

    /// Partition indexes assigned to `node` under the given member list.
    pub fn owned_by(&self, node: &NodeId, members: &[NodeId]) -> Vec<usize> {
        let Some(position) = members.iter().position(|m| m == node) else {
            return Vec::new();
        };
        (0..self.count).filter(|p| p % members.len() == position).collect()
    }
}

//! Key to partition mapping
//!
//! The data layer owns the real key association; this module defines the
//! seam and a BLAKE3-based default so ownership lookups by key work without
//! one.

use crate::common::member::PartitionId;

/// Maps an application key to a partition
pub trait KeyPartitioningStrategy: Send + Sync {
    fn partition_of(&self, key: &[u8], partition_count: u32) -> PartitionId;
}

/// Hashes the key bytes with BLAKE3 and reduces modulo the partition count
#[derive(Debug, Clone, Copy, Default)]
pub struct HashPartitioning;

impl KeyPartitioningStrategy for HashPartitioning {
    fn partition_of(&self, key: &[u8], partition_count: u32) -> PartitionId {
        shard_key(key, partition_count)
    }
}

/// Compute the partition for a key
pub fn shard_key(key: &[u8], partition_count: u32) -> PartitionId {
    let hash = blake3::hash(key);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[0..8]);
    (u64::from_le_bytes(prefix) % partition_count.max(1) as u64) as PartitionId
}

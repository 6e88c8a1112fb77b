//! Orphaned-partition recovery inputs
//!
//! Persistence is out of scope for this crate. When a partition loses its
//! primary and every backup, an external collaborator that knows where
//! persisted copies live can be plugged in as a [`GuidResolver`]. The
//! recover quorum rule consults the same collaborator before allowing
//! orphans to be reassigned.

use crate::common::member::{Member, PartitionId};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Locates the newest persisted copy of each partition
pub trait GuidResolver: Send + Sync {
    /// Member holding the newest persisted copy of a partition, if known
    fn newest_holder(&self, partition: PartitionId) -> Option<Uuid>;

    /// Partitions whose newest copy cannot currently be located
    fn unresolved_partitions(&self) -> BTreeSet<PartitionId>;

    /// Whether persisted copies live on storage visible to every member
    fn is_shared_storage(&self) -> bool {
        false
    }

    /// Ownership membership recorded the last time the table was complete
    fn quorum_info(&self) -> Option<QuorumInfo> {
        None
    }
}

/// Ownership members known when the table was last fully owned
#[derive(Debug, Clone, Default)]
pub struct QuorumInfo {
    pub members: Vec<Member>,
}

impl QuorumInfo {
    pub fn new(members: Vec<Member>) -> Self {
        Self { members }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Distinct machines among the recorded members
    pub fn machine_count(&self) -> usize {
        distinct_machines(&self.members)
    }
}

/// Count distinct machines; a member with no machine identity counts as its own
pub fn distinct_machines<'a>(members: impl IntoIterator<Item = &'a Member>) -> usize {
    let machines: BTreeSet<String> = members
        .into_iter()
        .map(|m| {
            m.machine_key()
                .map(str::to_string)
                .unwrap_or_else(|| m.uuid.to_string())
        })
        .collect();
    machines.len()
}

/// Request to reassign a set of orphaned partitions
#[derive(Clone)]
pub struct PartitionRecoveryAction {
    pub partition_count: u32,
    pub orphaned: BTreeSet<PartitionId>,
    pub quorum_info: Option<QuorumInfo>,
    pub resolver: Option<Arc<dyn GuidResolver>>,
}

impl PartitionRecoveryAction {
    pub fn new(
        partition_count: u32,
        orphaned: BTreeSet<PartitionId>,
        quorum_info: Option<QuorumInfo>,
        resolver: Option<Arc<dyn GuidResolver>>,
    ) -> Self {
        Self {
            partition_count,
            orphaned,
            quorum_info,
            resolver,
        }
    }

    /// Every partition whose newest copy is currently unreachable
    pub fn missing(&self) -> BTreeSet<PartitionId> {
        match &self.resolver {
            Some(resolver) => resolver
                .unresolved_partitions()
                .into_iter()
                .filter(|p| *p < self.partition_count)
                .collect(),
            None => BTreeSet::new(),
        }
    }

    /// Orphans whose newest copy is currently unreachable
    pub fn unresolved(&self) -> BTreeSet<PartitionId> {
        self.missing()
            .intersection(&self.orphaned)
            .copied()
            .collect()
    }

    /// Whether every partition of the service is orphaned
    pub fn is_total_loss(&self) -> bool {
        self.orphaned.len() >= self.partition_count as usize
    }
}

impl fmt::Debug for PartitionRecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionRecoveryAction")
            .field("partition_count", &self.partition_count)
            .field("orphaned", &self.orphaned.len())
            .field("quorum_info", &self.quorum_info.as_ref().map(|q| q.member_count()))
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

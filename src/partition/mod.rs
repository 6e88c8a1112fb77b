//! Partition ownership, placement and redistribution

pub mod distributor;
pub mod recovery;
pub mod strategy;
pub mod table;

pub use distributor::{CycleReport, DistributionCoordinator};
pub use recovery::{GuidResolver, PartitionRecoveryAction, QuorumInfo};
pub use strategy::{PartitionAssignmentStrategy, RecoveryPlan, SimpleAssignmentStrategy};
pub use table::{
    OwnershipSnapshot, PartitionEntry, PartitionMove, PartitionOwnershipTable, PendingTransfer,
    TransitionPlan,
};

//! Action policies
//!
//! Services consult an [`ActionPolicy`] before doing anything that could be
//! unsafe while membership is unstable: moving partitions, promoting
//! backups, recovering orphans, admitting members or client connections.

pub mod action;
pub mod cluster;
pub mod composite;
pub mod quorum;

pub use action::{check_allowed, Action, ActionPolicy, AllowAllPolicy, DenyAllPolicy, MemberTimeoutAction};
pub use cluster::ClusterQuorumPolicy;
pub use composite::CompositeActionPolicy;
pub use quorum::{PartitionedQuorumPolicy, ProxyQuorumPolicy, QuorumRule, QuorumRules};

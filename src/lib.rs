//! # minigrid
//!
//! Coordination core of a clustered, partitioned in-memory data grid:
//! - Partition ownership table with optimistic versioning and two-phase handoff
//! - Pluggable assignment strategy balancing primaries and placing backups
//! - Liveness guardian detecting hung execution units
//! - Quorum action policies gating distribution, recovery, joins and connections
//! - Load-aware client connection balancing
//!
//! ## Architecture
//!
//! ```text
//!   membership feed            load feed
//!         │                        │
//! ┌───────▼────────────────────────▼───────┐
//! │              GridService               │
//! │  ┌───────────────────┐  ┌───────────┐  │
//! │  │ Distribution      │  │ Load      │  │
//! │  │ Coordinator       │  │ Balancer  │  │
//! │  │  strategy ──plan──┼─►│           │  │
//! │  │  policy (quorum)  │  └───────────┘  │
//! │  └────────┬──────────┘                 │
//! │           │ apply                      │
//! │  ┌────────▼──────────┐  ┌───────────┐  │
//! │  │ Ownership Table   │  │ Guardian  │  │
//! │  │ (per-partition    │  │ (scan +   │  │
//! │  │  locks, versions) │  │ incidents)│  │
//! │  └───────────────────┘  └───────────┘  │
//! └────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Simulate a cluster
//! ```bash
//! minigrid-coord simulate --members 4 --partitions 257 --backups 1
//! ```
//!
//! ### Print the effective configuration
//! ```bash
//! MINIGRID_PARTITION__PARTITION_COUNT=509 minigrid-coord config
//! ```

#![allow(clippy::result_large_err)]

pub mod balancer;
pub mod common;
pub mod guardian;
pub mod partition;
pub mod policy;
pub mod service;

// Re-export commonly used types
pub use common::{Config, Error, Member, MembershipEvent, PartitionId, Result, ServiceContext};
pub use guardian::{GuardContext, Guardable, Guardian};
pub use partition::{DistributionCoordinator, PartitionOwnershipTable};
pub use policy::{Action, ActionPolicy};
pub use service::{GridService, LoadUpdate};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");

//! Common utilities and types shared across minigrid

pub mod clock;
pub mod config;
pub mod error;
pub mod hash;
pub mod member;
pub mod utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BalancerConfig, Config, FailurePolicyMode, GuardianConfig, LoadOrder, PartitionConfig,
    QuorumConfig,
};
pub use error::{Error, Result};
pub use hash::{shard_key, HashPartitioning, KeyPartitioningStrategy};
pub use member::{Member, MemberId, MemberIdentity, MembershipEvent, PartitionId, ServiceContext};
pub use utils::{retry_with_backoff, timestamp_now_millis};

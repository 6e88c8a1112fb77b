//! Liveness guardian
//!
//! Detects execution units that stopped heartbeating. Each guarded unit has
//! a soft timeout (a fraction of its hard timeout) after which recovery is
//! attempted, and a hard timeout after which it is terminated and
//! forgotten.

pub mod context;
pub mod failure;
pub mod monitor;

pub use context::{soft_timeout, Beat, GuardContext, GuardState, Guardable};
pub use failure::{DefaultServiceFailurePolicy, FailableService, ServiceFailurePolicy};
pub use monitor::Guardian;

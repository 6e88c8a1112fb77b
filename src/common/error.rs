//! Error types for minigrid

use crate::common::member::PartitionId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Policy Errors ===
    #[error("Action \"{action}\" is not currently permitted: {reason}")]
    PolicyDenied { action: String, reason: String },

    // === Ownership Errors ===
    #[error("Version conflict on partition {partition}: expected {expected}, found {actual}")]
    VersionConflict {
        partition: PartitionId,
        expected: u64,
        actual: u64,
    },

    #[error("Transfer already in progress for partition {0}")]
    TransferInProgress(PartitionId),

    #[error("No transfer pending for partition {0}")]
    NoPendingTransfer(PartitionId),

    #[error("Member has departed: {0}")]
    MemberDeparted(String),

    #[error("Invalid transition plan: {0}")]
    InvalidPlan(String),

    #[error("Partition {partition} out of range (partition count {count})")]
    PartitionOutOfRange { partition: PartitionId, count: u32 },

    // === Distributed request errors ===
    #[error("Incomplete request: {} succeeded, {} failed", succeeded.len(), failed.len())]
    Incomplete {
        succeeded: Vec<String>,
        failed: Vec<String>,
    },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Optimistic conflicts and in-flight transfers clear up once the plan is
    /// recomputed against the latest table.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::VersionConflict { .. } | Error::TransferInProgress(_)
        )
    }

    /// Is this a policy denial (surfaced to the caller, never retried internally)?
    pub fn is_policy_denial(&self) -> bool {
        matches!(self, Error::PolicyDenied { .. })
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::VersionConflict {
            partition: 3,
            expected: 1,
            actual: 2
        }
        .is_retryable());
        assert!(Error::TransferInProgress(7).is_retryable());
        assert!(!Error::NoPendingTransfer(7).is_retryable());
        assert!(!Error::PolicyDenied {
            action: "distribute".into(),
            reason: "quorum".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_incomplete_message() {
        let err = Error::Incomplete {
            succeeded: vec!["1".into(), "2".into()],
            failed: vec!["3".into()],
        };
        assert_eq!(err.to_string(), "Incomplete request: 2 succeeded, 1 failed");
    }
}

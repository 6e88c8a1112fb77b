//! Actions and the policy seam that gates them

use crate::common::member::{Member, ServiceContext};
use crate::common::utils::timestamp_now_millis;
use crate::common::{Error, Result};
use crate::partition::recovery::PartitionRecoveryAction;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const DENIAL_REPORT_INTERVAL_MS: u64 = 60_000;

/// Members involved in a membership timeout decision
#[derive(Debug, Clone, Default)]
pub struct MemberTimeoutAction {
    /// Members that stopped responding
    pub timed_out: Vec<Member>,
    /// Members known to be healthy
    pub responsive: Vec<Member>,
    /// Members that recently announced themselves
    pub announcing: Vec<Member>,
}

/// Something a service wants to do that a policy may veto
#[derive(Debug, Clone)]
pub enum Action {
    /// Transfer partitions between live members
    Distribute,
    /// Promote backups after a primary is lost
    Restore,
    /// Reassign orphaned partitions
    Recover(PartitionRecoveryAction),
    Read,
    Write,
    MemberJoin,
    /// Accept a client connection
    Connect,
    /// Disconnect unresponsive members
    MemberTimeout(MemberTimeoutAction),
    Custom(String),
}

impl Action {
    pub fn name(&self) -> &str {
        match self {
            Action::Distribute => "distribute",
            Action::Restore => "restore",
            Action::Recover(_) => "recover",
            Action::Read => "read",
            Action::Write => "write",
            Action::MemberJoin => "join",
            Action::Connect => "connect",
            Action::MemberTimeout(_) => "member-timeout",
            Action::Custom(name) => name,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pluggable gate on service actions
///
/// Implementations must answer `true` for actions they do not recognise.
pub trait ActionPolicy: Send + Sync {
    /// Called once before the service first consults the policy
    fn init(&self, _service: &ServiceContext) {}

    /// Called after every membership change
    fn on_membership_change(&self, _service: &ServiceContext) {}

    fn is_allowed(&self, service: &ServiceContext, action: &Action) -> bool;

    /// Human readable status, used in denial messages
    fn status_description(&self) -> String {
        String::new()
    }
}

/// Policy that allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

impl ActionPolicy for AllowAllPolicy {
    fn is_allowed(&self, _service: &ServiceContext, _action: &Action) -> bool {
        true
    }

    fn status_description(&self) -> String {
        "allow-all".into()
    }
}

/// Policy that denies everything, including actions it has never heard of
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAllPolicy;

impl ActionPolicy for DenyAllPolicy {
    fn is_allowed(&self, _service: &ServiceContext, _action: &Action) -> bool {
        false
    }

    fn status_description(&self) -> String {
        "deny-all".into()
    }
}

/// Consult a policy, turning a denial into [`Error::PolicyDenied`]
pub fn check_allowed(policy: &dyn ActionPolicy, service: &ServiceContext, action: &Action) -> Result<()> {
    if policy.is_allowed(service, action) {
        Ok(())
    } else {
        Err(Error::PolicyDenied {
            action: action.name().to_string(),
            reason: policy.status_description(),
        })
    }
}

/// Lets a policy log at most one denial per minute
#[derive(Debug, Default)]
pub(crate) struct DenialLimiter {
    last: AtomicU64,
}

impl DenialLimiter {
    pub(crate) fn try_acquire(&self) -> bool {
        self.try_acquire_at(timestamp_now_millis())
    }

    pub(crate) fn try_acquire_at(&self, now: u64) -> bool {
        let last = self.last.load(Ordering::Acquire);
        if last != 0 && now.saturating_sub(last) < DENIAL_REPORT_INTERVAL_MS {
            return false;
        }
        self.last
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Allow the next denial through immediately
    pub(crate) fn reset(&self) {
        self.last.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denial_limiter_once_per_interval() {
        let limiter = DenialLimiter::default();
        assert!(limiter.try_acquire_at(1_000));
        assert!(!limiter.try_acquire_at(1_001));
        assert!(!limiter.try_acquire_at(60_999));
        assert!(limiter.try_acquire_at(61_000));

        limiter.reset();
        assert!(limiter.try_acquire_at(61_001));
    }

    struct DenyWrites;

    impl ActionPolicy for DenyWrites {
        fn is_allowed(&self, _service: &ServiceContext, action: &Action) -> bool {
            !matches!(action, Action::Write)
        }

        fn status_description(&self) -> String {
            "read-only".into()
        }
    }

    #[test]
    fn test_check_allowed_reports_denial() {
        let ctx = ServiceContext::new("grid");
        assert!(check_allowed(&DenyWrites, &ctx, &Action::Read).is_ok());

        let err = check_allowed(&DenyWrites, &ctx, &Action::Write).unwrap_err();
        assert!(err.is_policy_denial());
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn test_action_names() {
        assert_eq!(Action::Distribute.to_string(), "distribute");
        assert_eq!(Action::Custom("backup".into()).name(), "backup");
    }
}

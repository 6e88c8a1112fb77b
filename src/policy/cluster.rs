//! Cluster-level quorum for member timeouts
//!
//! Decides whether this member may disconnect members that stopped
//! responding. Thresholds are configured per role:
//!
//! - `"*"` counts members of any role
//! - `"<role>"` counts members with that role
//! - `"sites:<role>"` and `"machines:<role>"` count distinct sites or
//!   machines among members of that role (`<role>` may be `*`)
//!
//! Every configured threshold must still be met by the members that would
//! survive the disconnect.

use crate::common::member::{Member, ServiceContext};
use crate::partition::recovery::distinct_machines;
use crate::policy::action::{Action, ActionPolicy, DenialLimiter, MemberTimeoutAction};
use std::collections::{BTreeMap, BTreeSet};

const ANY_ROLE: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Members,
    Sites,
    Machines,
}

#[derive(Debug, Clone)]
struct RoleQuorum {
    key: String,
    role: String,
    scope: Scope,
    threshold: usize,
}

impl RoleQuorum {
    fn parse(key: &str, threshold: usize) -> Self {
        let (scope, role) = if let Some(role) = key.strip_prefix("sites:") {
            (Scope::Sites, role)
        } else if let Some(role) = key.strip_prefix("machines:") {
            (Scope::Machines, role)
        } else {
            (Scope::Members, key)
        };
        Self {
            key: key.to_string(),
            role: role.to_string(),
            scope,
            threshold,
        }
    }

    fn matches(&self, member: &Member) -> bool {
        self.role == ANY_ROLE || member.identity.role.as_deref() == Some(self.role.as_str())
    }

    fn measure<'a>(&self, members: impl Iterator<Item = &'a Member>) -> usize {
        let members: Vec<&Member> = members.filter(|m| self.matches(m)).collect();
        match self.scope {
            Scope::Members => members.len(),
            Scope::Machines => distinct_machines(members),
            Scope::Sites => {
                let sites: BTreeSet<&str> = members
                    .iter()
                    .filter_map(|m| m.identity.site.as_deref())
                    .collect();
                sites.len()
            }
        }
    }
}

pub struct ClusterQuorumPolicy {
    quorums: Vec<RoleQuorum>,
    denials: DenialLimiter,
}

impl ClusterQuorumPolicy {
    pub fn new(thresholds: &BTreeMap<String, usize>) -> Self {
        Self {
            quorums: thresholds
                .iter()
                .filter(|(_, t)| **t > 0)
                .map(|(k, t)| RoleQuorum::parse(k, *t))
                .collect(),
            denials: DenialLimiter::default(),
        }
    }

    fn check(&self, service: &ServiceContext, action: &MemberTimeoutAction) -> bool {
        let local_timed_out = service
            .local_member()
            .is_some_and(|local| action.timed_out.contains(local));

        for quorum in &self.quorums {
            if local_timed_out {
                // A member that thinks it is the one cut off only proceeds when
                // no quorum is configured for its role
                if service.local_member().is_some_and(|local| quorum.matches(local)) {
                    return false;
                }
                continue;
            }
            let survivors = quorum.measure(action.responsive.iter().chain(action.announcing.iter()));
            if survivors < quorum.threshold {
                if self.denials.try_acquire() {
                    tracing::warn!(
                        quorum = %quorum.key,
                        survivors,
                        threshold = quorum.threshold,
                        "Member timeout disallowed by cluster quorum"
                    );
                }
                return false;
            }
        }
        true
    }
}

impl ActionPolicy for ClusterQuorumPolicy {
    fn is_allowed(&self, service: &ServiceContext, action: &Action) -> bool {
        match action {
            Action::MemberTimeout(timeout) => self.check(service, timeout),
            _ => true,
        }
    }

    fn status_description(&self) -> String {
        let parts: Vec<String> = self
            .quorums
            .iter()
            .map(|q| format!("{}={}", q.key, q.threshold))
            .collect();
        format!("timeout-survivor-quorum={{{}}}", parts.join(", "))
    }
}

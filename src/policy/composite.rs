//! Intersection of several policies

use crate::common::member::ServiceContext;
use crate::policy::action::{Action, ActionPolicy, AllowAllPolicy};
use std::sync::Arc;

/// Allows an action only if every member policy allows it
///
/// Every member policy is initialised and told about membership changes,
/// even when an earlier one would already deny.
pub struct CompositeActionPolicy {
    policies: Vec<Arc<dyn ActionPolicy>>,
}

impl CompositeActionPolicy {
    pub fn new(policies: Vec<Arc<dyn ActionPolicy>>) -> Self {
        Self { policies }
    }

    pub fn pair(first: Arc<dyn ActionPolicy>, second: Arc<dyn ActionPolicy>) -> Self {
        Self::new(vec![first, second])
    }

    /// Collapse a list of policies into one
    pub fn combine(mut policies: Vec<Arc<dyn ActionPolicy>>) -> Arc<dyn ActionPolicy> {
        match policies.len() {
            0 => Arc::new(AllowAllPolicy),
            1 => policies.remove(0),
            _ => Arc::new(Self::new(policies)),
        }
    }
}

impl ActionPolicy for CompositeActionPolicy {
    fn init(&self, service: &ServiceContext) {
        for policy in &self.policies {
            policy.init(service);
        }
    }

    fn on_membership_change(&self, service: &ServiceContext) {
        for policy in &self.policies {
            policy.on_membership_change(service);
        }
    }

    fn is_allowed(&self, service: &ServiceContext, action: &Action) -> bool {
        self.policies.iter().all(|p| p.is_allowed(service, action))
    }

    fn status_description(&self) -> String {
        self.policies
            .iter()
            .map(|p| p.status_description())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

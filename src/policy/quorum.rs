//! Membership quorum policies
//!
//! A quorum policy holds a ladder of [`QuorumRule`]s. Each rule names the set
//! of actions (as a bit mask) allowed once the service population reaches
//! the rule's threshold. The ladder is folded cumulatively at construction,
//! so a larger population never allows fewer actions than a smaller one.
//! The rule in force is recomputed on every membership change and stored in
//! an atomic, which keeps `is_allowed` lock free.

use crate::common::config::QuorumConfig;
use crate::common::member::ServiceContext;
use crate::partition::recovery::{distinct_machines, PartitionRecoveryAction};
use crate::policy::action::{Action, ActionPolicy, DenialLimiter};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default share of the last known ownership size needed to recover
const DEFAULT_RECOVER_FACTOR: f32 = 2.0 / 3.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuorumRule {
    pub mask: u32,
    pub threshold: usize,
    /// Fraction of a reference population; only meaningful for recovery
    pub threshold_factor: f32,
}

impl QuorumRule {
    pub const MASK_DISTRIBUTION: u32 = 0x01;
    pub const MASK_RESTORE: u32 = 0x02;
    pub const MASK_READ: u32 = 0x04;
    pub const MASK_WRITE: u32 = 0x08;
    pub const MASK_RECOVER: u32 = 0x10;
    pub const MASK_JOIN: u32 = 0x20;
    pub const MASK_CONNECT: u32 = 0x40;

    pub const NONE_ALLOWED: QuorumRule = QuorumRule {
        mask: 0,
        threshold: 0,
        threshold_factor: 0.0,
    };

    pub const ALL_ALLOWED: QuorumRule = QuorumRule {
        mask: u32::MAX,
        threshold: 0,
        threshold_factor: 0.0,
    };

    pub fn new(mask: u32, threshold: usize) -> Self {
        Self {
            mask,
            threshold,
            threshold_factor: 0.0,
        }
    }

    pub fn with_threshold_factor(mut self, factor: f32) -> Self {
        self.threshold_factor = factor;
        self
    }

    /// Whether every action in `mask` is allowed by this rule
    pub fn is_allowed(&self, mask: u32) -> bool {
        self.mask & mask == mask
    }

    fn union(&self, other: &QuorumRule) -> QuorumRule {
        QuorumRule {
            mask: self.mask | other.mask,
            threshold: self.threshold.max(other.threshold),
            threshold_factor: self.threshold_factor.max(other.threshold_factor),
        }
    }
}

fn mask_names(mask: u32) -> String {
    if mask == u32::MAX {
        return "all".into();
    }
    const NAMES: [(u32, &str); 7] = [
        (QuorumRule::MASK_DISTRIBUTION, "distribution"),
        (QuorumRule::MASK_RESTORE, "restore"),
        (QuorumRule::MASK_READ, "read"),
        (QuorumRule::MASK_WRITE, "write"),
        (QuorumRule::MASK_RECOVER, "recover"),
        (QuorumRule::MASK_JOIN, "join"),
        (QuorumRule::MASK_CONNECT, "connect"),
    ];
    let names: Vec<&str> = NAMES
        .iter()
        .filter(|(bit, _)| mask & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        "none".into()
    } else {
        names.join(", ")
    }
}

/// Normalised rule ladder plus the rule currently in force
#[derive(Debug)]
pub struct QuorumRules {
    rules: Vec<QuorumRule>,
    current: AtomicUsize,
    population: AtomicUsize,
    denials: DenialLimiter,
}

impl QuorumRules {
    pub fn new(mut configured: Vec<QuorumRule>) -> Self {
        configured.sort_by_key(|r| r.threshold);

        let mut rules = Vec::with_capacity(configured.len() + 2);
        let mut prev = QuorumRule::NONE_ALLOWED;
        for rule in configured {
            let next = rule.union(&prev);
            if next.threshold > prev.threshold {
                rules.push(prev);
            }
            prev = next;
        }
        rules.push(prev);
        rules.push(QuorumRule::ALL_ALLOWED);

        Self {
            rules,
            current: AtomicUsize::new(0),
            population: AtomicUsize::new(0),
            denials: DenialLimiter::default(),
        }
    }

    pub fn rules(&self) -> &[QuorumRule] {
        &self.rules
    }

    pub fn current(&self) -> QuorumRule {
        self.rules[self.current.load(Ordering::Acquire)]
    }

    pub fn population(&self) -> usize {
        self.population.load(Ordering::Acquire)
    }

    /// Recompute the rule in force; returns true if it changed
    pub fn update(&self, population: usize) -> bool {
        let mut index = 0;
        for (i, rule) in self.rules.iter().enumerate() {
            if population >= rule.threshold {
                index = i;
            } else {
                break;
            }
        }
        self.population.store(population, Ordering::Release);
        let previous = self.current.swap(index, Ordering::AcqRel);
        if previous != index {
            self.denials.reset();
            tracing::info!(
                population,
                allowed = %mask_names(self.rules[index].mask),
                "Quorum rule changed"
            );
        }
        previous != index
    }

    /// Log a denial, at most once per reporting interval
    fn report_denial(&self, action: &Action, reason: &str) {
        if self.denials.try_acquire() {
            tracing::warn!(
                action = %action,
                population = self.population(),
                "Action disallowed by quorum policy: {}",
                reason
            );
        }
    }

    fn describe(&self) -> String {
        format!("allowed-actions={}", mask_names(self.current().mask))
    }
}

/// Minimum members required to recover, as a share of the last known size
fn min_threshold(last_known: usize, factor: f32) -> usize {
    let factor = if factor > 0.0 {
        factor
    } else {
        DEFAULT_RECOVER_FACTOR
    };
    ((last_known as f64 * factor as f64).floor() as usize).max(1)
}

/// Quorum policy for partitioned services
///
/// Gates distribution, restore, read, write, recover and join on the number
/// of storage-enabled members that are not leaving.
#[derive(Debug)]
pub struct PartitionedQuorumPolicy {
    rules: QuorumRules,
    recover_threshold: usize,
    recover_factor: f32,
}

impl PartitionedQuorumPolicy {
    pub fn new(rules: Vec<QuorumRule>) -> Self {
        let recover = rules
            .iter()
            .find(|r| r.mask == QuorumRule::MASK_RECOVER)
            .copied()
            .unwrap_or(QuorumRule::new(QuorumRule::MASK_RECOVER, 0));
        Self {
            rules: QuorumRules::new(rules),
            recover_threshold: recover.threshold,
            recover_factor: recover.threshold_factor,
        }
    }

    pub fn from_config(config: &QuorumConfig) -> Self {
        Self::new(vec![
            QuorumRule::new(QuorumRule::MASK_DISTRIBUTION, config.distribution_quorum),
            QuorumRule::new(QuorumRule::MASK_RESTORE, config.restore_quorum),
            QuorumRule::new(QuorumRule::MASK_READ, config.read_quorum),
            QuorumRule::new(QuorumRule::MASK_WRITE, config.write_quorum),
            QuorumRule::new(QuorumRule::MASK_RECOVER, config.recover_quorum)
                .with_threshold_factor(config.recover_threshold_factor),
            QuorumRule::new(QuorumRule::MASK_JOIN, config.join_quorum),
        ])
    }

    pub fn rules(&self) -> &QuorumRules {
        &self.rules
    }

    fn mask_of(action: &Action) -> Option<u32> {
        match action {
            Action::Distribute => Some(QuorumRule::MASK_DISTRIBUTION),
            Action::Restore => Some(QuorumRule::MASK_RESTORE),
            Action::Read => Some(QuorumRule::MASK_READ),
            Action::Write => Some(QuorumRule::MASK_WRITE),
            Action::Recover(_) => Some(QuorumRule::MASK_RECOVER),
            Action::MemberJoin => Some(QuorumRule::MASK_JOIN),
            _ => None,
        }
    }

    /// Decide whether orphans may be recovered with the current membership
    fn check_recovery(
        &self,
        service: &ServiceContext,
        action: &PartitionRecoveryAction,
    ) -> std::result::Result<(), String> {
        let Some(info) = action.quorum_info.as_ref().filter(|q| q.member_count() > 0) else {
            // Without a record of complete ownership, allow a fresh deployment
            // (nothing reachable), a fully reachable set, or orphans that are
            // all reachable while some of the service still has owners
            let missing = action.missing();
            if missing.len() >= action.partition_count as usize
                || missing.is_empty()
                || (!action.is_total_loss() && missing.is_disjoint(&action.orphaned))
            {
                return Ok(());
            }
            return Err(format!(
                "no quorum info; {} partitions unreachable, recovery of {} orphans disallowed",
                missing.len(),
                action.orphaned.len()
            ));
        };

        let unresolved = action.unresolved();
        if !unresolved.is_empty() {
            return Err(format!(
                "{} orphaned partitions have no reachable persisted copy",
                unresolved.len()
            ));
        }

        let current = service.ownership_population();
        let required = if self.recover_threshold > 0 {
            self.recover_threshold
        } else {
            min_threshold(info.member_count(), self.recover_factor).min(action.orphaned.len().max(1))
        };
        if current < required {
            return Err(format!(
                "ownership population {} below recovery threshold {} (last known {})",
                current,
                required,
                info.member_count()
            ));
        }

        let shared = action
            .resolver
            .as_ref()
            .is_some_and(|r| r.is_shared_storage());
        if !shared && self.recover_threshold == 0 {
            let eligible = service.eligible_members();
            let machines = distinct_machines(&eligible);
            let required = min_threshold(info.machine_count(), self.recover_factor);
            if machines < required {
                return Err(format!(
                    "{} machines available, {} required (last known {})",
                    machines,
                    required,
                    info.machine_count()
                ));
            }
        }
        Ok(())
    }
}

impl ActionPolicy for PartitionedQuorumPolicy {
    fn init(&self, service: &ServiceContext) {
        self.rules.update(service.ownership_population());
    }

    fn on_membership_change(&self, service: &ServiceContext) {
        self.rules.update(service.ownership_population());
    }

    fn is_allowed(&self, service: &ServiceContext, action: &Action) -> bool {
        let Some(mask) = Self::mask_of(action) else {
            return true;
        };
        if !self.rules.current().is_allowed(mask) {
            self.rules.report_denial(action, &self.rules.describe());
            return false;
        }
        if let Action::Recover(recovery) = action {
            if let Err(reason) = self.check_recovery(service, recovery) {
                self.rules.report_denial(action, &reason);
                return false;
            }
        }
        true
    }

    fn status_description(&self) -> String {
        self.rules.describe()
    }
}

/// Quorum policy for proxy services: gates client connections
#[derive(Debug)]
pub struct ProxyQuorumPolicy {
    rules: QuorumRules,
}

impl ProxyQuorumPolicy {
    pub fn new(connect_quorum: usize) -> Self {
        Self {
            rules: QuorumRules::new(vec![QuorumRule::new(
                QuorumRule::MASK_CONNECT,
                connect_quorum,
            )]),
        }
    }
}

impl ActionPolicy for ProxyQuorumPolicy {
    fn init(&self, service: &ServiceContext) {
        self.rules.update(service.service_population());
    }

    fn on_membership_change(&self, service: &ServiceContext) {
        self.rules.update(service.service_population());
    }

    fn is_allowed(&self, _service: &ServiceContext, action: &Action) -> bool {
        if !matches!(action, Action::Connect) {
            return true;
        }
        let allowed = self.rules.current().is_allowed(QuorumRule::MASK_CONNECT);
        if !allowed {
            self.rules.report_denial(action, &self.rules.describe());
        }
        allowed
    }

    fn status_description(&self) -> String {
        self.rules.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::member::{Member, MembershipEvent, PartitionId};
    use crate::partition::recovery::{GuidResolver, QuorumInfo};
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use uuid::Uuid;

    fn context(n: u32) -> ServiceContext {
        let mut ctx = ServiceContext::new("grid");
        for id in 1..=n {
            ctx.apply(&MembershipEvent::Joined(Member::new(id)));
        }
        ctx
    }

    #[test]
    fn test_rules_fold_cumulatively() {
        let rules = QuorumRules::new(vec![
            QuorumRule::new(QuorumRule::MASK_RESTORE, 5),
            QuorumRule::new(QuorumRule::MASK_DISTRIBUTION, 3),
            QuorumRule::new(QuorumRule::MASK_READ, 0),
        ]);
        rules.update(4);
        let current = rules.current();
        assert!(current.is_allowed(QuorumRule::MASK_READ));
        assert!(current.is_allowed(QuorumRule::MASK_DISTRIBUTION));
        assert!(!current.is_allowed(QuorumRule::MASK_RESTORE));

        rules.update(5);
        assert_eq!(rules.current(), QuorumRule::ALL_ALLOWED);

        rules.update(0);
        assert!(rules.current().is_allowed(QuorumRule::MASK_READ));
        assert!(!rules.current().is_allowed(QuorumRule::MASK_DISTRIBUTION));
    }

    #[test]
    fn test_no_rules_allows_everything() {
        let rules = QuorumRules::new(vec![]);
        rules.update(0);
        assert_eq!(rules.current(), QuorumRule::ALL_ALLOWED);
    }

    #[test]
    fn test_distribution_quorum_not_sticky() {
        let policy = PartitionedQuorumPolicy::from_config(&QuorumConfig {
            distribution_quorum: 3,
            ..Default::default()
        });
        let small = context(2);
        policy.init(&small);
        assert!(!policy.is_allowed(&small, &Action::Distribute));
        assert!(policy.is_allowed(&small, &Action::Read));
        assert!(policy.is_allowed(&small, &Action::Connect));

        let big = context(3);
        policy.on_membership_change(&big);
        assert!(policy.is_allowed(&big, &Action::Distribute));

        policy.on_membership_change(&small);
        assert!(!policy.is_allowed(&small, &Action::Distribute));
        assert_eq!(
            policy.status_description(),
            "allowed-actions=restore, read, write, recover, join"
        );
    }

    #[test]
    fn test_leaving_members_do_not_count() {
        let policy = PartitionedQuorumPolicy::from_config(&QuorumConfig {
            restore_quorum: 2,
            ..Default::default()
        });
        let mut ctx = context(2);
        policy.init(&ctx);
        assert!(policy.is_allowed(&ctx, &Action::Restore));

        let first = ctx.members().next().cloned().unwrap();
        ctx.apply(&MembershipEvent::Leaving(first));
        policy.on_membership_change(&ctx);
        assert!(!policy.is_allowed(&ctx, &Action::Restore));
    }

    #[test]
    fn test_recovery_requires_capacity() {
        let policy = PartitionedQuorumPolicy::from_config(&QuorumConfig::default());
        let last_known: Vec<Member> = (1..=6).map(Member::new).collect();
        let action = Action::Recover(PartitionRecoveryAction::new(
            100,
            (0..100).collect::<BTreeSet<_>>(),
            Some(QuorumInfo::new(last_known)),
            None,
        ));

        let ctx = context(3);
        policy.init(&ctx);
        // 2/3 of 6 is 4
        assert!(!policy.is_allowed(&ctx, &action));

        let ctx = context(4);
        policy.on_membership_change(&ctx);
        assert!(policy.is_allowed(&ctx, &action));
    }

    struct Unreachable(BTreeSet<PartitionId>);

    impl GuidResolver for Unreachable {
        fn newest_holder(&self, _partition: PartitionId) -> Option<Uuid> {
            None
        }

        fn unresolved_partitions(&self) -> BTreeSet<PartitionId> {
            self.0.clone()
        }
    }

    fn recover(
        orphaned: impl IntoIterator<Item = PartitionId>,
        missing: impl IntoIterator<Item = PartitionId>,
    ) -> Action {
        Action::Recover(PartitionRecoveryAction::new(
            8,
            orphaned.into_iter().collect(),
            None,
            Some(Arc::new(Unreachable(missing.into_iter().collect()))),
        ))
    }

    #[test]
    fn test_recovery_without_quorum_info() {
        let policy = PartitionedQuorumPolicy::from_config(&QuorumConfig::default());
        let ctx = context(2);
        policy.init(&ctx);

        // Fresh deployment: nothing has ever been persisted
        assert!(policy.is_allowed(&ctx, &recover(0..8, 0..8)));
        // Everything reachable
        assert!(policy.is_allowed(&ctx, &recover(0..8, [])));
        // Reachable orphans while other partitions still have owners
        assert!(policy.is_allowed(&ctx, &recover(0..4, 6..8)));

        assert!(!policy.is_allowed(&ctx, &recover(0..4, 3..5)));
        assert!(!policy.is_allowed(&ctx, &recover(0..8, 6..8)));
    }

    #[test]
    fn test_proxy_connect_gate() {
        let policy = ProxyQuorumPolicy::new(2);
        let one = context(1);
        policy.init(&one);
        assert!(!policy.is_allowed(&one, &Action::Connect));
        assert!(policy.is_allowed(&one, &Action::Write));

        let two = context(2);
        policy.on_membership_change(&two);
        assert!(policy.is_allowed(&two, &Action::Connect));
    }

    #[test]
    fn test_min_threshold() {
        assert_eq!(min_threshold(6, 0.0), 4);
        assert_eq!(min_threshold(6, 0.5), 3);
        assert_eq!(min_threshold(1, 0.0), 1);
    }
}

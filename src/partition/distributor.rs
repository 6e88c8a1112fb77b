//! Distribution coordinator
//!
//! Owns the membership view of a partitioned service and drives
//! distribution cycles. A cycle:
//!
//! 1. plans recovery for orphaned partitions and, if `Restore` (and
//!    `Recover`, when a resolver is configured) is allowed, commits it;
//! 2. plans routine distribution for everything recovery did not touch and,
//!    if `Distribute` is allowed, commits it.
//!
//! Denied plans are simply not committed; the next cycle re-plans from the
//! current table, so a deferred plan resumes as soon as the policy allows.
//! Optimistic conflicts are retried with backoff.

use crate::common::config::PartitionConfig;
use crate::common::member::{Member, MembershipEvent, PartitionId, ServiceContext};
use crate::common::utils::retry_with_backoff;
use crate::common::{Error, Result};
use crate::partition::recovery::{GuidResolver, PartitionRecoveryAction, QuorumInfo};
use crate::partition::strategy::PartitionAssignmentStrategy;
use crate::partition::table::PartitionOwnershipTable;
use crate::policy::{check_allowed, Action, ActionPolicy};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Outcome of one distribution cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Orphans assigned an owner
    pub recovered: usize,
    /// Orphans assigned with no surviving copy
    pub lost: usize,
    /// Distribution moves committed (handoffs and backup changes)
    pub moved: usize,
    /// Orphans still unowned after the cycle
    pub orphaned: usize,
    pub in_flight: usize,
    /// A plan was held back by the action policy
    pub deferred: bool,
    pub table_version: u64,
}

impl CycleReport {
    pub fn is_quiescent(&self) -> bool {
        self.recovered == 0 && self.moved == 0 && self.in_flight == 0 && self.orphaned == 0
    }
}

pub struct DistributionCoordinator {
    config: PartitionConfig,
    table: Arc<PartitionOwnershipTable>,
    strategy: Arc<dyn PartitionAssignmentStrategy>,
    policy: Arc<dyn ActionPolicy>,
    resolver: Option<Arc<dyn GuidResolver>>,
    context: RwLock<ServiceContext>,
    quorum_info: Mutex<Option<QuorumInfo>>,
    deferred: AtomicBool,
}

impl DistributionCoordinator {
    pub fn new(
        config: PartitionConfig,
        table: Arc<PartitionOwnershipTable>,
        strategy: Arc<dyn PartitionAssignmentStrategy>,
        policy: Arc<dyn ActionPolicy>,
        context: ServiceContext,
    ) -> Self {
        policy.init(&context);
        Self {
            config,
            table,
            strategy,
            policy,
            resolver: None,
            context: RwLock::new(context),
            quorum_info: Mutex::new(None),
            deferred: AtomicBool::new(false),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn GuidResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn table(&self) -> &Arc<PartitionOwnershipTable> {
        &self.table
    }

    pub fn policy(&self) -> &Arc<dyn ActionPolicy> {
        &self.policy
    }

    pub fn strategy(&self) -> &Arc<dyn PartitionAssignmentStrategy> {
        &self.strategy
    }

    /// Copy of the current membership view
    pub fn context(&self) -> ServiceContext {
        self.context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::Acquire)
    }

    /// Apply a membership event and notify the policy
    ///
    /// Returns the partitions orphaned by a departure.
    pub fn on_membership_event(&self, event: &MembershipEvent) -> BTreeSet<PartitionId> {
        let mut orphaned = BTreeSet::new();
        let snapshot = {
            let mut context = self.context.write().unwrap_or_else(PoisonError::into_inner);
            context.apply(event);
            context.clone()
        };

        match event {
            MembershipEvent::Joined(member) => {
                tracing::info!(member = %member, "Member joined");
            }
            MembershipEvent::Leaving(member) => {
                tracing::info!(member = %member, "Member leaving; draining partitions");
            }
            MembershipEvent::Left(member) => {
                orphaned = self.table.member_departed(member);
                tracing::info!(member = %member, orphaned = orphaned.len(), "Member left");
            }
            MembershipEvent::Recovered(member) => {
                self.table.member_recovered(member);
                tracing::info!(member = %member, "Member recovered");
            }
        }

        self.policy.on_membership_change(&snapshot);
        orphaned
    }

    pub fn is_allowed(&self, action: &Action) -> bool {
        let context = self.context.read().unwrap_or_else(PoisonError::into_inner);
        self.policy.is_allowed(&context, action)
    }

    pub fn check_allowed(&self, action: &Action) -> Result<()> {
        let context = self.context.read().unwrap_or_else(PoisonError::into_inner);
        check_allowed(self.policy.as_ref(), &context, action)
    }

    fn last_quorum_info(&self) -> Option<QuorumInfo> {
        self.resolver
            .as_ref()
            .and_then(|r| r.quorum_info())
            .or_else(|| {
                self.quorum_info
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
    }

    fn set_deferred(&self, deferred: bool, reason: &str) {
        let was = self.deferred.swap(deferred, Ordering::AcqRel);
        if deferred && !was {
            tracing::info!(reason, "Distribution deferred by action policy");
        } else if !deferred && was {
            tracing::info!("Distribution resumed");
        }
    }

    /// Run one distribution cycle without retrying conflicts
    pub fn run_cycle(&self) -> Result<CycleReport> {
        let context = self.context();
        let mut report = CycleReport::default();
        let mut deferred = false;
        let mut touched = BTreeSet::new();

        let snapshot = self.table.snapshot();
        let orphans = snapshot.orphaned();
        if !orphans.is_empty() {
            let recovery = self
                .strategy
                .plan_recovery(&snapshot, &context, self.resolver.as_deref());
            if recovery.plan.is_empty() {
                tracing::debug!(orphans = orphans.len(), "No eligible members to recover orphans");
            } else {
                let mut allowed = self.policy.is_allowed(&context, &Action::Restore);
                if allowed && self.resolver.is_some() {
                    let action = Action::Recover(PartitionRecoveryAction::new(
                        self.config.partition_count,
                        orphans.clone(),
                        self.last_quorum_info(),
                        self.resolver.clone(),
                    ));
                    allowed = self.policy.is_allowed(&context, &action);
                }
                if allowed {
                    self.table.apply(&recovery.plan)?;
                    touched = recovery.plan.partitions();
                    report.recovered = touched.len();
                    report.lost = recovery.lost.len();
                    if !recovery.lost.is_empty() {
                        tracing::error!(
                            partitions = ?recovery.lost,
                            "Partitions lost; assigned empty replacements"
                        );
                    }
                } else {
                    deferred = true;
                }
            }
        }

        let snapshot = if touched.is_empty() {
            snapshot
        } else {
            self.table.snapshot()
        };
        let budget = self
            .config
            .max_in_flight
            .saturating_sub(snapshot.in_flight());
        let plan = self
            .strategy
            .plan_distribution(&snapshot, &context, budget, &touched);
        if !plan.is_empty() {
            if self.policy.is_allowed(&context, &Action::Distribute) {
                self.table.apply(&plan)?;
                report.moved = plan.len();
            } else {
                deferred = true;
            }
        }

        self.set_deferred(deferred, &self.policy.status_description());
        report.deferred = deferred;
        report.orphaned = self.table.orphaned_partitions().len();
        report.in_flight = self.table.in_flight_count();
        report.table_version = self.table.table_version();

        if report.orphaned == 0 {
            let members: Vec<Member> = context.ownership_members().cloned().collect();
            *self.quorum_info.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(QuorumInfo::new(members));
        }

        tracing::debug!(
            recovered = report.recovered,
            moved = report.moved,
            in_flight = report.in_flight,
            deferred = report.deferred,
            "Distribution cycle complete"
        );
        Ok(report)
    }

    /// Run a cycle, re-planning on optimistic conflicts
    pub async fn rebalance(&self) -> Result<CycleReport> {
        retry_with_backoff(
            || async { self.run_cycle() },
            self.config.apply_retries,
            Duration::from_millis(self.config.retry_backoff_ms),
        )
        .await
    }

    pub fn confirm_handoff(&self, partition: PartitionId) -> Result<u64> {
        self.table.confirm_handoff(partition)
    }

    pub fn abort_handoff(&self, partition: PartitionId) -> Result<()> {
        self.table.abort_handoff(partition)
    }

    /// Confirm a batch of handoffs
    ///
    /// Every partition is attempted; partial failure is reported as
    /// [`Error::Incomplete`].
    pub fn confirm_handoffs(&self, partitions: &[PartitionId]) -> Result<usize> {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for &p in partitions {
            match self.table.confirm_handoff(p) {
                Ok(_) => succeeded.push(p.to_string()),
                Err(e) => {
                    tracing::debug!(partition = p, error = %e, "Handoff confirmation failed");
                    failed.push(p.to_string());
                }
            }
        }
        if failed.is_empty() {
            Ok(succeeded.len())
        } else {
            Err(Error::Incomplete { succeeded, failed })
        }
    }

    /// Confirm every pending handoff
    pub fn confirm_all(&self) -> Result<usize> {
        let pending: Vec<PartitionId> = self.table.in_flight_partitions().into_iter().collect();
        self.confirm_handoffs(&pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::strategy::SimpleAssignmentStrategy;
    use crate::policy::AllowAllPolicy;

    fn coordinator(partitions: u32, backups: usize, policy: Arc<dyn ActionPolicy>) -> DistributionCoordinator {
        let config = PartitionConfig {
            partition_count: partitions,
            backup_count: backups,
            ..Default::default()
        };
        DistributionCoordinator::new(
            config,
            Arc::new(PartitionOwnershipTable::new(partitions, backups)),
            Arc::new(SimpleAssignmentStrategy),
            policy,
            ServiceContext::new("test"),
        )
    }

    #[test]
    fn test_first_member_takes_everything() {
        let coord = coordinator(16, 1, Arc::new(AllowAllPolicy));
        let a = Member::new(1);
        coord.on_membership_event(&MembershipEvent::Joined(a.clone()));

        let report = coord.run_cycle().unwrap();
        assert_eq!(report.recovered, 16);
        assert_eq!(report.lost, 0);
        assert_eq!(report.orphaned, 0);
        assert_eq!(coord.table().owned_partitions(&a, false).len(), 16);
    }

    #[test]
    fn test_cycle_with_no_members_leaves_orphans() {
        let coord = coordinator(4, 0, Arc::new(AllowAllPolicy));
        let report = coord.run_cycle().unwrap();
        assert_eq!(report.orphaned, 4);
        assert!(!report.deferred);
    }

    #[test]
    fn test_confirm_handoffs_reports_partial_failure() {
        let coord = coordinator(8, 0, Arc::new(AllowAllPolicy));
        coord.on_membership_event(&MembershipEvent::Joined(Member::new(1)));
        coord.run_cycle().unwrap();
        coord.on_membership_event(&MembershipEvent::Joined(Member::new(2)));
        let report = coord.run_cycle().unwrap();
        assert_eq!(report.in_flight, 4);

        let mut pending: Vec<PartitionId> = coord.table().in_flight_partitions().into_iter().collect();
        pending.push(7_000);
        match coord.confirm_handoffs(&pending) {
            Err(Error::Incomplete { succeeded, failed }) => {
                assert_eq!(succeeded.len(), 4);
                assert_eq!(failed, vec!["7000".to_string()]);
            }
            other => panic!("expected incomplete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rebalance_converges() {
        let coord = coordinator(10, 1, Arc::new(AllowAllPolicy));
        let members: Vec<Member> = (1..=3).map(Member::new).collect();
        for m in &members {
            coord.on_membership_event(&MembershipEvent::Joined(m.clone()));
        }
        for _ in 0..10 {
            let report = coord.rebalance().await.unwrap();
            coord.confirm_all().unwrap();
            if report.is_quiescent() {
                break;
            }
        }
        let counts: Vec<usize> = members
            .iter()
            .map(|m| coord.table().owned_partitions(m, false).len())
            .collect();
        let max = counts.iter().max().copied().unwrap_or(0);
        let min = counts.iter().min().copied().unwrap_or(0);
        assert!(max - min <= 1, "unbalanced: {:?}", counts);
        coord.table().check_invariants().unwrap();
    }
}

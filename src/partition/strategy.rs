//! Partition assignment strategies
//!
//! A strategy turns an [`OwnershipSnapshot`] plus the current membership view
//! into a [`TransitionPlan`]. Strategies are pure planners: they never touch
//! the table, and every move they emit carries the version it was computed
//! against so a stale plan is rejected on commit.

use crate::common::member::{Member, PartitionId, ServiceContext};
use crate::partition::recovery::GuidResolver;
use crate::partition::table::{OwnershipSnapshot, PartitionEntry, PartitionMove, TransitionPlan};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// Outcome of planning recovery for orphaned partitions
#[derive(Debug, Clone, Default)]
pub struct RecoveryPlan {
    pub plan: TransitionPlan,
    /// Previously owned partitions reassigned with no surviving copy
    pub lost: BTreeSet<PartitionId>,
}

/// Pluggable partition placement
pub trait PartitionAssignmentStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Assign an owner to every orphaned partition
    fn plan_recovery(
        &self,
        snapshot: &OwnershipSnapshot,
        service: &ServiceContext,
        resolver: Option<&dyn GuidResolver>,
    ) -> RecoveryPlan;

    /// Move partitions toward a balanced assignment
    ///
    /// At most `budget` primary transfers are started. Partitions in
    /// `exclude` are left alone.
    fn plan_distribution(
        &self,
        snapshot: &OwnershipSnapshot,
        service: &ServiceContext,
        budget: usize,
        exclude: &BTreeSet<PartitionId>,
    ) -> TransitionPlan;
}

/// Number of backups each partition can actually have with this membership
fn backup_target(configured: usize, eligible: usize) -> usize {
    configured.min(eligible.saturating_sub(1))
}

/// Per-member primary and backup counts used while planning
#[derive(Debug, Default)]
struct Loads {
    primary: HashMap<Uuid, usize>,
    backup: HashMap<Uuid, usize>,
}

impl Loads {
    fn from_snapshot(snapshot: &OwnershipSnapshot, eligible: &[Member]) -> Self {
        let mut loads = Loads::default();
        for m in eligible {
            loads.primary.insert(m.uuid, 0);
            loads.backup.insert(m.uuid, 0);
        }
        for entry in &snapshot.entries {
            if let Some(target) = entry.target_primary() {
                *loads.primary.entry(target.uuid).or_default() += 1;
            }
            let backups = entry
                .pending()
                .map(|t| t.backups.as_slice())
                .unwrap_or(entry.backups());
            for b in backups {
                *loads.backup.entry(b.uuid).or_default() += 1;
            }
        }
        loads
    }

    fn primary_of(&self, member: &Member) -> usize {
        self.primary.get(&member.uuid).copied().unwrap_or(0)
    }

    fn backup_of(&self, member: &Member) -> usize {
        self.backup.get(&member.uuid).copied().unwrap_or(0)
    }

    fn least_loaded<'a>(&self, eligible: &'a [Member]) -> Option<&'a Member> {
        eligible.iter().min_by_key(|m| (self.primary_of(m), m.id))
    }

    fn shift_primary(&mut self, from: Option<&Member>, to: &Member) {
        if let Some(from) = from {
            if let Some(n) = self.primary.get_mut(&from.uuid) {
                *n = n.saturating_sub(1);
            }
        }
        *self.primary.entry(to.uuid).or_default() += 1;
    }

    /// Choose backups for `primary`, keeping `preferred` members where possible
    ///
    /// `current` is the backup set already counted in the loads.
    fn settle_backups(
        &mut self,
        primary: &Member,
        current: &[Member],
        preferred: &[Member],
        eligible: &[Member],
        target: usize,
    ) -> Vec<Member> {
        for b in current {
            if let Some(n) = self.backup.get_mut(&b.uuid) {
                *n = n.saturating_sub(1);
            }
        }

        let mut backups: Vec<Member> = Vec::with_capacity(target);
        for m in preferred {
            if backups.len() == target {
                break;
            }
            if m != primary && !backups.contains(m) && eligible.contains(m) {
                backups.push(m.clone());
            }
        }

        while backups.len() < target {
            let pick = eligible
                .iter()
                .filter(|m| *m != primary && !backups.contains(m))
                .min_by_key(|m| {
                    let strong =
                        m.is_strong_with(primary) && backups.iter().all(|b| m.is_strong_with(b));
                    (!strong, self.backup_of(m), m.id)
                });
            match pick {
                Some(m) => backups.push(m.clone()),
                None => break,
            }
        }

        for b in &backups {
            *self.backup.entry(b.uuid).or_default() += 1;
        }
        backups
    }
}

/// Balances primaries by count and places backups on distinct machines
/// where possible
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleAssignmentStrategy;

impl SimpleAssignmentStrategy {
    pub fn new() -> Self {
        Self
    }

    fn movable(entry: &PartitionEntry, partition: PartitionId, exclude: &BTreeSet<PartitionId>) -> bool {
        entry.primary().is_some() && entry.pending().is_none() && !exclude.contains(&partition)
    }
}

impl PartitionAssignmentStrategy for SimpleAssignmentStrategy {
    fn name(&self) -> &str {
        "simple"
    }

    fn plan_recovery(
        &self,
        snapshot: &OwnershipSnapshot,
        service: &ServiceContext,
        resolver: Option<&dyn GuidResolver>,
    ) -> RecoveryPlan {
        let mut result = RecoveryPlan::default();
        let eligible = service.eligible_members();
        if eligible.is_empty() {
            return result;
        }
        let target = backup_target(snapshot.backup_count, eligible.len());
        let mut loads = Loads::from_snapshot(snapshot, &eligible);

        for (p, entry) in snapshot.entries.iter().enumerate() {
            if !entry.is_orphaned() || entry.pending().is_some() {
                continue;
            }
            let partition = p as PartitionId;

            let promoted = entry.backups().iter().find(|b| eligible.contains(b));
            let restored = || {
                resolver
                    .and_then(|r| r.newest_holder(partition))
                    .and_then(|uuid| eligible.iter().find(|m| m.uuid == uuid))
            };
            let (primary, lost) = match promoted.or_else(restored) {
                Some(m) => (m.clone(), false),
                None => match loads.least_loaded(&eligible) {
                    // Version 0 means the partition was never owned
                    Some(m) => (m.clone(), entry.version() > 0),
                    None => continue,
                },
            };

            loads.shift_primary(None, &primary);
            let backups =
                loads.settle_backups(&primary, entry.backups(), entry.backups(), &eligible, target);

            result.plan.push(PartitionMove {
                partition,
                expected_version: entry.version(),
                new_primary: primary,
                new_backups: backups,
            });
            if lost {
                result.lost.insert(partition);
            }
        }
        result
    }

    fn plan_distribution(
        &self,
        snapshot: &OwnershipSnapshot,
        service: &ServiceContext,
        mut budget: usize,
        exclude: &BTreeSet<PartitionId>,
    ) -> TransitionPlan {
        let mut plan = TransitionPlan::new();
        let eligible = service.eligible_members();
        if eligible.is_empty() {
            return plan;
        }
        let target = backup_target(snapshot.backup_count, eligible.len());
        let mut loads = Loads::from_snapshot(snapshot, &eligible);
        let mut moved: BTreeSet<PartitionId> = BTreeSet::new();

        // Drain primaries off members that can no longer own
        for (p, entry) in snapshot.entries.iter().enumerate() {
            if budget == 0 {
                break;
            }
            let partition = p as PartitionId;
            if !Self::movable(entry, partition, exclude) {
                continue;
            }
            let Some(current) = entry.primary() else {
                continue;
            };
            if eligible.contains(current) {
                continue;
            }
            let promoted = entry.backups().iter().find(|b| eligible.contains(b));
            let Some(new_primary) = promoted.or_else(|| loads.least_loaded(&eligible)).cloned() else {
                break;
            };
            loads.shift_primary(Some(current), &new_primary);
            let backups =
                loads.settle_backups(&new_primary, entry.backups(), entry.backups(), &eligible, target);
            plan.push(PartitionMove {
                partition,
                expected_version: entry.version(),
                new_primary,
                new_backups: backups,
            });
            moved.insert(partition);
            budget -= 1;
        }

        // Balance primary counts, moving from the heaviest to the lightest
        let mut exhausted: HashSet<Uuid> = HashSet::new();
        while budget > 0 {
            let donor = eligible
                .iter()
                .filter(|m| !exhausted.contains(&m.uuid))
                .max_by_key(|m| (loads.primary_of(m), Reverse(m.id)))
                .cloned();
            let receiver = loads.least_loaded(&eligible).cloned();
            let (Some(donor), Some(receiver)) = (donor, receiver) else {
                break;
            };
            if loads.primary_of(&donor) <= loads.primary_of(&receiver) + 1 {
                break;
            }

            let candidates: Vec<(PartitionId, &PartitionEntry)> = snapshot
                .entries
                .iter()
                .enumerate()
                .map(|(p, e)| (p as PartitionId, e))
                .filter(|(p, e)| {
                    Self::movable(e, *p, exclude) && !moved.contains(p) && e.primary() == Some(&donor)
                })
                .collect();
            // Promoting an existing backup avoids a full copy
            let choice = candidates
                .iter()
                .find(|(_, e)| e.backups().contains(&receiver))
                .or(candidates.first());
            let Some(&(partition, entry)) = choice else {
                exhausted.insert(donor.uuid);
                continue;
            };

            let mut preferred: Vec<Member> = entry
                .backups()
                .iter()
                .filter(|b| **b != receiver)
                .cloned()
                .collect();
            preferred.push(donor.clone());

            loads.shift_primary(Some(&donor), &receiver);
            let backups =
                loads.settle_backups(&receiver, entry.backups(), &preferred, &eligible, target);
            plan.push(PartitionMove {
                partition,
                expected_version: entry.version(),
                new_primary: receiver,
                new_backups: backups,
            });
            moved.insert(partition);
            budget -= 1;
        }

        // Top up or prune backups everywhere else
        for (p, entry) in snapshot.entries.iter().enumerate() {
            let partition = p as PartitionId;
            if !Self::movable(entry, partition, exclude) || moved.contains(&partition) {
                continue;
            }
            let Some(primary) = entry.primary() else {
                continue;
            };
            let backups =
                loads.settle_backups(primary, entry.backups(), entry.backups(), &eligible, target);
            if backups.as_slice() != entry.backups() {
                plan.push(PartitionMove {
                    partition,
                    expected_version: entry.version(),
                    new_primary: primary.clone(),
                    new_backups: backups,
                });
            }
        }

        plan
    }
}

//! Partition ownership table
//!
//! Authoritative partition → (primary, backups, version) mapping. Every entry
//! sits behind its own `RwLock` so lookups for one partition never contend
//! with writers of another. Writers never hold locks while planning: they
//! compute a [`TransitionPlan`] from a snapshot and commit it with
//! [`PartitionOwnershipTable::apply`], which rejects the whole batch if any
//! entry moved on since the snapshot was taken.
//!
//! A move that takes the primary away from a live member is not committed
//! straight away. The entry records a [`PendingTransfer`] and the old primary
//! keeps serving until the transfer layer calls `confirm_handoff` (or the old
//! primary departs, which orphans the partition).

use crate::common::member::{Member, PartitionId};
use crate::common::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Primary handoff awaiting confirmation
#[derive(Debug, Clone, Serialize)]
pub struct PendingTransfer {
    pub from: Member,
    pub to: Member,
    /// Backup set to install once the handoff commits
    pub backups: Vec<Member>,
}

/// Ownership of one partition
#[derive(Debug, Clone, Default, Serialize)]
pub struct PartitionEntry {
    primary: Option<Member>,
    backups: Vec<Member>,
    version: u64,
    pending: Option<PendingTransfer>,
}

impl PartitionEntry {
    pub fn primary(&self) -> Option<&Member> {
        self.primary.as_ref()
    }

    pub fn backups(&self) -> &[Member] {
        &self.backups
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn pending(&self) -> Option<&PendingTransfer> {
        self.pending.as_ref()
    }

    pub fn is_orphaned(&self) -> bool {
        self.primary.is_none()
    }

    /// The member that will be primary once any pending handoff settles
    pub fn target_primary(&self) -> Option<&Member> {
        self.pending
            .as_ref()
            .map(|p| &p.to)
            .or(self.primary.as_ref())
    }

    pub fn is_owned_by(&self, member: &Member, include_backups: bool) -> bool {
        self.primary.as_ref() == Some(member) || (include_backups && self.backups.contains(member))
    }

    fn install(&mut self, primary: Option<Member>, backups: Vec<Member>) -> bool {
        if self.primary == primary && self.backups == backups {
            return false;
        }
        self.primary = primary;
        self.backups = backups;
        self.version += 1;
        true
    }
}

/// Ownership change for a single partition
#[derive(Debug, Clone, Serialize)]
pub struct PartitionMove {
    pub partition: PartitionId,
    /// Version the planner observed; the move is rejected if it changed
    pub expected_version: u64,
    pub new_primary: Member,
    pub new_backups: Vec<Member>,
}

/// Batch of single-partition moves
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransitionPlan {
    pub moves: Vec<PartitionMove>,
}

impl TransitionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mv: PartitionMove) {
        self.moves.push(mv);
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn partitions(&self) -> BTreeSet<PartitionId> {
        self.moves.iter().map(|m| m.partition).collect()
    }

    pub fn extend(&mut self, other: TransitionPlan) {
        self.moves.extend(other.moves);
    }
}

/// Point-in-time copy of the whole table
///
/// Entries are copied one lock at a time, so the snapshot is only consistent
/// per partition; planners rely on the recorded versions.
#[derive(Debug, Clone)]
pub struct OwnershipSnapshot {
    pub entries: Vec<PartitionEntry>,
    pub backup_count: usize,
    pub table_version: u64,
}

impl OwnershipSnapshot {
    pub fn partition_count(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn entry(&self, partition: PartitionId) -> Option<&PartitionEntry> {
        self.entries.get(partition as usize)
    }

    pub fn orphaned(&self) -> BTreeSet<PartitionId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_orphaned())
            .map(|(p, _)| p as PartitionId)
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.entries.iter().filter(|e| e.pending.is_some()).count()
    }

    /// Primary count per member, attributing pending transfers to their target
    pub fn primary_count(&self, member: &Member) -> usize {
        self.entries
            .iter()
            .filter(|e| e.target_primary() == Some(member))
            .count()
    }
}

/// Authoritative ownership table
pub struct PartitionOwnershipTable {
    backup_count: usize,
    entries: Vec<RwLock<PartitionEntry>>,
    departed: RwLock<HashSet<Uuid>>,
    version: AtomicU64,
    in_flight: AtomicUsize,
}

impl PartitionOwnershipTable {
    /// Create a table with every partition unowned
    pub fn new(partition_count: u32, backup_count: usize) -> Self {
        Self {
            backup_count,
            entries: (0..partition_count)
                .map(|_| RwLock::new(PartitionEntry::default()))
                .collect(),
            departed: RwLock::new(HashSet::new()),
            version: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn backup_count(&self) -> usize {
        self.backup_count
    }

    /// Commit counter, bumped by every successful write
    pub fn table_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn slot(&self, partition: PartitionId) -> Result<&RwLock<PartitionEntry>> {
        self.entries
            .get(partition as usize)
            .ok_or(Error::PartitionOutOfRange {
                partition,
                count: self.partition_count(),
            })
    }

    // === Queries ===

    /// Primary owner; `None` while orphaned or out of range
    pub fn owner_of(&self, partition: PartitionId) -> Option<Member> {
        self.entries
            .get(partition as usize)
            .and_then(|slot| read(slot).primary.clone())
    }

    /// n-th backup owner, 1-indexed
    pub fn backup_owner_of(&self, partition: PartitionId, n: usize) -> Option<Member> {
        if n == 0 {
            return None;
        }
        self.entries
            .get(partition as usize)
            .and_then(|slot| read(slot).backups.get(n - 1).cloned())
    }

    pub fn version_of(&self, partition: PartitionId) -> Option<u64> {
        self.entries
            .get(partition as usize)
            .map(|slot| read(slot).version)
    }

    pub fn entry(&self, partition: PartitionId) -> Result<PartitionEntry> {
        Ok(read(self.slot(partition)?).clone())
    }

    /// Partitions owned by a member, as a copy
    pub fn owned_partitions(&self, member: &Member, include_backups: bool) -> BTreeSet<PartitionId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| read(slot).is_owned_by(member, include_backups))
            .map(|(p, _)| p as PartitionId)
            .collect()
    }

    pub fn orphaned_partitions(&self) -> BTreeSet<PartitionId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| read(slot).is_orphaned())
            .map(|(p, _)| p as PartitionId)
            .collect()
    }

    /// Partitions with a handoff pending
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn in_flight_partitions(&self) -> BTreeSet<PartitionId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| read(slot).pending.is_some())
            .map(|(p, _)| p as PartitionId)
            .collect()
    }

    pub fn snapshot(&self) -> OwnershipSnapshot {
        OwnershipSnapshot {
            table_version: self.table_version(),
            entries: self.entries.iter().map(|slot| read(slot).clone()).collect(),
            backup_count: self.backup_count,
        }
    }

    pub fn is_departed(&self, member: &Member) -> bool {
        read(&self.departed).contains(&member.uuid)
    }

    // === Writes ===

    fn validate_move(&self, mv: &PartitionMove, departed: &HashSet<Uuid>) -> Result<()> {
        if mv.new_backups.len() > self.backup_count {
            return Err(Error::InvalidPlan(format!(
                "partition {}: {} backups exceed backup count {}",
                mv.partition,
                mv.new_backups.len(),
                self.backup_count
            )));
        }
        let mut seen = HashSet::with_capacity(mv.new_backups.len() + 1);
        seen.insert(mv.new_primary.uuid);
        for backup in &mv.new_backups {
            if !seen.insert(backup.uuid) {
                return Err(Error::InvalidPlan(format!(
                    "partition {}: {} appears more than once",
                    mv.partition, backup
                )));
            }
        }
        if let Some(gone) = std::iter::once(&mv.new_primary)
            .chain(mv.new_backups.iter())
            .find(|m| departed.contains(&m.uuid))
        {
            return Err(Error::MemberDeparted(gone.to_string()));
        }
        Ok(())
    }

    /// Atomically commit a batch of moves
    ///
    /// Either every move is accepted or none is. Returns the new table version.
    pub fn apply(&self, plan: &TransitionPlan) -> Result<u64> {
        if plan.is_empty() {
            return Ok(self.table_version());
        }

        // Departures serialize against whole batches
        let departed = read(&self.departed);

        let mut order: Vec<&PartitionMove> = plan.moves.iter().collect();
        order.sort_by_key(|m| m.partition);
        if order.windows(2).any(|w| w[0].partition == w[1].partition) {
            return Err(Error::InvalidPlan("partition listed twice".into()));
        }
        for mv in &order {
            self.slot(mv.partition)?;
            self.validate_move(mv, &departed)?;
        }

        // Ascending partition order keeps multi-entry locking deadlock free
        let mut guards: Vec<RwLockWriteGuard<'_, PartitionEntry>> = order
            .iter()
            .map(|mv| write(&self.entries[mv.partition as usize]))
            .collect();

        for (mv, entry) in order.iter().zip(guards.iter()) {
            if entry.version != mv.expected_version {
                return Err(Error::VersionConflict {
                    partition: mv.partition,
                    expected: mv.expected_version,
                    actual: entry.version,
                });
            }
            if entry.pending.is_some() {
                return Err(Error::TransferInProgress(mv.partition));
            }
        }

        let mut started = 0;
        for (mv, entry) in order.iter().zip(guards.iter_mut()) {
            match entry.primary.clone() {
                Some(current) if current != mv.new_primary => {
                    tracing::debug!(
                        partition = mv.partition,
                        from = %current,
                        to = %mv.new_primary,
                        "Primary handoff started"
                    );
                    entry.pending = Some(PendingTransfer {
                        from: current,
                        to: mv.new_primary.clone(),
                        backups: mv.new_backups.clone(),
                    });
                    started += 1;
                }
                _ => {
                    entry.install(Some(mv.new_primary.clone()), mv.new_backups.clone());
                }
            }
        }
        // Counted before the entries unlock so a confirm never sees the slot uncounted
        self.in_flight.fetch_add(started, Ordering::AcqRel);
        drop(guards);

        Ok(self.version.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Commit a pending handoff; returns the partition's new version
    pub fn confirm_handoff(&self, partition: PartitionId) -> Result<u64> {
        let departed = read(&self.departed);
        let mut entry = write(self.slot(partition)?);
        let pending = entry
            .pending
            .take()
            .ok_or(Error::NoPendingTransfer(partition))?;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        let backups: Vec<Member> = pending
            .backups
            .into_iter()
            .filter(|m| !departed.contains(&m.uuid) && *m != pending.to)
            .collect();
        entry.install(Some(pending.to), backups);
        let version = entry.version;
        drop(entry);

        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(version)
    }

    /// Cancel a pending handoff, leaving ownership untouched
    pub fn abort_handoff(&self, partition: PartitionId) -> Result<()> {
        let mut entry = write(self.slot(partition)?);
        if entry.pending.take().is_none() {
            return Err(Error::NoPendingTransfer(partition));
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Strip a departed member from every entry
    ///
    /// Returns the partitions this departure orphaned.
    pub fn member_departed(&self, member: &Member) -> BTreeSet<PartitionId> {
        let mut departed = write(&self.departed);
        departed.insert(member.uuid);

        let mut orphaned = BTreeSet::new();
        let mut changed = false;
        for (p, slot) in self.entries.iter().enumerate() {
            let mut entry = write(slot);

            let cancel = entry
                .pending
                .as_ref()
                .is_some_and(|t| t.from == *member || t.to == *member);
            if cancel {
                entry.pending = None;
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
            } else if let Some(pending) = entry.pending.as_mut() {
                pending.backups.retain(|m| m != member);
            }

            let was_primary = entry.primary.as_ref() == Some(member);
            if was_primary || entry.backups.contains(member) {
                let primary = if was_primary { None } else { entry.primary.clone() };
                let backups = entry.backups.iter().filter(|m| *m != member).cloned().collect();
                entry.install(primary, backups);
                changed = true;
                if was_primary {
                    orphaned.insert(p as PartitionId);
                }
            }
        }
        drop(departed);

        if changed {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        if !orphaned.is_empty() {
            tracing::warn!(
                member = %member,
                orphaned = orphaned.len(),
                "Member departed while owning partitions"
            );
        }
        orphaned
    }

    /// Allow a member marked departed to own partitions again
    pub fn member_recovered(&self, member: &Member) {
        write(&self.departed).remove(&member.uuid);
    }

    /// Verify the structural invariants of every entry
    pub fn check_invariants(&self) -> Result<()> {
        let departed = read(&self.departed);
        for (p, slot) in self.entries.iter().enumerate() {
            let entry = read(slot);
            if entry.backups.len() > self.backup_count {
                return Err(Error::Internal(format!(
                    "partition {} has {} backups",
                    p,
                    entry.backups.len()
                )));
            }
            let mut seen = HashSet::new();
            for m in entry.primary.iter().chain(entry.backups.iter()) {
                if !seen.insert(m.uuid) {
                    return Err(Error::Internal(format!(
                        "partition {} lists {} twice",
                        p, m
                    )));
                }
                if departed.contains(&m.uuid) {
                    return Err(Error::Internal(format!(
                        "partition {} still owned by departed {}",
                        p, m
                    )));
                }
            }
        }
        Ok(())
    }
}

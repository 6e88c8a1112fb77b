//! Cluster members and the membership view handed to policies and planners
//!
//! Members are created by the membership feed and are never mutated by this
//! crate. Identity comparisons use the 128-bit UUID: the integer id is only
//! stable for the lifetime of a member and may be reused after it departs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Index of a partition within `0..partition_count`
pub type PartitionId = u32;

/// Short integer id of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub u32);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Informational identity attributes used by policies and placement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberIdentity {
    pub machine: Option<String>,
    pub rack: Option<String>,
    pub site: Option<String>,
    pub process: Option<String>,
    pub role: Option<String>,
    pub address: Option<String>,
}

/// A cluster participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub uuid: Uuid,
    pub identity: MemberIdentity,
    /// Whether this member may own partitions
    pub storage_enabled: bool,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    pub fn new(id: u32) -> Self {
        Self {
            id: MemberId(id),
            uuid: Uuid::new_v4(),
            identity: MemberIdentity::default(),
            storage_enabled: true,
            joined_at: Utc::now(),
        }
    }

    pub fn with_identity(mut self, identity: MemberIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_machine(mut self, machine: impl Into<String>) -> Self {
        self.identity.machine = Some(machine.into());
        self
    }

    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.identity.site = Some(site.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.identity.role = Some(role.into());
        self
    }

    pub fn storage_disabled(mut self) -> Self {
        self.storage_enabled = false;
        self
    }

    /// Machine name, falling back to the address when unset
    pub fn machine_key(&self) -> Option<&str> {
        self.identity
            .machine
            .as_deref()
            .filter(|m| !m.is_empty())
            .or(self.identity.address.as_deref())
    }

    /// Two members are "strong" relative to each other when losing one
    /// location cannot take out both.
    pub fn is_strong_with(&self, other: &Member) -> bool {
        fn differs(a: &Option<String>, b: &Option<String>) -> bool {
            matches!((a, b), (Some(x), Some(y)) if x != y)
        }
        let (a, b) = (&self.identity, &other.identity);
        differs(&a.site, &b.site) || differs(&a.rack, &b.rack) || differs(&a.machine, &b.machine)
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member(Id={}", self.id)?;
        if let Some(machine) = &self.identity.machine {
            write!(f, ", Machine={}", machine)?;
        }
        if let Some(role) = &self.identity.role {
            write!(f, ", Role={}", role)?;
        }
        write!(f, ")")
    }
}

/// Notification from the membership feed
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Joined(Member),
    /// Graceful exit announced; the member still holds its partitions
    Leaving(Member),
    Left(Member),
    /// A member previously considered departed is reachable again
    Recovered(Member),
}

impl MembershipEvent {
    pub fn member(&self) -> &Member {
        match self {
            MembershipEvent::Joined(m)
            | MembershipEvent::Leaving(m)
            | MembershipEvent::Left(m)
            | MembershipEvent::Recovered(m) => m,
        }
    }
}

/// Point-in-time membership view of one service
///
/// Handed to policies and planners by reference; they never retain it.
#[derive(Debug, Clone, Default)]
pub struct ServiceContext {
    name: String,
    local: Option<Member>,
    members: BTreeMap<MemberId, Member>,
    leaving: HashSet<Uuid>,
}

impl ServiceContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_local(mut self, local: Member) -> Self {
        self.members.insert(local.id, local.clone());
        self.local = Some(local);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.name
    }

    pub fn local_member(&self) -> Option<&Member> {
        self.local.as_ref()
    }

    /// Apply a membership event to the view
    pub fn apply(&mut self, event: &MembershipEvent) {
        match event {
            MembershipEvent::Joined(m) | MembershipEvent::Recovered(m) => {
                self.leaving.remove(&m.uuid);
                self.members.insert(m.id, m.clone());
            }
            MembershipEvent::Leaving(m) => {
                if self.members.contains_key(&m.id) {
                    self.leaving.insert(m.uuid);
                }
            }
            MembershipEvent::Left(m) => {
                self.leaving.remove(&m.uuid);
                if self.members.get(&m.id).is_some_and(|cur| cur.uuid == m.uuid) {
                    self.members.remove(&m.id);
                }
            }
        }
    }

    /// All live service members, ordered by id
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn get(&self, id: MemberId) -> Option<&Member> {
        self.members.get(&id)
    }

    pub fn contains(&self, member: &Member) -> bool {
        self.members.get(&member.id).is_some_and(|m| m.uuid == member.uuid)
    }

    pub fn is_leaving(&self, member: &Member) -> bool {
        self.leaving.contains(&member.uuid)
    }

    /// Storage-enabled members, including those that are leaving
    pub fn ownership_members(&self) -> impl Iterator<Item = &Member> {
        self.members.values().filter(|m| m.storage_enabled)
    }

    /// Storage-enabled members that are not leaving: the ones a planner may
    /// hand partitions to
    pub fn eligible_members(&self) -> Vec<Member> {
        self.ownership_members()
            .filter(|m| !self.is_leaving(m))
            .cloned()
            .collect()
    }

    /// Population counted by membership quorum rules
    pub fn ownership_population(&self) -> usize {
        self.ownership_members()
            .filter(|m| !self.is_leaving(m))
            .count()
    }

    /// Live, non-leaving members regardless of storage role
    pub fn service_population(&self) -> usize {
        self.members.values().filter(|m| !self.is_leaving(m)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_identity_equality() {
        let a = Member::new(1);
        let mut b = a.clone();
        b.identity.machine = Some("other".into());
        assert_eq!(a, b);

        // Same id, different incarnation
        let c = Member::new(1);
        assert_ne!(a, c);
    }

    #[test]
    fn test_service_context_events() {
        let mut ctx = ServiceContext::new("grid");
        let m1 = Member::new(1);
        let m2 = Member::new(2).storage_disabled();
        ctx.apply(&MembershipEvent::Joined(m1.clone()));
        ctx.apply(&MembershipEvent::Joined(m2.clone()));

        assert_eq!(ctx.member_count(), 2);
        assert_eq!(ctx.ownership_population(), 1);

        ctx.apply(&MembershipEvent::Leaving(m1.clone()));
        assert!(ctx.is_leaving(&m1));
        assert_eq!(ctx.ownership_population(), 0);
        assert!(ctx.eligible_members().is_empty());

        ctx.apply(&MembershipEvent::Left(m1.clone()));
        assert!(!ctx.contains(&m1));
        assert!(!ctx.is_leaving(&m1));
    }

    #[test]
    fn test_left_ignores_stale_incarnation() {
        let mut ctx = ServiceContext::new("grid");
        let old = Member::new(4);
        let new = Member::new(4);
        ctx.apply(&MembershipEvent::Joined(new.clone()));
        ctx.apply(&MembershipEvent::Left(old));
        assert!(ctx.contains(&new));
    }

    #[test]
    fn test_strength() {
        let a = Member::new(1).with_machine("m1");
        let b = Member::new(2).with_machine("m2");
        let c = Member::new(3).with_machine("m1");
        let d = Member::new(4);
        assert!(a.is_strong_with(&b));
        assert!(!a.is_strong_with(&c));
        assert!(!a.is_strong_with(&d));
    }
}

use crate::balancer::load::{LoadComparator, ServiceLoad};
use crate::balancer::{ClientInfo, ServiceLoadBalancer};
use crate::common::member::Member;
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Bucket {
    load: ServiceLoad,
    members: Vec<Member>,
}

#[derive(Debug, Default)]
struct State {
    loads: HashMap<Uuid, ServiceLoad>,
    /// Kept sorted by the comparator, lightest first
    buckets: Vec<Bucket>,
}

/// Groups members into buckets of equal load and prefers lighter buckets
///
/// Members in the same bucket are shuffled on every call so equally loaded
/// members share new connections.
pub struct SimpleServiceLoadBalancer<C: LoadComparator> {
    comparator: C,
    state: Mutex<State>,
}

impl<C: LoadComparator> SimpleServiceLoadBalancer<C> {
    pub fn new(comparator: C) -> Self {
        Self {
            comparator,
            state: Mutex::new(State::default()),
        }
    }

    fn locate(&self, buckets: &[Bucket], load: &ServiceLoad) -> std::result::Result<usize, usize> {
        buckets.binary_search_by(|b| self.comparator.compare(&b.load, load))
    }

    pub fn member_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .loads
            .len()
    }
}

impl<C: LoadComparator> ServiceLoadBalancer for SimpleServiceLoadBalancer<C> {
    fn update(&self, member: &Member, load: Option<ServiceLoad>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(previous) = state.loads.remove(&member.uuid) {
            if let Ok(i) = self.locate(&state.buckets, &previous) {
                state.buckets[i].members.retain(|m| m != member);
                if state.buckets[i].members.is_empty() {
                    state.buckets.remove(i);
                }
            }
        }

        if let Some(load) = load {
            state.loads.insert(member.uuid, load);
            match self.locate(&state.buckets, &load) {
                Ok(i) => state.buckets[i].members.push(member.clone()),
                Err(i) => state.buckets.insert(
                    i,
                    Bucket {
                        load,
                        members: vec![member.clone()],
                    },
                ),
            }
        }
    }

    fn member_list(&self, _client: &ClientInfo) -> Option<Vec<Member>> {
        let buckets = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.buckets.is_empty() {
                return None;
            }
            state.buckets.clone()
        };

        let mut rng = rand::thread_rng();
        let mut members = Vec::new();
        for mut bucket in buckets {
            bucket.members.shuffle(&mut rng);
            members.extend(bucket.members);
        }
        Some(members)
    }

    fn load_of(&self, member: &Member) -> Option<ServiceLoad> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .loads
            .get(&member.uuid)
            .copied()
    }

    fn compare(&self, a: &ServiceLoad, b: &ServiceLoad) -> Ordering {
        self.comparator.compare(a, b)
    }
}

//! Client connection load balancing
//!
//! Members publish [`ServiceLoad`] snapshots; the balancer keeps them in
//! load order and, on each new client connection, answers with the members
//! the client should prefer.

pub mod load;
pub mod simple;

pub use load::{
    BacklogSignal, ConnectionCountOrder, LoadComparator, LoadPublisher, NaturalLoadOrder,
    ServiceLoad,
};
pub use simple::SimpleServiceLoadBalancer;

use crate::common::config::LoadOrder;
use crate::common::member::Member;
use std::cmp::Ordering;
use std::sync::Arc;

/// What is known about a connecting client
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub address: Option<String>,
    pub member: Option<Member>,
}

/// Decides which members new client connections should go to
pub trait ServiceLoadBalancer: Send + Sync {
    /// Record a member's load; `None` forgets the member
    fn update(&self, member: &Member, load: Option<ServiceLoad>);

    /// Members in preference order, or `None` for no preference
    fn member_list(&self, client: &ClientInfo) -> Option<Vec<Member>>;

    /// Last load recorded for a member
    fn load_of(&self, member: &Member) -> Option<ServiceLoad>;

    fn compare(&self, a: &ServiceLoad, b: &ServiceLoad) -> Ordering;
}

/// Result of admitting a connection on the local member
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Client should reconnect to one of these, in order
    Redirect(Vec<Member>),
}

/// Decide whether the local member keeps a new connection
///
/// Redirects only when some member is strictly less loaded than the local
/// one, so a redirect never lands the client somewhere worse.
pub fn admit(balancer: &dyn ServiceLoadBalancer, local: &Member, client: &ClientInfo) -> Admission {
    let Some(list) = balancer.member_list(client) else {
        return Admission::Accept;
    };
    let Some(first) = list.first() else {
        return Admission::Accept;
    };
    if first == local {
        return Admission::Accept;
    }
    match (balancer.load_of(first), balancer.load_of(local)) {
        (Some(best), Some(ours)) if balancer.compare(&best, &ours) == Ordering::Less => {
            Admission::Redirect(list)
        }
        _ => Admission::Accept,
    }
}

/// Build the balancer for a configured load order
pub fn from_order(order: LoadOrder) -> Arc<dyn ServiceLoadBalancer> {
    match order {
        LoadOrder::Natural => Arc::new(SimpleServiceLoadBalancer::new(NaturalLoadOrder)),
        LoadOrder::ConnectionCount => Arc::new(SimpleServiceLoadBalancer::new(ConnectionCountOrder)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(connections: u32) -> ServiceLoad {
        ServiceLoad {
            connection_count: connections,
            ..Default::default()
        }
    }

    #[test]
    fn test_admit_redirects_only_to_lighter() {
        let balancer = from_order(LoadOrder::Natural);
        let local = Member::new(1);
        let other = Member::new(2);
        let client = ClientInfo::default();

        assert_eq!(admit(balancer.as_ref(), &local, &client), Admission::Accept);

        balancer.update(&local, Some(load(10)));
        balancer.update(&other, Some(load(10)));
        assert_eq!(admit(balancer.as_ref(), &local, &client), Admission::Accept);

        balancer.update(&other, Some(load(2)));
        match admit(balancer.as_ref(), &local, &client) {
            Admission::Redirect(list) => assert_eq!(list[0], other),
            Admission::Accept => panic!("expected redirect"),
        }
    }
}

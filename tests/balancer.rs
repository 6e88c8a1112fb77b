//! Connection balancing tests

use minigrid::balancer::{
    admit, Admission, ClientInfo, ConnectionCountOrder, LoadPublisher, NaturalLoadOrder,
    ServiceLoad, ServiceLoadBalancer, SimpleServiceLoadBalancer,
};
use minigrid::Member;
use rand::Rng;
use std::collections::HashSet;

fn load(connections: u32, active: u32) -> ServiceLoad {
    ServiceLoad {
        connection_count: connections,
        connection_limit: 100,
        worker_count: 10,
        worker_active_count: active,
        ..Default::default()
    }
}

#[test]
fn test_redirect_never_lands_on_heavier_member() {
    let balancer = SimpleServiceLoadBalancer::new(NaturalLoadOrder);
    let members: Vec<Member> = (1..=6).map(Member::new).collect();
    let client = ClientInfo::default();
    let mut rng = rand::thread_rng();

    for _ in 0..500 {
        for m in &members {
            balancer.update(m, Some(load(rng.gen_range(0..100), rng.gen_range(0..=10))));
        }
        for local in &members {
            let ours = balancer.load_of(local).unwrap();
            match admit(&balancer, local, &client) {
                Admission::Accept => {
                    let list = balancer.member_list(&client).unwrap();
                    let best = balancer.load_of(&list[0]).unwrap();
                    assert!(best >= ours, "accepted although a lighter member exists");
                }
                Admission::Redirect(list) => {
                    let target = balancer.load_of(&list[0]).unwrap();
                    assert!(target < ours);
                }
            }
        }
    }
}

#[test]
fn test_member_list_is_ordered_by_load() {
    let balancer = SimpleServiceLoadBalancer::new(NaturalLoadOrder);
    let members: Vec<Member> = (1..=5).map(Member::new).collect();
    for (i, m) in members.iter().enumerate() {
        balancer.update(m, Some(load(50 - i as u32 * 10, 0)));
    }

    let list = balancer.member_list(&ClientInfo::default()).unwrap();
    let loads: Vec<ServiceLoad> = list.iter().map(|m| balancer.load_of(m).unwrap()).collect();
    assert!(loads.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(list[0], members[4]);
}

#[test]
fn test_equal_loads_share_the_front() {
    let balancer = SimpleServiceLoadBalancer::new(NaturalLoadOrder);
    let tied: Vec<Member> = (1..=3).map(Member::new).collect();
    let heavy = Member::new(4);
    for m in &tied {
        balancer.update(m, Some(load(10, 1)));
    }
    balancer.update(&heavy, Some(load(90, 9)));

    let mut leaders = HashSet::new();
    for _ in 0..300 {
        let list = balancer.member_list(&ClientInfo::default()).unwrap();
        assert_eq!(list.len(), 4);
        assert_eq!(list[3], heavy);
        leaders.insert(list[0].id);
    }
    assert_eq!(leaders.len(), 3);
}

#[test]
fn test_forgetting_members_resets_preference() {
    let balancer = SimpleServiceLoadBalancer::new(NaturalLoadOrder);
    let a = Member::new(1);
    let b = Member::new(2);
    balancer.update(&a, Some(load(5, 0)));
    balancer.update(&b, Some(load(60, 0)));
    assert_eq!(balancer.member_count(), 2);

    balancer.update(&a, None);
    let list = balancer.member_list(&ClientInfo::default()).unwrap();
    assert_eq!(list, vec![b.clone()]);

    balancer.update(&b, None);
    assert_eq!(balancer.member_count(), 0);
    assert!(balancer.member_list(&ClientInfo::default()).is_none());
    assert_eq!(admit(&balancer, &a, &ClientInfo::default()), Admission::Accept);
}

#[test]
fn test_connection_count_order_ignores_workers() {
    let balancer = SimpleServiceLoadBalancer::new(ConnectionCountOrder);
    let local = Member::new(1);
    let other = Member::new(2);
    balancer.update(&local, Some(load(10, 0)));
    balancer.update(&other, Some(load(10, 10)));

    // Same connection count, so both sit in one bucket
    assert_eq!(admit(&balancer, &local, &ClientInfo::default()), Admission::Accept);

    balancer.update(&other, Some(load(3, 10)));
    assert!(matches!(
        admit(&balancer, &local, &ClientInfo::default()),
        Admission::Redirect(_)
    ));
}

#[test]
fn test_publisher_skips_equivalent_loads() {
    let publisher = LoadPublisher::new(NaturalLoadOrder);
    assert!(publisher.offer(load(10, 2)).is_some());
    assert!(publisher.offer(load(10, 2)).is_none());

    // 20 of 200 is the same factor as 10 of 100
    let scaled = ServiceLoad {
        connection_count: 20,
        connection_limit: 200,
        worker_count: 10,
        worker_active_count: 2,
        ..Default::default()
    };
    assert!(publisher.offer(scaled).is_none());
    assert!(publisher.offer(load(11, 2)).is_some());
}

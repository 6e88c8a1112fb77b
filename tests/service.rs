//! Running service tests: feeds, lifecycle and self-guarding

use minigrid::balancer::{Admission, ClientInfo, ServiceLoad, ServiceLoadBalancer};
use minigrid::common::config::{Config, FailurePolicyMode};
use minigrid::partition::{
    GuidResolver, OwnershipSnapshot, PartitionAssignmentStrategy, RecoveryPlan,
    SimpleAssignmentStrategy, TransitionPlan,
};
use minigrid::{GridService, LoadUpdate, Member, MembershipEvent, PartitionId, ServiceContext};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn config() -> Config {
    let mut config = Config::default();
    config.partition.partition_count = 31;
    config.partition.distribution_interval_ms = 20;
    config.guardian.scan_interval_ms = 10;
    config
}

fn load(connections: u32) -> ServiceLoad {
    ServiceLoad {
        connection_count: connections,
        ..Default::default()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_feeds_drive_distribution_and_balancing() {
    let local = Member::new(1);
    let service = GridService::builder(config(), local.clone()).build().unwrap();
    let (member_tx, member_rx) = mpsc::channel(16);
    let (load_tx, load_rx) = mpsc::channel(16);
    let handle = service.start(member_rx, load_rx).unwrap();
    assert!(service.is_running());
    assert!(service.start(mpsc::channel(1).1, mpsc::channel(1).1).is_err());

    let peers: Vec<Member> = (2..=3).map(Member::new).collect();
    for peer in &peers {
        member_tx
            .send(MembershipEvent::Joined(peer.clone()))
            .await
            .unwrap();
    }

    // Stand-in for the transfer layer: confirm handoffs as they appear
    let all: Vec<Member> = std::iter::once(local.clone()).chain(peers.iter().cloned()).collect();
    let balanced = eventually(|| {
        let _ = service.coordinator().confirm_all();
        let table = service.table();
        table.in_flight_count() == 0
            && table.orphaned_partitions().is_empty()
            && all.iter().all(|m| {
                let n = table.owned_partitions(m, false).len();
                (10..=11).contains(&n)
            })
    })
    .await;
    assert!(balanced, "distribution did not settle");
    service.table().check_invariants().unwrap();

    service.publish_load(load(40));
    load_tx
        .send(LoadUpdate {
            member: peers[0].clone(),
            load: Some(load(5)),
        })
        .await
        .unwrap();
    assert!(eventually(|| service.balancer().load_of(&peers[0]).is_some()).await);
    match service.admit_connection(&ClientInfo::default()).unwrap() {
        Admission::Redirect(list) => assert_eq!(list[0], peers[0]),
        Admission::Accept => panic!("expected a redirect to the lighter member"),
    }

    // Departure withdraws the member from balancing and recovers its partitions
    member_tx
        .send(MembershipEvent::Left(peers[0].clone()))
        .await
        .unwrap();
    assert!(eventually(|| service.balancer().load_of(&peers[0]).is_none()).await);
    assert!(
        eventually(|| {
            let _ = service.coordinator().confirm_all();
            service.table().orphaned_partitions().is_empty()
                && service.owned_partitions(&peers[0], true).is_empty()
        })
        .await
    );
    assert_eq!(
        service.admit_connection(&ClientInfo::default()).unwrap(),
        Admission::Accept
    );

    drop(member_tx);
    drop(load_tx);
    service.stop();
    assert!(!service.is_running());
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .unwrap();
}

/// Wraps the default strategy and blocks distribution planning on demand
#[derive(Default)]
struct Stalling {
    inner: SimpleAssignmentStrategy,
    stall: AtomicBool,
}

impl PartitionAssignmentStrategy for Stalling {
    fn name(&self) -> &str {
        "stalling"
    }

    fn plan_recovery(
        &self,
        snapshot: &OwnershipSnapshot,
        service: &ServiceContext,
        resolver: Option<&dyn GuidResolver>,
    ) -> RecoveryPlan {
        self.inner.plan_recovery(snapshot, service, resolver)
    }

    fn plan_distribution(
        &self,
        snapshot: &OwnershipSnapshot,
        service: &ServiceContext,
        budget: usize,
        exclude: &BTreeSet<PartitionId>,
    ) -> TransitionPlan {
        for _ in 0..500 {
            if !self.stall.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.inner
            .plan_distribution(snapshot, service, budget, exclude)
    }
}

fn stalling_service(mode: FailurePolicyMode) -> (Arc<GridService>, Arc<Stalling>) {
    let mut config = config();
    config.guardian.timeout_ms = 200;
    config.guardian.recover_fraction = 0.5;
    config.guardian.failure_policy = mode;
    let strategy = Arc::new(Stalling::default());
    let service = GridService::builder(config, Member::new(1))
        .strategy(strategy.clone())
        .build()
        .unwrap();
    (service, strategy)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hung_coordination_loop_stops_service() {
    let (service, strategy) = stalling_service(FailurePolicyMode::StopService);
    let (_member_tx, member_rx) = mpsc::channel(4);
    let (_load_tx, load_rx) = mpsc::channel(4);
    let handle = service.start(member_rx, load_rx).unwrap();
    assert_eq!(service.guardian().guarded_count(), 1);

    strategy.stall.store(true, Ordering::SeqCst);
    let stopped = eventually(|| !service.is_running()).await;
    strategy.stall.store(false, Ordering::SeqCst);
    assert!(stopped, "guardian did not stop the service");
    assert!(service.guardian().is_stopped());
    assert_eq!(service.guardian().guarded_count(), 0);

    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .unwrap();
    service.guardian().join_incidents();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_logging_policy_keeps_service_running() {
    let (service, strategy) = stalling_service(FailurePolicyMode::Logging);
    let (_member_tx, member_rx) = mpsc::channel(4);
    let (_load_tx, load_rx) = mpsc::channel(4);
    let handle = service.start(member_rx, load_rx).unwrap();

    strategy.stall.store(true, Ordering::SeqCst);
    let terminated = eventually(|| service.guardian().guarded_count() == 0).await;
    strategy.stall.store(false, Ordering::SeqCst);
    assert!(terminated, "hung loop was never terminated");
    service.guardian().join_incidents();
    assert!(service.is_running());

    service.stop();
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restarted_service_is_guarded_again() {
    let (service, strategy) = stalling_service(FailurePolicyMode::StopService);
    let handle = service
        .start(mpsc::channel(4).1, mpsc::channel(4).1)
        .unwrap();
    service.stop();
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .unwrap();
    assert!(service.guardian().is_stopped());

    let (_member_tx, member_rx) = mpsc::channel(4);
    let (_load_tx, load_rx) = mpsc::channel(4);
    let handle = service.start(member_rx, load_rx).unwrap();
    assert!(service.is_running());
    assert!(!service.guardian().is_stopped());
    assert_eq!(service.guardian().guarded_count(), 1);

    strategy.stall.store(true, Ordering::SeqCst);
    let stopped = eventually(|| !service.is_running()).await;
    strategy.stall.store(false, Ordering::SeqCst);
    assert!(stopped, "restarted loop ran unguarded");

    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .unwrap();
    service.guardian().join_incidents();
}

//! Stress test for distribution: membership churn with random handoff outcomes

use minigrid::common::config::PartitionConfig;
use minigrid::partition::{DistributionCoordinator, PartitionOwnershipTable, SimpleAssignmentStrategy};
use minigrid::policy::AllowAllPolicy;
use minigrid::{Member, MembershipEvent, PartitionId, ServiceContext};
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;

fn churn(partitions: u32, rounds: usize) {
    let config = PartitionConfig {
        partition_count: partitions,
        backup_count: 2,
        max_in_flight: 32,
        ..Default::default()
    };
    let coord = DistributionCoordinator::new(
        config,
        Arc::new(PartitionOwnershipTable::new(partitions, 2)),
        Arc::new(SimpleAssignmentStrategy::new()),
        Arc::new(AllowAllPolicy),
        ServiceContext::new("DistributedCache"),
    );
    let mut rng = rand::thread_rng();
    let mut live: Vec<Member> = Vec::new();
    let mut next_id = 1;

    let start = Instant::now();
    for _ in 0..rounds {
        if live.len() < 2 || (live.len() < 12 && rng.gen_bool(0.6)) {
            let member = Member::new(next_id).with_machine(format!("m{}", next_id % 5));
            next_id += 1;
            coord.on_membership_event(&MembershipEvent::Joined(member.clone()));
            live.push(member);
        } else {
            let member = live.swap_remove(rng.gen_range(0..live.len()));
            if rng.gen_bool(0.5) {
                coord.on_membership_event(&MembershipEvent::Leaving(member.clone()));
                coord.run_cycle().unwrap();
            }
            coord.on_membership_event(&MembershipEvent::Left(member));
        }

        for _ in 0..4 {
            coord.run_cycle().unwrap();
            let pending: Vec<PartitionId> =
                coord.table().in_flight_partitions().into_iter().collect();
            for p in pending {
                if rng.gen_bool(0.8) {
                    coord.confirm_handoff(p).unwrap();
                } else {
                    coord.abort_handoff(p).unwrap();
                }
            }
            coord.table().check_invariants().unwrap();
        }
    }

    // Settle and verify the final layout
    for _ in 0..1_000 {
        let report = coord.run_cycle().unwrap();
        coord.confirm_all().unwrap();
        if report.is_quiescent() {
            break;
        }
    }
    let elapsed = start.elapsed();

    let table = coord.table();
    assert!(table.orphaned_partitions().is_empty());
    let counts: Vec<usize> = live
        .iter()
        .map(|m| table.owned_partitions(m, false).len())
        .collect();
    let max = counts.iter().max().copied().unwrap_or(0);
    let min = counts.iter().min().copied().unwrap_or(0);
    assert!(max - min <= 1, "unbalanced after churn: {:?}", counts);
    table.check_invariants().unwrap();

    println!("{} rounds over {} partitions: {:?}", rounds, partitions, elapsed);
    assert!(elapsed.as_secs_f64() < 60.0, "Churn too slow");
}

#[test]
fn stress_membership_churn() {
    churn(127, 40);
}

#[test]
#[cfg_attr(not(feature = "heavy-tests"), ignore)]
fn stress_membership_churn_large() {
    churn(1021, 300);
}

//! Randomised election-safety checks.
//!
//! Drives clusters through seeded random interleavings of elections,
//! client requests and out-of-order deliveries, asserting after every step
//! that no term ever has two different leaders.

use distlab_core::ProtocolStateMachine;
use distlab_raft::{RaftCluster, RaftConfig};
use distlab_types::{ParticipantId, Term};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

fn check_leaders(cluster: &RaftCluster, seen: &mut BTreeMap<Term, ParticipantId>) {
    for (term, leader) in cluster.leaders() {
        let recorded = seen.entry(term).or_insert_with(|| leader.clone());
        assert_eq!(
            *recorded, leader,
            "two leaders in {term}: {recorded} and {leader}"
        );
    }
}

fn run(seed: u64, node_count: usize, steps: usize) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut cluster = RaftCluster::new(RaftConfig::new(node_count));
    let mut seen = BTreeMap::new();

    for step in 0..steps {
        match rng.gen_range(0..10) {
            0 | 1 => {
                let node = format!("node-{}", rng.gen_range(0..node_count));
                cluster.start_election(&node);
            }
            2 => {
                if let Some((_, leader)) = cluster.leaders().into_iter().next_back() {
                    cluster.add_client_request(leader.as_str(), format!("SET k={step}"));
                }
            }
            _ => {
                let in_flight = cluster.list_in_flight();
                if !in_flight.is_empty() {
                    let id = in_flight[rng.gen_range(0..in_flight.len())];
                    cluster.deliver(id);
                }
            }
        }
        check_leaders(&cluster, &mut seen);
    }

    cluster.deliver_all();
    check_leaders(&cluster, &mut seen);
}

#[test]
fn test_at_most_one_leader_per_term() {
    for seed in 0..50 {
        run(seed, 5, 300);
    }
}

#[test]
fn test_at_most_one_leader_per_term_even_cluster() {
    for seed in 100..130 {
        run(seed, 4, 300);
    }
}

#[test]
fn test_same_seed_same_run() {
    let build = |seed| {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut cluster = RaftCluster::new(RaftConfig::default());
        for _ in 0..200 {
            if rng.gen_bool(0.2) {
                cluster.start_election(&format!("node-{}", rng.gen_range(0..5)));
            } else if let Some(&id) = cluster.list_in_flight().first() {
                cluster.deliver(id);
            }
        }
        cluster
    };
    assert_eq!(build(7), build(7));
}

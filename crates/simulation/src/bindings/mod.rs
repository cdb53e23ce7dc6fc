//! Standard event handlers per protocol.
//!
//! Each `bind_*` function registers handlers on a timeline. Handler data is
//! decoded with [`TimelineEvent::args`]; malformed data is logged there and
//! the event does nothing.
//!
//! | event type       | data                                   | protocols              |
//! |------------------|----------------------------------------|------------------------|
//! | `tick`           | `{ "count"?: n }`                      | all                    |
//! | `deliver_all`    |                                        | all                    |
//! | `fail_node`      | `{ "node": id }`                       | all                    |
//! | `recover_node`   | `{ "node": id }`                       | all                    |
//! | `start_election` | `{ "node": id }`                       | raft                   |
//! | `client_request` | `{ "node": id, "command": s }`         | raft                   |
//! | `heartbeat`      | `{ "node": id }`                       | raft                   |
//! | `partition`      | `{ "groups": [[id, ..], ..] }`         | raft                   |
//! | `heal`           |                                        | raft                   |
//! | `propose`        | `{ "node": id, "value": s }`           | paxos                  |
//! | `client_request` | `{ "operation": s }`                   | pbft                   |
//! | `make_byzantine` | `{ "node": id }`                       | pbft                   |
//! | `write`          | `{ "node": id, "key": k, "value": v }` | quorum                 |
//! | `read`           | `{ "node": id, "key": k }`             | quorum                 |
//! | `set_lagging`    | `{ "node": id, "lagging"?: bool }`     | quorum                 |
//! | `produce`        | `{ "record": s }`                      | isr                    |
//! | `write`          | `{ "key": k, "value": v }`             | chain                  |
//! | `put`            | `{ "node": id, "key": k, "value": v }` | anti-entropy           |
//! | `sync`           | `{ "from": id, "to": id }`             | anti-entropy, crdt     |
//! | `begin`          | `{ "txn": s }`                         | 2PC, 3PC               |
//! | `set_vote`       | `{ "node": id, "yes": bool }`          | 2PC, 3PC               |
//! | `seed_rumor`     | `{ "node": id, "rumor": s }`           | gossip                 |
//! | `add_node`       | `{ "node": id }`                       | sharding               |
//! | `remove_node`    | `{ "node": id }`                       | sharding               |
//! | `apply`          | `{ "node": id, "op": op }`             | crdt                   |
//! | `broadcast`      | `{ "node": id }`                       | crdt                   |
//! | `local_event`    | `{ "node": id }`                       | lamport, vector        |
//! | `send`           | `{ "from": id, "to": id }`             | lamport, vector        |
//! | `broadcast`      | `{ "node": id, "body": s }`            | causal                 |
//! | `acquire`        | `{ "node": id }`                       | lock                   |
//! | `release`        | `{ "node": id }`                       | lock                   |
//! | `write`          | `{ "node": id, "value": v }`           | lock                   |
//! | `enqueue`        | `{ "payload": s }`                     | work queue             |
//!
//! The phi-accrual detector only reacts to the common events. A CRDT `op`
//! takes the form of the replica type's operation: a number for the
//! g-counter, `{ "increment": n }` for the pn-counter, a string for the
//! register, `{ "add": x }` for the or-set.

mod clocks;
mod commit;
mod consensus;
mod coordination;
mod crdt;
mod membership;
mod raft;
mod replication;

pub use clocks::{bind_causal_broadcast, bind_lamport, bind_vector_clocks};
pub use commit::{bind_three_phase_commit, bind_two_phase_commit};
pub use consensus::{bind_paxos, bind_pbft};
pub use coordination::{bind_lock_service, bind_work_queue};
pub use crdt::bind_crdt;
pub use membership::{bind_gossip, bind_phi_accrual, bind_sharding};
pub use raft::bind_raft;
pub use replication::{bind_anti_entropy, bind_chain, bind_isr, bind_quorum};

use distlab_core::ProtocolStateMachine;
use distlab_timeline::{TimelineController, TimelineEvent};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct NodeArgs {
    node: String,
}

#[derive(Debug, Deserialize)]
struct TickArgs {
    #[serde(default = "one")]
    count: u64,
}

fn one() -> u64 {
    1
}

/// Two endpoints, for syncs and sends.
#[derive(Debug, Deserialize)]
struct PairArgs {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    node: String,
    key: String,
    value: String,
}

/// Handlers every protocol understands.
pub fn bind_common<S: ProtocolStateMachine + 'static>(timeline: &mut TimelineController<S>) {
    timeline.on("tick", |state: &mut S, event: &TimelineEvent| {
        if let Some(args) = event.args::<TickArgs>() {
            for _ in 0..args.count {
                state.tick();
            }
        }
    });
    timeline.on("deliver_all", |state: &mut S, _: &TimelineEvent| {
        state.deliver_all();
    });
    timeline.on("fail_node", |state: &mut S, event: &TimelineEvent| {
        if let Some(args) = event.args::<NodeArgs>() {
            state.fail_node(&args.node);
        }
    });
    timeline.on("recover_node", |state: &mut S, event: &TimelineEvent| {
        if let Some(args) = event.args::<NodeArgs>() {
            state.recover_node(&args.node);
        }
    });
}

/// Bind `state`'s handlers and fire every event in order.
#[cfg(test)]
fn run_events<S: ProtocolStateMachine + 'static>(
    state: &mut S,
    bind: fn(&mut TimelineController<S>),
    events: Vec<TimelineEvent>,
) {
    use distlab_timeline::{Scenario, TimelineConfig};

    let scenario = Scenario::new("bindings", events).unwrap();
    let mut timeline = TimelineController::with_scenario(scenario, TimelineConfig::default());
    bind(&mut timeline);
    while timeline.step_forward(state) {}
    assert!(timeline.is_complete());
}

/// Events with ids and timestamps counting up from 1.
#[cfg(test)]
fn script(events: Vec<(&str, serde_json::Value)>) -> Vec<TimelineEvent> {
    events
        .into_iter()
        .zip(1u64..)
        .map(|((kind, data), i)| TimelineEvent::new(i, i, kind, data))
        .collect()
}

use super::bind_common;
use distlab_commit::{ThreePhaseCommit, TwoPhaseCommit};
use distlab_timeline::{TimelineController, TimelineEvent};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct BeginArgs {
    txn: String,
}

#[derive(Debug, Deserialize)]
struct VoteArgs {
    node: String,
    yes: bool,
}

pub fn bind_two_phase_commit(timeline: &mut TimelineController<TwoPhaseCommit>) {
    bind_common(timeline);
    timeline.on("begin", |commit: &mut TwoPhaseCommit, event: &TimelineEvent| {
        if let Some(args) = event.args::<BeginArgs>() {
            commit.begin(args.txn);
        }
    });
    timeline.on("set_vote", |commit: &mut TwoPhaseCommit, event: &TimelineEvent| {
        if let Some(args) = event.args::<VoteArgs>() {
            commit.set_vote(&args.node, args.yes);
        }
    });
}

pub fn bind_three_phase_commit(timeline: &mut TimelineController<ThreePhaseCommit>) {
    bind_common(timeline);
    timeline.on("begin", |commit: &mut ThreePhaseCommit, event: &TimelineEvent| {
        if let Some(args) = event.args::<BeginArgs>() {
            commit.begin(args.txn);
        }
    });
    timeline.on("set_vote", |commit: &mut ThreePhaseCommit, event: &TimelineEvent| {
        if let Some(args) = event.args::<VoteArgs>() {
            commit.set_vote(&args.node, args.yes);
        }
    });
}

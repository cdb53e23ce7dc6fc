use super::{bind_common, NodeArgs, PairArgs};
use distlab_clocks::{CausalBroadcast, LamportClocks, VectorClocks};
use distlab_timeline::{TimelineController, TimelineEvent};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct BroadcastArgs {
    node: String,
    body: String,
}

pub fn bind_lamport(timeline: &mut TimelineController<LamportClocks>) {
    bind_common(timeline);
    timeline.on("local_event", |clocks: &mut LamportClocks, event: &TimelineEvent| {
        if let Some(args) = event.args::<NodeArgs>() {
            clocks.local_event(&args.node);
        }
    });
    timeline.on("send", |clocks: &mut LamportClocks, event: &TimelineEvent| {
        if let Some(args) = event.args::<PairArgs>() {
            clocks.send(&args.from, &args.to);
        }
    });
}

pub fn bind_vector_clocks(timeline: &mut TimelineController<VectorClocks>) {
    bind_common(timeline);
    timeline.on("local_event", |clocks: &mut VectorClocks, event: &TimelineEvent| {
        if let Some(args) = event.args::<NodeArgs>() {
            clocks.local_event(&args.node);
        }
    });
    timeline.on("send", |clocks: &mut VectorClocks, event: &TimelineEvent| {
        if let Some(args) = event.args::<PairArgs>() {
            clocks.send(&args.from, &args.to);
        }
    });
}

pub fn bind_causal_broadcast(timeline: &mut TimelineController<CausalBroadcast>) {
    bind_common(timeline);
    timeline.on("broadcast", |causal: &mut CausalBroadcast, event: &TimelineEvent| {
        if let Some(args) = event.args::<BroadcastArgs>() {
            causal.broadcast(&args.node, args.body);
        }
    });
}

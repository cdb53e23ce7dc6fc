use super::{bind_common, NodeArgs};
use distlab_membership::{Gossip, PhiAccrual, Sharding};
use distlab_timeline::{TimelineController, TimelineEvent};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct RumorArgs {
    node: String,
    rumor: String,
}

pub fn bind_gossip(timeline: &mut TimelineController<Gossip>) {
    bind_common(timeline);
    timeline.on("seed_rumor", |gossip: &mut Gossip, event: &TimelineEvent| {
        if let Some(args) = event.args::<RumorArgs>() {
            gossip.seed_rumor(&args.node, args.rumor);
        }
    });
}

/// Heartbeats run off `tick`; there is nothing else to script.
pub fn bind_phi_accrual(timeline: &mut TimelineController<PhiAccrual>) {
    bind_common(timeline);
}

pub fn bind_sharding(timeline: &mut TimelineController<Sharding>) {
    bind_common(timeline);
    timeline.on("add_node", |ring: &mut Sharding, event: &TimelineEvent| {
        if let Some(args) = event.args::<NodeArgs>() {
            ring.add_node(&args.node);
        }
    });
    timeline.on("remove_node", |ring: &mut Sharding, event: &TimelineEvent| {
        if let Some(args) = event.args::<NodeArgs>() {
            ring.remove_node(&args.node);
        }
    });
}

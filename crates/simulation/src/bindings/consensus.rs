use super::{bind_common, NodeArgs};
use distlab_consensus::{PaxosCluster, PbftCluster};
use distlab_timeline::{TimelineController, TimelineEvent};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ProposeArgs {
    node: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct OperationArgs {
    operation: String,
}

pub fn bind_paxos(timeline: &mut TimelineController<PaxosCluster>) {
    bind_common(timeline);
    timeline.on("propose", |paxos: &mut PaxosCluster, event: &TimelineEvent| {
        if let Some(args) = event.args::<ProposeArgs>() {
            paxos.propose(&args.node, args.value);
        }
    });
}

pub fn bind_pbft(timeline: &mut TimelineController<PbftCluster>) {
    bind_common(timeline);
    timeline.on("client_request", |pbft: &mut PbftCluster, event: &TimelineEvent| {
        if let Some(args) = event.args::<OperationArgs>() {
            pbft.client_request(args.operation);
        }
    });
    timeline.on("make_byzantine", |pbft: &mut PbftCluster, event: &TimelineEvent| {
        if let Some(args) = event.args::<NodeArgs>() {
            pbft.make_byzantine(&args.node);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::{run_events, script};
    use distlab_consensus::{PaxosConfig, PbftConfig};
    use distlab_core::ProtocolStateMachine;
    use serde_json::json;

    #[test]
    fn test_paxos_handlers() {
        let mut paxos = PaxosCluster::new(PaxosConfig::default());
        run_events(
            &mut paxos,
            bind_paxos,
            script(vec![
                ("propose", json!({ "node": "node-0", "value": "blue" })),
                ("deliver_all", json!(null)),
                ("propose", json!({ "node": "node-4", "value": "red" })),
                ("deliver_all", json!(null)),
            ]),
        );

        assert_eq!(paxos.chosen_values(), vec!["blue".to_string()]);
        assert_eq!(paxos.stats().learned, 5);
    }

    #[test]
    fn test_pbft_handlers() {
        let mut pbft = PbftCluster::new(PbftConfig::default());
        run_events(
            &mut pbft,
            bind_pbft,
            script(vec![
                ("make_byzantine", json!({ "node": "replica-3" })),
                ("client_request", json!({ "operation": "SET x=1" })),
                ("deliver_all", json!(null)),
            ]),
        );

        let stats = pbft.stats();
        assert_eq!(stats.byzantine, 1);
        assert_eq!(stats.honest_committed, 3);
    }
}

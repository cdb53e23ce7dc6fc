use super::{bind_common, NodeArgs};
use distlab_core::ParticipantId;
use distlab_raft::RaftCluster;
use distlab_timeline::{TimelineController, TimelineEvent};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ClientRequestArgs {
    node: String,
    command: String,
}

#[derive(Debug, Deserialize)]
struct PartitionArgs {
    groups: Vec<Vec<String>>,
}

pub fn bind_raft(timeline: &mut TimelineController<RaftCluster>) {
    bind_common(timeline);
    timeline.on("start_election", |raft: &mut RaftCluster, event: &TimelineEvent| {
        if let Some(args) = event.args::<NodeArgs>() {
            raft.start_election(&args.node);
        }
    });
    timeline.on("client_request", |raft: &mut RaftCluster, event: &TimelineEvent| {
        if let Some(args) = event.args::<ClientRequestArgs>() {
            raft.add_client_request(&args.node, args.command);
        }
    });
    timeline.on("heartbeat", |raft: &mut RaftCluster, event: &TimelineEvent| {
        if let Some(args) = event.args::<NodeArgs>() {
            raft.heartbeat(&args.node);
        }
    });
    timeline.on("partition", |raft: &mut RaftCluster, event: &TimelineEvent| {
        if let Some(args) = event.args::<PartitionArgs>() {
            let groups = args
                .groups
                .into_iter()
                .map(|group| group.into_iter().map(ParticipantId::from).collect())
                .collect();
            raft.partition(groups);
        }
    });
    timeline.on("heal", |raft: &mut RaftCluster, _: &TimelineEvent| raft.heal());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::{run_events, script};
    use distlab_core::ProtocolStateMachine;
    use distlab_raft::{RaftConfig, Role};
    use serde_json::json;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[test]
    fn test_raft_handlers_drive_an_election() {
        let mut raft = RaftCluster::new(RaftConfig::new(5));
        run_events(
            &mut raft,
            bind_raft,
            script(vec![
                ("start_election", json!({ "node": "node-0" })),
                ("deliver_all", json!(null)),
                ("client_request", json!({ "node": "node-0", "command": "SET x=1" })),
            ]),
        );

        let leader = raft.node("node-0").unwrap();
        assert_eq!(leader.role, Role::Leader);
        assert_eq!(leader.log.len(), 1);
        assert_eq!(raft.in_flight_of_type("AppendEntries").len(), 4);
    }

    #[test]
    fn test_partition_groups_are_parsed() {
        let mut raft = RaftCluster::new(RaftConfig::new(5));
        run_events(
            &mut raft,
            bind_raft,
            script(vec![(
                "partition",
                json!({ "groups": [["node-0", "node-1"], ["node-2", "node-3", "node-4"]] }),
            )]),
        );

        assert!(raft.partitions().is_partitioned());
        assert!(!raft.partitions().can_communicate("node-0", "node-2"));
    }

    #[test]
    fn test_heal_and_heartbeat() {
        let mut raft = RaftCluster::new(RaftConfig::new(3));
        run_events(
            &mut raft,
            bind_raft,
            script(vec![
                ("start_election", json!({ "node": "node-0" })),
                ("deliver_all", json!(null)),
                ("partition", json!({ "groups": [["node-0"], ["node-1", "node-2"]] })),
                ("heal", json!(null)),
                ("heartbeat", json!({ "node": "node-0" })),
            ]),
        );

        assert!(!raft.partitions().is_partitioned());
        assert_eq!(raft.in_flight_of_type("AppendEntries").len(), 2);
    }

    #[traced_test]
    #[test]
    fn test_malformed_data_is_ignored() {
        let mut raft = RaftCluster::new(RaftConfig::new(3));
        run_events(
            &mut raft,
            bind_raft,
            script(vec![
                ("start_election", json!({ "nod": "node-0" })),
                ("tick", json!({ "count": 3 })),
            ]),
        );

        assert!(logs_contain("Malformed event data"));
        assert_eq!(raft.node("node-0").unwrap().role, Role::Follower);
        assert_eq!(raft.now(), Duration::from_millis(300));
    }
}

use super::{bind_common, PairArgs, WriteArgs};
use distlab_replication::{AntiEntropy, ChainReplication, IsrLog, QuorumReplication};
use distlab_timeline::{TimelineController, TimelineEvent};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ReadArgs {
    node: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct LaggingArgs {
    node: String,
    #[serde(default = "yes")]
    lagging: bool,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RecordArgs {
    record: String,
}

/// A write with no target node; the chain always takes writes at its head.
#[derive(Debug, Deserialize)]
struct KeyValueArgs {
    key: String,
    value: String,
}

pub fn bind_quorum(timeline: &mut TimelineController<QuorumReplication>) {
    bind_common(timeline);
    timeline.on("write", |quorum: &mut QuorumReplication, event: &TimelineEvent| {
        if let Some(args) = event.args::<WriteArgs>() {
            quorum.write(&args.node, args.key, args.value);
        }
    });
    timeline.on("read", |quorum: &mut QuorumReplication, event: &TimelineEvent| {
        if let Some(args) = event.args::<ReadArgs>() {
            quorum.read(&args.node, args.key);
        }
    });
    timeline.on("set_lagging", |quorum: &mut QuorumReplication, event: &TimelineEvent| {
        if let Some(args) = event.args::<LaggingArgs>() {
            quorum.set_lagging(&args.node, args.lagging);
        }
    });
}

pub fn bind_isr(timeline: &mut TimelineController<IsrLog>) {
    bind_common(timeline);
    timeline.on("produce", |isr: &mut IsrLog, event: &TimelineEvent| {
        if let Some(args) = event.args::<RecordArgs>() {
            isr.produce(args.record);
        }
    });
}

pub fn bind_chain(timeline: &mut TimelineController<ChainReplication>) {
    bind_common(timeline);
    timeline.on("write", |chain: &mut ChainReplication, event: &TimelineEvent| {
        if let Some(args) = event.args::<KeyValueArgs>() {
            chain.write(args.key, args.value);
        }
    });
}

pub fn bind_anti_entropy(timeline: &mut TimelineController<AntiEntropy>) {
    bind_common(timeline);
    timeline.on("put", |replicas: &mut AntiEntropy, event: &TimelineEvent| {
        if let Some(args) = event.args::<WriteArgs>() {
            replicas.put(&args.node, args.key, args.value);
        }
    });
    timeline.on("sync", |replicas: &mut AntiEntropy, event: &TimelineEvent| {
        if let Some(args) = event.args::<PairArgs>() {
            replicas.sync(&args.from, &args.to);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::{run_events, script};
    use distlab_core::ProtocolStateMachine;
    use distlab_replication::{AntiEntropyConfig, ChainConfig, IsrConfig};
    use serde_json::json;

    #[test]
    fn test_quorum_handlers() {
        let mut quorum = QuorumReplication::new(Default::default());
        run_events(
            &mut quorum,
            bind_quorum,
            script(vec![
                ("write", json!({ "node": "node-0", "key": "x", "value": "1" })),
                ("deliver_all", json!(null)),
                ("read", json!({ "node": "node-1", "key": "x" })),
                ("deliver_all", json!(null)),
            ]),
        );

        let stats = quorum.stats();
        assert_eq!(stats.durable_writes, 1);
        assert_eq!(stats.completed_reads, 1);
    }

    #[test]
    fn test_isr_handlers() {
        let mut isr = IsrLog::new(IsrConfig::default());
        run_events(
            &mut isr,
            bind_isr,
            script(vec![
                ("produce", json!({ "record": "a" })),
                ("produce", json!({ "record": "b" })),
                ("tick", json!(null)),
                ("deliver_all", json!(null)),
                ("tick", json!(null)),
                ("deliver_all", json!(null)),
            ]),
        );

        assert_eq!(isr.high_watermark(), 2);
        assert_eq!(isr.committed(), vec!["a", "b"]);
    }

    #[test]
    fn test_chain_handlers() {
        let mut chain = ChainReplication::new(ChainConfig::default());
        run_events(
            &mut chain,
            bind_chain,
            script(vec![
                ("write", json!({ "key": "x", "value": "1" })),
                ("deliver_all", json!(null)),
            ]),
        );

        assert_eq!(chain.read("x"), Some("1"));
        assert_eq!(chain.stats().acknowledged, 1);
    }

    #[test]
    fn test_anti_entropy_handlers() {
        let mut replicas = AntiEntropy::new(AntiEntropyConfig::default());
        run_events(
            &mut replicas,
            bind_anti_entropy,
            script(vec![
                ("put", json!({ "node": "replica-0", "key": "a", "value": "v" })),
                ("sync", json!({ "from": "replica-0", "to": "replica-1" })),
                ("deliver_all", json!(null)),
            ]),
        );

        assert!(replicas.in_sync("replica-0", "replica-1"));
        assert_eq!(replicas.stats().syncs, 1);
    }
}

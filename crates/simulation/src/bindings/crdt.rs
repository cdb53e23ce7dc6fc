use super::{bind_common, NodeArgs, PairArgs};
use distlab_crdt::{Crdt, CrdtCluster};
use distlab_timeline::{TimelineController, TimelineEvent};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ApplyArgs<Op> {
    node: String,
    op: Op,
}

/// Handlers for a cluster of any replica type; `op` decodes as `C::Op`.
pub fn bind_crdt<C: Crdt + 'static>(timeline: &mut TimelineController<CrdtCluster<C>>) {
    bind_common(timeline);
    timeline.on("apply", |cluster: &mut CrdtCluster<C>, event: &TimelineEvent| {
        if let Some(args) = event.args::<ApplyArgs<C::Op>>() {
            cluster.apply(&args.node, args.op);
        }
    });
    timeline.on("sync", |cluster: &mut CrdtCluster<C>, event: &TimelineEvent| {
        if let Some(args) = event.args::<PairArgs>() {
            cluster.sync(&args.from, &args.to);
        }
    });
    timeline.on("broadcast", |cluster: &mut CrdtCluster<C>, event: &TimelineEvent| {
        if let Some(args) = event.args::<NodeArgs>() {
            cluster.broadcast(&args.node);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::{run_events, script};
    use distlab_crdt::{CrdtConfig, GCounter, OrSet, PnCounter};
    use serde_json::json;
    use std::collections::BTreeSet;
    use tracing_test::traced_test;

    #[test]
    fn test_pn_counter_handlers() {
        let mut cluster = CrdtCluster::<PnCounter>::new(CrdtConfig::default());
        run_events(
            &mut cluster,
            bind_crdt::<PnCounter>,
            script(vec![
                ("apply", json!({ "node": "replica-0", "op": { "increment": 4 } })),
                ("apply", json!({ "node": "replica-1", "op": { "decrement": 1 } })),
                ("broadcast", json!({ "node": "replica-0" })),
                ("broadcast", json!({ "node": "replica-1" })),
                ("deliver_all", json!(null)),
            ]),
        );

        assert!(cluster.converged());
        assert_eq!(cluster.value("replica-2"), Some(3));
    }

    #[test]
    fn test_or_set_sync_is_one_way() {
        let mut cluster = CrdtCluster::<OrSet>::new(CrdtConfig::default());
        run_events(
            &mut cluster,
            bind_crdt::<OrSet>,
            script(vec![
                ("apply", json!({ "node": "replica-0", "op": { "add": "x" } })),
                ("sync", json!({ "from": "replica-0", "to": "replica-1" })),
                ("deliver_all", json!(null)),
            ]),
        );

        let expected = BTreeSet::from(["x".to_string()]);
        assert_eq!(cluster.value("replica-1"), Some(expected));
        assert!(!cluster.converged());
    }

    #[traced_test]
    #[test]
    fn test_op_of_the_wrong_shape_is_ignored() {
        let mut cluster = CrdtCluster::<GCounter>::new(CrdtConfig::default());
        run_events(
            &mut cluster,
            bind_crdt::<GCounter>,
            script(vec![("apply", json!({ "node": "replica-0", "op": { "add": "x" } }))]),
        );

        assert!(logs_contain("Malformed event data"));
        assert_eq!(cluster.value("replica-0"), Some(0));
    }
}

use super::{bind_common, NodeArgs};
use distlab_coordination::{LockService, WorkQueue};
use distlab_timeline::{TimelineController, TimelineEvent};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ValueArgs {
    node: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct JobArgs {
    payload: String,
}

pub fn bind_lock_service(timeline: &mut TimelineController<LockService>) {
    bind_common(timeline);
    timeline.on("acquire", |service: &mut LockService, event: &TimelineEvent| {
        if let Some(args) = event.args::<NodeArgs>() {
            service.acquire(&args.node);
        }
    });
    timeline.on("release", |service: &mut LockService, event: &TimelineEvent| {
        if let Some(args) = event.args::<NodeArgs>() {
            service.release(&args.node);
        }
    });
    timeline.on("write", |service: &mut LockService, event: &TimelineEvent| {
        if let Some(args) = event.args::<ValueArgs>() {
            service.write(&args.node, args.value);
        }
    });
}

pub fn bind_work_queue(timeline: &mut TimelineController<WorkQueue>) {
    bind_common(timeline);
    timeline.on("enqueue", |queue: &mut WorkQueue, event: &TimelineEvent| {
        if let Some(args) = event.args::<JobArgs>() {
            queue.enqueue(args.payload);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::{run_events, script};
    use distlab_coordination::{LockConfig, WorkQueueConfig};
    use distlab_core::ProtocolStateMachine;
    use serde_json::json;

    #[test]
    fn test_lock_service_handlers() {
        let mut service = LockService::new(LockConfig::default());
        run_events(
            &mut service,
            bind_lock_service,
            script(vec![
                ("acquire", json!({ "node": "client-0" })),
                ("deliver_all", json!(null)),
                ("write", json!({ "node": "client-0", "value": "v1" })),
                ("deliver_all", json!(null)),
                ("release", json!({ "node": "client-0" })),
                ("deliver_all", json!(null)),
            ]),
        );

        assert_eq!(service.value(), Some("v1"));
        assert_eq!(service.stats().accepted_writes, 1);
        assert!(service.lease().is_none());
    }

    #[test]
    fn test_work_queue_handlers() {
        let mut queue = WorkQueue::new(WorkQueueConfig::default());
        run_events(
            &mut queue,
            bind_work_queue,
            script(vec![
                ("enqueue", json!({ "payload": "resize image" })),
                ("enqueue", json!({ "payload": "send email" })),
                ("tick", json!(null)),
                ("deliver_all", json!(null)),
            ]),
        );

        let stats = queue.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.depth, 0);
    }
}

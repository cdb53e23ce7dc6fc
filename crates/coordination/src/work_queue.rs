//! At-least-once work queue with a visibility timeout.

use distlab_core::{
    impl_participant, Health, HealthStats, Message, MessageId, MessagePool, MessageStats,
    ParticipantId, ParticipantRegistry, Payload, Position, ProtocolStateMachine,
};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Id of the broker participant.
pub const BROKER: &str = "broker";

/// Configuration for [`WorkQueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkQueueConfig {
    /// Number of workers, named `worker-0` onwards.
    pub workers: usize,

    /// Ticks a dispatched job may stay un-acked before it is queued again.
    pub visibility_ticks: u64,

    /// Logical time added by each `tick()`.
    pub tick_interval: Duration,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            visibility_ticks: 3,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl WorkQueueConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    pub fn with_visibility_ticks(mut self, ticks: u64) -> Self {
        self.visibility_ticks = ticks;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkQueueMessage {
    Dispatch { job: Job },
    Ack { job: JobId },
}

impl Payload for WorkQueueMessage {
    fn type_name(&self) -> &'static str {
        match self {
            WorkQueueMessage::Dispatch { .. } => "Dispatch",
            WorkQueueMessage::Ack { .. } => "Ack",
        }
    }
}

/// Broker or worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkQueueNode {
    pub id: ParticipantId,
    pub health: Health,
    pub position: Position,
    /// Worker: jobs run, in order, including repeats.
    pub processed: Vec<JobId>,
}

impl_participant!(WorkQueueNode);

#[derive(Debug, Clone, PartialEq)]
struct Assignment {
    job: Job,
    worker: ParticipantId,
    dispatched_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkQueueStats {
    pub health: HealthStats,
    pub messages: MessageStats,
    /// Jobs waiting for a worker.
    pub depth: usize,
    /// Jobs dispatched and not yet acked.
    pub in_flight: usize,
    pub completed: usize,
    pub redeliveries: usize,
    /// Extra runs of jobs that had already been run once.
    pub duplicates: usize,
}

/// A broker handing jobs to a pool of workers.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkQueue {
    config: WorkQueueConfig,
    nodes: ParticipantRegistry<WorkQueueNode>,
    pool: MessagePool<WorkQueueMessage>,
    queue: VecDeque<Job>,
    assignments: BTreeMap<JobId, Assignment>,
    completed: Vec<JobId>,
    next_job: u64,
    redeliveries: usize,
    ticks: u64,
    now: Duration,
}

impl WorkQueue {
    pub fn new(config: WorkQueueConfig) -> Self {
        let count = config.workers;
        let node = |id: ParticipantId, position| WorkQueueNode {
            id,
            health: Health::Healthy,
            position,
            processed: Vec::new(),
        };
        let broker = node(ParticipantId::from(BROKER), Position::default());
        let workers = (0..count)
            .map(|i| node(ParticipantId::indexed("worker", i), Position::on_ring(i, count, 200.0)));

        Self {
            nodes: ParticipantRegistry::from_participants(std::iter::once(broker).chain(workers)),
            config,
            pool: MessagePool::new(),
            queue: VecDeque::new(),
            assignments: BTreeMap::new(),
            completed: Vec::new(),
            next_job: 0,
            redeliveries: 0,
            ticks: 0,
            now: Duration::ZERO,
        }
    }

    pub fn node(&self, id: &str) -> Option<&WorkQueueNode> {
        self.nodes.get(id)
    }

    /// Jobs acked, in ack order.
    pub fn completed(&self) -> &[JobId] {
        &self.completed
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    /// Add a job at the broker. `None` if the broker is unavailable.
    pub fn enqueue(&mut self, payload: impl Into<String>) -> Option<JobId> {
        if !self.nodes.is_available(BROKER) {
            debug!("Broker unavailable, job rejected");
            return None;
        }
        let id = JobId(self.next_job);
        self.next_job += 1;
        let payload = payload.into();
        debug!(job = %id, payload = %payload, "Job enqueued");
        self.queue.push_back(Job { id, payload });
        Some(id)
    }

    fn is_idle(&self, worker: &ParticipantId) -> bool {
        !self.assignments.values().any(|a| &a.worker == worker)
    }

    fn redeliver_expired(&mut self) {
        let deadline = self.config.visibility_ticks;
        let expired: Vec<JobId> = self
            .assignments
            .iter()
            .filter(|(_, a)| a.dispatched_at + deadline <= self.ticks)
            .map(|(id, _)| *id)
            .collect();

        // Expired jobs go back to the front, lowest id first.
        for id in expired.into_iter().rev() {
            if let Some(assignment) = self.assignments.remove(&id) {
                info!(job = %id, worker = %assignment.worker, "Job redelivered");
                self.redeliveries += 1;
                self.queue.push_front(assignment.job);
            }
        }
    }

    fn dispatch(&mut self) {
        let broker = ParticipantId::from(BROKER);
        let idle: Vec<ParticipantId> = self
            .nodes
            .iter()
            .filter(|n| n.id != BROKER && n.health.is_healthy())
            .map(|n| n.id.clone())
            .filter(|id| self.is_idle(id))
            .collect();

        for worker in idle {
            let Some(job) = self.queue.pop_front() else {
                break;
            };
            trace!(job = %job.id, worker = %worker, "Job dispatched");
            self.pool.send(
                &broker,
                &worker,
                WorkQueueMessage::Dispatch { job: job.clone() },
                self.now,
            );
            self.assignments.insert(
                job.id,
                Assignment {
                    job,
                    worker,
                    dispatched_at: self.ticks,
                },
            );
        }
    }

    fn duplicates(&self) -> usize {
        let mut runs: BTreeMap<JobId, usize> = BTreeMap::new();
        for node in self.nodes.iter() {
            for job in &node.processed {
                *runs.entry(*job).or_default() += 1;
            }
        }
        runs.values().map(|n| n.saturating_sub(1)).sum()
    }
}

impl ProtocolStateMachine for WorkQueue {
    type Participant = WorkQueueNode;
    type Payload = WorkQueueMessage;
    type Stats = WorkQueueStats;

    fn name(&self) -> &'static str {
        "work-queue"
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn participants(&self) -> Vec<WorkQueueNode> {
        self.nodes.list()
    }

    fn messages(&self) -> Vec<Message<WorkQueueMessage>> {
        self.pool.messages()
    }

    fn list_in_flight(&self) -> Vec<MessageId> {
        self.pool.list_in_flight()
    }

    fn deliver(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let Some(message) = self
            .pool
            .deliver_if(id, |m| nodes.is_available(&m.from) && nodes.is_available(&m.to))
        else {
            return;
        };

        let Message { from, to, payload, .. } = message;
        match payload {
            WorkQueueMessage::Dispatch { job } => {
                if let Some(worker) = self.nodes.get_mut(&to) {
                    worker.processed.push(job.id);
                }
                self.pool
                    .send(&to, &from, WorkQueueMessage::Ack { job: job.id }, self.now);
            }
            WorkQueueMessage::Ack { job } => {
                let current = self.assignments.get(&job).is_some_and(|a| a.worker == from);
                if current {
                    self.assignments.remove(&job);
                    self.completed.push(job);
                    debug!(job = %job, worker = %from, "Job acked");
                } else {
                    debug!(job = %job, worker = %from, "Late ack ignored");
                }
            }
        }
    }

    /// Requeue jobs whose visibility timeout has passed, then hand queued
    /// jobs to idle healthy workers in registry order.
    fn tick(&mut self) {
        self.now += self.config.tick_interval;
        self.ticks += 1;

        if !self.nodes.is_available(BROKER) {
            return;
        }
        self.redeliver_expired();
        self.dispatch();
    }

    fn fail_node(&mut self, id: &str) {
        if self.nodes.set_health(id, Health::Failed) {
            info!(node = id, "Node failed");
        }
    }

    fn recover_node(&mut self, id: &str) {
        if self.nodes.set_health(id, Health::Healthy) {
            info!(node = id, "Node recovered");
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    fn stats(&self) -> WorkQueueStats {
        WorkQueueStats {
            health: HealthStats::from_registry(&self.nodes),
            messages: self.pool.stats(),
            depth: self.queue.len(),
            in_flight: self.assignments.len(),
            completed: self.completed.len(),
            redeliveries: self.redeliveries,
            duplicates: self.duplicates(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn queue() -> WorkQueue {
        WorkQueue::new(WorkQueueConfig::default())
    }

    #[test]
    fn test_tick_dispatches_one_job_per_idle_worker() {
        let mut q = queue();
        for i in 0..5 {
            q.enqueue(format!("job {i}"));
        }
        q.tick();
        let stats = q.stats();
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.in_flight, 3);

        q.deliver_all();
        assert_eq!(q.completed(), [JobId(0), JobId(1), JobId(2)]);

        q.tick();
        q.deliver_all();
        assert_eq!(q.stats().completed, 5);
        assert_eq!(q.depth(), 0);
    }

    #[traced_test]
    #[test]
    fn test_job_on_failed_worker_is_redelivered() {
        let mut q = queue();
        q.enqueue("resize image");
        q.tick();
        q.fail_node("worker-0");
        q.deliver_all();
        assert_eq!(q.stats().in_flight, 1);

        for _ in 0..3 {
            q.tick();
        }
        assert!(logs_contain("Job redelivered"));
        q.deliver_all();

        assert_eq!(q.completed(), [JobId(0)]);
        assert_eq!(q.node("worker-1").unwrap().processed, vec![JobId(0)]);
        assert_eq!(q.stats().redeliveries, 1);
        assert_eq!(q.stats().duplicates, 0);
    }

    #[test]
    fn test_short_visibility_redelivers_sooner() {
        let mut q = WorkQueue::new(WorkQueueConfig::default().with_visibility_ticks(1));
        q.enqueue("resize image");
        q.tick();
        q.fail_node("worker-0");
        q.deliver_all();

        q.tick();
        assert_eq!(q.stats().redeliveries, 1);
        assert_eq!(q.stats().in_flight, 1);
    }

    #[test]
    fn test_lost_ack_runs_job_twice() {
        let mut q = queue();
        q.enqueue("send email");
        q.tick();
        let dispatch = q.list_in_flight()[0];
        q.deliver(dispatch);

        // The ack is lost while the broker is down.
        q.fail_node(BROKER);
        q.deliver_all();
        q.recover_node(BROKER);

        for _ in 0..3 {
            q.tick();
        }
        q.deliver_all();

        let stats = q.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(q.node("worker-0").unwrap().processed, vec![JobId(0), JobId(0)]);
    }

    #[test]
    fn test_failed_broker_rejects_and_stops_dispatch() {
        let mut q = queue();
        q.enqueue("a");
        q.fail_node(BROKER);
        assert_eq!(q.enqueue("b"), None);
        q.tick();
        assert!(q.list_in_flight().is_empty());
        assert_eq!(q.depth(), 1);
    }

    #[test]
    fn test_reset_matches_fresh_instance() {
        let mut q = queue();
        q.enqueue("a");
        q.tick();
        q.reset();
        assert_eq!(q, queue());
    }

    #[test]
    fn test_delivery_is_idempotent() {
        let mut q = queue();
        q.enqueue("resize image");
        q.tick();
        let id = q.list_in_flight()[0];

        q.deliver(id);
        let after_first = q.clone();
        q.deliver(id);
        assert_eq!(q, after_first);
    }
}

//! Delivery scheduling for in-flight messages.

use crate::ConfigError;
use distlab_core::{MessageId, ProtocolStateMachine};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::trace;

/// Configuration for a [`DeliveryScheduler`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    /// Transit delay applied to every message.
    pub delay: Duration,

    /// Extra delay drawn uniformly from `[0, delay * jitter_fraction)`.
    /// Zero disables jitter and never touches the RNG.
    pub jitter_fraction: f64,

    /// Seed for jitter draws.
    pub seed: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            jitter_fraction: 0.0,
            seed: 42,
        }
    }
}

impl DeliveryConfig {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(ConfigError::InvalidJitter(self.jitter_fraction));
        }
        Ok(())
    }
}

/// Queue ordering: due time, then scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeliveryKey {
    pub due: Duration,
    pub sequence: u64,
}

/// Schedules `deliver` calls for messages a state machine has put in flight.
///
/// The scheduler never reads message contents: it polls
/// [`ProtocolStateMachine::list_in_flight`] and queues each id it has not
/// seen before.
#[derive(Debug, Clone)]
pub struct DeliveryScheduler {
    config: DeliveryConfig,
    queue: BTreeMap<DeliveryKey, MessageId>,
    /// Every id ever queued since the last clear.
    seen: BTreeSet<MessageId>,
    sequence: u64,
    rng: ChaCha8Rng,
}

impl DeliveryScheduler {
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            queue: BTreeMap::new(),
            seen: BTreeSet::new(),
            sequence: 0,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    fn transit_delay(&mut self) -> Duration {
        if self.config.jitter_fraction <= 0.0 {
            return self.config.delay;
        }
        let jitter: f64 = self.rng.gen_range(0.0..self.config.jitter_fraction);
        self.config.delay + self.config.delay.mul_f64(jitter)
    }

    /// Queue every in-flight message of `state` not queued before.
    ///
    /// Returns the number of newly scheduled messages.
    pub fn schedule_new<S: ProtocolStateMachine>(&mut self, state: &S, now: Duration) -> usize {
        let mut scheduled = 0;
        for id in state.list_in_flight() {
            if !self.seen.insert(id) {
                continue;
            }
            self.sequence += 1;
            let due = now + self.transit_delay();
            trace!(message = %id, due_ms = due.as_millis() as u64, "Delivery scheduled");
            self.queue.insert(
                DeliveryKey {
                    due,
                    sequence: self.sequence,
                },
                id,
            );
            scheduled += 1;
        }
        scheduled
    }

    /// Due time of the earliest queued delivery.
    pub fn next_due(&self) -> Option<Duration> {
        self.queue.first_key_value().map(|(key, _)| key.due)
    }

    /// Pop the earliest delivery due at or before `now`.
    pub fn pop_due(&mut self, now: Duration) -> Option<(DeliveryKey, MessageId)> {
        match self.queue.first_key_value() {
            Some((key, _)) if key.due <= now => self.queue.pop_first(),
            _ => None,
        }
    }

    /// Number of queued deliveries.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Forget every queued and seen id.
    ///
    /// Used when host state is replaced (step backward, jump, reset), where
    /// message ids may be reissued for different messages. The RNG keeps its
    /// position.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.seen.clear();
    }

    /// Clear and reseed.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distlab_raft::{RaftCluster, RaftConfig};

    fn cluster_with_votes() -> RaftCluster {
        let mut cluster = RaftCluster::new(RaftConfig::new(5));
        cluster.start_election("node-0");
        cluster
    }

    #[test]
    fn test_messages_are_scheduled_once() {
        let cluster = cluster_with_votes();
        let mut scheduler = DeliveryScheduler::new(DeliveryConfig::default());

        assert_eq!(scheduler.schedule_new(&cluster, Duration::ZERO), 4);
        assert_eq!(scheduler.schedule_new(&cluster, Duration::from_millis(10)), 0);
        assert_eq!(scheduler.pending(), 4);
        assert_eq!(scheduler.next_due(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_nothing_pops_before_due() {
        let cluster = cluster_with_votes();
        let mut scheduler = DeliveryScheduler::new(DeliveryConfig::default());
        scheduler.schedule_new(&cluster, Duration::ZERO);

        assert!(scheduler.pop_due(Duration::from_millis(499)).is_none());
        let popped: Vec<MessageId> = std::iter::from_fn(|| {
            scheduler
                .pop_due(Duration::from_millis(500))
                .map(|(_, id)| id)
        })
        .collect();
        assert_eq!(popped, cluster.list_in_flight());
    }

    #[test]
    fn test_same_seed_same_order() {
        let cluster = cluster_with_votes();
        let config = DeliveryConfig::default().with_jitter(0.5).with_seed(7);
        let order = |config: &DeliveryConfig| {
            let mut scheduler = DeliveryScheduler::new(config.clone());
            scheduler.schedule_new(&cluster, Duration::ZERO);
            std::iter::from_fn(|| scheduler.pop_due(Duration::from_secs(1)))
                .collect::<Vec<_>>()
        };

        let first = order(&config);
        assert_eq!(first, order(&config));
        for (key, _) in &first {
            assert!(key.due >= Duration::from_millis(500));
            assert!(key.due < Duration::from_millis(750));
        }
        assert_ne!(first, order(&config.clone().with_seed(8)));
    }

    #[test]
    fn test_jitter_outside_unit_range_is_rejected() {
        assert_eq!(
            DeliveryConfig::default().with_jitter(1.5).validate(),
            Err(ConfigError::InvalidJitter(1.5))
        );
        assert!(DeliveryConfig::default().with_jitter(0.25).validate().is_ok());
    }
}

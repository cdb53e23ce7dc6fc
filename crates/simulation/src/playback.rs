//! Virtual-clock playback of a scenario against one protocol model.

use crate::{DeliveryConfig, DeliveryScheduler};
use distlab_core::{MessageId, ProtocolStateMachine};
use distlab_timeline::{PlaybackStatus, TimelineController};
use distlab_types::EventId;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Upper bound on events plus deliveries in [`Playback::run_to_completion`].
const MAX_PLAYBACK_STEPS: usize = 100_000;

/// Observable summary of a playback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackStats {
    /// Applied events.
    pub cursor: usize,
    pub events: usize,
    pub progress: f64,
    pub complete: bool,
    /// Virtual script time, in milliseconds.
    pub clock_ms: u64,
    pub pending_deliveries: usize,
    /// Length of the delivery log.
    pub deliveries: usize,
}

/// Clock and delivery-log length just before an event was applied.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Mark {
    clock: Duration,
    deliveries: usize,
}

/// Drives a [`TimelineController`] and a [`DeliveryScheduler`] against host
/// state `S` on one virtual clock.
///
/// Scripted events fire at their timestamps while the timeline is playing.
/// Scheduled deliveries fire at their due times regardless of status. When
/// an event and a delivery are due at the same instant the event goes
/// first.
pub struct Playback<S> {
    timeline: TimelineController<S>,
    state: S,
    initial: S,
    scheduler: DeliveryScheduler,
    clock: Duration,
    delivery_log: Vec<(Duration, MessageId)>,
    /// One per timeline snapshot, oldest first.
    marks: VecDeque<Mark>,
}

impl<S: ProtocolStateMachine> Playback<S> {
    pub fn new(state: S, timeline: TimelineController<S>, delivery: DeliveryConfig) -> Self {
        Self {
            initial: state.clone(),
            state,
            timeline,
            scheduler: DeliveryScheduler::new(delivery),
            clock: Duration::ZERO,
            delivery_log: Vec::new(),
            marks: VecDeque::new(),
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn timeline(&self) -> &TimelineController<S> {
        &self.timeline
    }

    pub fn timeline_mut(&mut self) -> &mut TimelineController<S> {
        &mut self.timeline
    }

    pub fn clock(&self) -> Duration {
        self.clock
    }

    /// The `deliver` calls that produced the current state, in order, with
    /// the time each was made.
    pub fn delivery_log(&self) -> &[(Duration, MessageId)] {
        &self.delivery_log
    }

    pub fn play(&mut self) {
        self.timeline.play();
    }

    pub fn pause(&mut self) {
        self.timeline.pause();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Running
    // ═══════════════════════════════════════════════════════════════════════

    /// Advance by `wall` host time, scaled by the timeline speed.
    ///
    /// Does nothing unless playing or complete.
    pub fn advance(&mut self, wall: Duration) {
        if matches!(
            self.timeline.status(),
            PlaybackStatus::Stopped | PlaybackStatus::Paused
        ) {
            return;
        }
        let until = self.clock + wall.mul_f64(self.timeline.speed());
        self.run_until(until);
    }

    /// Process everything due up to script time `until`, then set the clock
    /// to `until`.
    pub fn run_until(&mut self, until: Duration) {
        while let Some(at) = self.next_due().filter(|at| *at <= until) {
            self.step_at(at);
        }
        self.clock = self.clock.max(until);
    }

    /// Play the rest of the script and drain every delivery it causes.
    ///
    /// Returns false if the step bound was hit first.
    pub fn run_to_completion(&mut self) -> bool {
        self.play();
        for _ in 0..MAX_PLAYBACK_STEPS {
            let Some(at) = self.next_due() else {
                debug!(clock_ms = self.clock.as_millis() as u64, "Playback settled");
                return true;
            };
            self.step_at(at);
        }
        warn!(steps = MAX_PLAYBACK_STEPS, "Playback did not settle");
        false
    }

    fn next_event_at(&self) -> Option<Duration> {
        if self.timeline.status() != PlaybackStatus::Playing {
            return None;
        }
        self.timeline
            .next_event()
            .map(|e| Duration::from_millis(e.timestamp))
    }

    fn next_due(&self) -> Option<Duration> {
        match (self.next_event_at(), self.scheduler.next_due()) {
            (Some(event), Some(delivery)) => Some(event.min(delivery)),
            (event, delivery) => event.or(delivery),
        }
    }

    /// Fire the event or delivery due at `at`, events first.
    fn step_at(&mut self, at: Duration) {
        if self.next_event_at().is_some_and(|e| e <= at) {
            self.apply_event(at);
        } else {
            self.clock = self.clock.max(at);
            if let Some((_, id)) = self.scheduler.pop_due(self.clock) {
                trace!(message = %id, clock_ms = self.clock.as_millis() as u64, "Delivering");
                self.state.deliver(id);
                self.delivery_log.push((self.clock, id));
            }
        }
        self.scheduler.schedule_new(&self.state, self.clock);
    }

    /// Apply the next event at `at`, recording where to rewind to.
    fn apply_event(&mut self, at: Duration) -> bool {
        let mark = Mark {
            clock: self.clock,
            deliveries: self.delivery_log.len(),
        };
        self.clock = self.clock.max(at);
        if !self.timeline.step_forward(&mut self.state) {
            return false;
        }
        self.marks.push_back(mark);
        while self.marks.len() > self.timeline.history_len() {
            self.marks.pop_front();
        }
        true
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Scrubbing
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply the next event immediately, moving the clock to its timestamp
    /// if that is later.
    pub fn step_forward(&mut self) -> bool {
        let Some(at) = self.timeline.next_event().map(|e| Duration::from_millis(e.timestamp))
        else {
            return false;
        };
        let stepped = self.apply_event(at);
        self.scheduler.schedule_new(&self.state, self.clock);
        stepped
    }

    /// Undo the last event.
    ///
    /// The clock and delivery log go back to where they stood just before
    /// that event, and in-flight messages of the restored state are
    /// rescheduled from there.
    pub fn step_backward(&mut self) -> bool {
        let Some(prior) = self.timeline.step_backward() else {
            return false;
        };
        self.state = prior;
        if let Some(mark) = self.marks.pop_back() {
            self.clock = mark.clock;
            self.delivery_log.truncate(mark.deliveries);
        }
        self.reschedule();
        true
    }

    /// Replay from the initial state through event `id`.
    ///
    /// Deliveries between events are not replayed, so the delivery log is
    /// emptied; messages left in flight are rescheduled from the event's
    /// time.
    pub fn jump_to(&mut self, id: EventId) -> bool {
        if !self
            .timeline
            .jump_to_event_from(id, &mut self.state, self.initial.clone())
        {
            return false;
        }
        self.delivery_log.clear();
        let applied = self.timeline.cursor();
        let mut previous = Duration::ZERO;
        self.marks = self.timeline.events()[..applied]
            .iter()
            .map(|event| {
                let mark = Mark {
                    clock: previous,
                    deliveries: 0,
                };
                previous = Duration::from_millis(event.timestamp);
                mark
            })
            .collect();
        while self.marks.len() > self.timeline.history_len() {
            self.marks.pop_front();
        }
        self.clock = previous;
        self.reschedule();
        true
    }

    /// Back to the initial state, with the scheduler reseeded.
    pub fn reset(&mut self) {
        self.timeline.reset();
        self.state = self.initial.clone();
        self.scheduler.reset();
        self.clock = Duration::ZERO;
        self.delivery_log.clear();
        self.marks.clear();
    }

    fn reschedule(&mut self) {
        self.scheduler.clear();
        self.scheduler.schedule_new(&self.state, self.clock);
    }

    pub fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            cursor: self.timeline.cursor(),
            events: self.timeline.events().len(),
            progress: self.timeline.progress(),
            complete: self.timeline.is_complete(),
            clock_ms: self.clock.as_millis() as u64,
            pending_deliveries: self.scheduler.pending(),
            deliveries: self.delivery_log.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings;
    use distlab_raft::{RaftCluster, RaftConfig, Role};
    use distlab_timeline::{Scenario, TimelineConfig, TimelineEvent};
    use serde_json::json;

    fn election() -> Playback<RaftCluster> {
        let scenario = Scenario::new(
            "election",
            vec![
                TimelineEvent::new(1, 0, "start_election", json!({ "node": "node-0" })),
                TimelineEvent::new(2, 2000, "client_request", json!({ "node": "node-0", "command": "SET x=1" })),
            ],
        )
        .unwrap();
        let mut timeline = TimelineController::with_scenario(scenario, TimelineConfig::default());
        bindings::bind_raft(&mut timeline);
        Playback::new(
            RaftCluster::new(RaftConfig::new(5)),
            timeline,
            DeliveryConfig::default(),
        )
    }

    #[test]
    fn test_deliveries_wait_for_transit_delay() {
        let mut p = election();
        p.play();
        p.run_until(Duration::from_millis(499));
        assert_eq!(p.state().node("node-0").unwrap().role, Role::Candidate);
        assert_eq!(p.stats().pending_deliveries, 4);

        // Votes requested at 0 arrive at 500, replies at 1000.
        p.run_until(Duration::from_millis(1000));
        assert!(p.state().node("node-0").unwrap().is_leader());
        assert_eq!(p.stats().deliveries, 8);
    }

    #[test]
    fn test_paused_playback_fires_no_events() {
        let mut p = election();
        p.advance(Duration::from_secs(5));
        assert_eq!(p.timeline().cursor(), 0);
        assert_eq!(p.clock(), Duration::ZERO);

        p.play();
        p.advance(Duration::from_millis(100));
        assert_eq!(p.timeline().cursor(), 1);
    }

    #[test]
    fn test_run_to_completion_settles() {
        let mut p = election();
        assert!(p.run_to_completion());

        let stats = p.stats();
        assert!(stats.complete);
        assert_eq!(stats.pending_deliveries, 0);
        assert_eq!(p.state().node("node-0").unwrap().log.len(), 1);
        assert!(p.state().list_in_flight().is_empty());
    }

    #[test]
    fn test_step_backward_restores_prior_state() {
        let mut p = election();
        p.step_forward();
        p.run_until(Duration::from_millis(1000));
        let elected = p.state().clone();
        assert!(elected.node("node-0").unwrap().is_leader());

        p.step_forward();
        assert_eq!(p.clock(), Duration::from_millis(2000));
        assert_ne!(p.state(), &elected);

        assert!(p.step_backward());
        assert_eq!(p.state(), &elected);
        assert_eq!(p.clock(), Duration::from_millis(1000));
        assert_eq!(p.stats().deliveries, 8);

        assert!(p.step_backward());
        assert_eq!(p.state(), &RaftCluster::new(RaftConfig::new(5)));
        assert_eq!(p.clock(), Duration::ZERO);
        assert!(p.delivery_log().is_empty());
        assert!(!p.step_backward());
    }

    #[test]
    fn test_delivery_log_stays_ordered_after_step_backward() {
        let mut p = election();
        p.play();
        p.run_until(Duration::from_millis(1999));
        let before_request = p.delivery_log().to_vec();
        assert!(!before_request.is_empty());

        p.run_until(Duration::from_millis(3000));
        assert!(p.delivery_log().len() > before_request.len());

        // Undoing the client request forgets the deliveries made after it
        // and returns the clock to where it stood just before it.
        assert!(p.step_backward());
        assert_eq!(p.delivery_log(), before_request.as_slice());
        assert_eq!(p.clock(), Duration::from_millis(1999));

        p.play();
        p.run_until(Duration::from_millis(4000));
        let times: Vec<Duration> = p.delivery_log().iter().map(|(at, _)| *at).collect();
        assert!(times.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(p.state().node("node-0").unwrap().log.len(), 1);
    }

    #[test]
    fn test_jump_clears_delivery_log() {
        let mut p = election();
        assert!(p.run_to_completion());
        assert!(!p.delivery_log().is_empty());

        assert!(p.jump_to(EventId(1)));
        assert!(p.delivery_log().is_empty());
        assert_eq!(p.clock(), Duration::ZERO);
        assert!(p.step_backward());
        assert_eq!(p.state(), &RaftCluster::new(RaftConfig::new(5)));
    }

    #[test]
    fn test_jump_then_reset() {
        let mut p = election();
        assert!(p.jump_to(EventId(1)));
        assert_eq!(p.timeline().cursor(), 1);
        assert!(!p.jump_to(EventId(9)));

        p.reset();
        assert_eq!(p.timeline().cursor(), 0);
        assert_eq!(p.stats().deliveries, 0);
        assert_eq!(p.state(), &RaftCluster::new(RaftConfig::new(5)));
    }
}

//! Playback state machine over a scenario script.

use crate::{Scenario, TimelineConfig, TimelineError, TimelineEvent};
use distlab_core::ProtocolStateMachine;
use distlab_types::EventId;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Handler bound to an event type.
pub type EventHandler<S> = Box<dyn FnMut(&mut S, &TimelineEvent)>;

/// Host state that can return to its initial configuration.
///
/// Needed by [`TimelineController::jump_to_event`], which replays the script
/// from the beginning.
pub trait Replay: Clone {
    /// Return to the initial state.
    fn rewind(&mut self);
}

impl<T: ProtocolStateMachine> Replay for T {
    fn rewind(&mut self) {
        self.reset();
    }
}

/// Playback status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaybackStatus {
    /// Nothing applied yet, or reset.
    #[default]
    Stopped,
    /// The host should call `step_forward` every `tick_interval()`.
    Playing,
    Paused,
    /// Every event has been applied.
    Complete,
}

/// Replays a scenario against host state `S`.
///
/// Invariants:
/// - `cursor` is the number of applied events, `0..=events.len()`
/// - `history.len() <= cursor`; `history[i]` is the state before the event
///   at `cursor - history.len() + i`
/// - `speed` is finite and positive
pub struct TimelineController<S> {
    events: Vec<TimelineEvent>,
    cursor: usize,
    status: PlaybackStatus,
    speed: f64,
    history: VecDeque<S>,
    handlers: HashMap<String, EventHandler<S>>,
    config: TimelineConfig,
}

impl<S> fmt::Debug for TimelineController<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<_> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("TimelineController")
            .field("events", &self.events.len())
            .field("cursor", &self.cursor)
            .field("status", &self.status)
            .field("speed", &self.speed)
            .field("history", &self.history.len())
            .field("handlers", &handlers)
            .finish()
    }
}

impl<S: Clone> TimelineController<S> {
    /// Create an empty controller.
    pub fn new(config: TimelineConfig) -> Self {
        Self {
            events: Vec::new(),
            cursor: 0,
            status: PlaybackStatus::Stopped,
            speed: config.default_speed,
            history: VecDeque::new(),
            handlers: HashMap::new(),
            config,
        }
    }

    /// Create a controller with a loaded scenario.
    pub fn with_scenario(scenario: Scenario, config: TimelineConfig) -> Self {
        let mut controller = Self::new(config);
        controller.load(scenario);
        controller
    }

    /// Replace the script. Handlers and speed are kept.
    pub fn load(&mut self, scenario: Scenario) {
        debug!(
            scenario = %scenario.name,
            events = scenario.events.len(),
            "Loading scenario"
        );
        self.events = scenario.events;
        self.reset();
    }

    /// Bind a handler to an event type, replacing any earlier binding.
    pub fn on(
        &mut self,
        kind: impl Into<String>,
        handler: impl FnMut(&mut S, &TimelineEvent) + 'static,
    ) {
        self.handlers.insert(kind.into(), Box::new(handler));
    }

    /// Check if an event type has a handler.
    pub fn has_handler(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Playback
    // ═══════════════════════════════════════════════════════════════════════

    /// Start playing. No-op once complete.
    pub fn play(&mut self) {
        match self.status {
            PlaybackStatus::Complete => {}
            _ if self.cursor >= self.events.len() => self.status = PlaybackStatus::Complete,
            _ => self.status = PlaybackStatus::Playing,
        }
    }

    /// Pause playback. Idempotent; no-op once complete.
    pub fn pause(&mut self) {
        if self.status != PlaybackStatus::Complete {
            self.status = PlaybackStatus::Paused;
        }
    }

    /// Apply the next event, snapshotting `state` first.
    ///
    /// Returns false if every event was already applied.
    pub fn step_forward(&mut self, state: &mut S) -> bool {
        let snapshot = state.clone();
        self.step_forward_with(state, snapshot)
    }

    /// Apply the next event, recording `prior` as the snapshot.
    ///
    /// Used by hosts whose snapshot holds more than `state` (e.g. a delivery
    /// queue alongside the protocol).
    pub fn step_forward_with(&mut self, state: &mut S, prior: S) -> bool {
        if self.cursor >= self.events.len() {
            self.status = PlaybackStatus::Complete;
            return false;
        }

        self.push_snapshot(prior);
        self.apply_next(state);

        if self.cursor >= self.events.len() {
            self.status = PlaybackStatus::Complete;
        } else if self.status == PlaybackStatus::Stopped {
            self.status = PlaybackStatus::Paused;
        }
        true
    }

    /// Undo the last applied event.
    ///
    /// Returns the snapshot taken before that event for the host to restore,
    /// or `None` when there is no history.
    pub fn step_backward(&mut self) -> Option<S> {
        let snapshot = self.history.pop_back()?;
        self.cursor -= 1;
        if self.status == PlaybackStatus::Complete {
            self.status = PlaybackStatus::Paused;
        }
        trace!(cursor = self.cursor, "Stepped backward");
        Some(snapshot)
    }

    /// Rewind `state` and replay from the start through event `id`.
    ///
    /// The end state does not depend on the cursor before the call. Unknown
    /// ids return false and change nothing.
    pub fn jump_to_event(&mut self, id: EventId, state: &mut S) -> bool
    where
        S: Replay,
    {
        if self.index_of(id).is_none() {
            return false;
        }
        let mut initial = state.clone();
        initial.rewind();
        self.jump_to_event_from(id, state, initial)
    }

    /// Replay from `initial` through event `id`.
    pub fn jump_to_event_from(&mut self, id: EventId, state: &mut S, initial: S) -> bool {
        let Some(target) = self.index_of(id) else {
            debug!(event = %id, "Jump to unknown event ignored");
            return false;
        };

        *state = initial;
        self.cursor = 0;
        self.history.clear();

        while self.cursor <= target {
            self.push_snapshot(state.clone());
            self.apply_next(state);
        }

        self.status = if self.cursor >= self.events.len() {
            PlaybackStatus::Complete
        } else {
            PlaybackStatus::Paused
        };
        debug!(event = %id, cursor = self.cursor, "Jumped to event");
        true
    }

    /// Return to the start: cursor 0, no history, stopped.
    ///
    /// Host state is untouched; the host resets it alongside.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.history.clear();
        self.status = PlaybackStatus::Stopped;
    }

    fn index_of(&self, id: EventId) -> Option<usize> {
        self.events.iter().position(|e| e.id == id)
    }

    fn push_snapshot(&mut self, snapshot: S) {
        self.history.push_back(snapshot);
        if let Some(max) = self.config.max_history {
            while self.history.len() > max {
                self.history.pop_front();
            }
        }
    }

    fn apply_next(&mut self, state: &mut S) {
        let Some(event) = self.events.get(self.cursor) else {
            return;
        };
        match self.handlers.get_mut(&event.kind) {
            Some(handler) => {
                trace!(event = %event.id, kind = %event.kind, "Applying event");
                handler(state, event);
            }
            None => {
                warn!(event = %event.id, kind = %event.kind, "No handler for event type");
            }
        }
        self.cursor += 1;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Speed & progress
    // ═══════════════════════════════════════════════════════════════════════

    /// Set the speed multiplier. Must be finite and positive.
    pub fn set_speed(&mut self, speed: f64) -> Result<(), TimelineError> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(TimelineError::InvalidSpeed(speed));
        }
        self.speed = speed;
        Ok(())
    }

    /// Current speed multiplier.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Host cadence for `step_forward` while playing.
    pub fn tick_interval(&self) -> Duration {
        self.config.base_interval.div_f64(self.speed)
    }

    /// Percentage of events applied, 0 for an empty script.
    pub fn progress(&self) -> f64 {
        if self.events.is_empty() {
            0.0
        } else {
            self.cursor as f64 / self.events.len() as f64 * 100.0
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    /// Number of applied events.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// The most recently applied event.
    pub fn current_event(&self) -> Option<&TimelineEvent> {
        self.cursor.checked_sub(1).and_then(|i| self.events.get(i))
    }

    /// The next event to apply.
    pub fn next_event(&self) -> Option<&TimelineEvent> {
        self.events.get(self.cursor)
    }

    pub fn can_step_backward(&self) -> bool {
        !self.history.is_empty()
    }

    /// Number of stored snapshots.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn is_complete(&self) -> bool {
        self.status == PlaybackStatus::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use tracing_test::traced_test;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Counter {
        value: i64,
        log: Vec<String>,
    }

    impl Replay for Counter {
        fn rewind(&mut self) {
            *self = Counter::default();
        }
    }

    #[derive(Deserialize)]
    struct AddArgs {
        amount: i64,
    }

    fn scenario() -> Scenario {
        Scenario::new(
            "counter",
            vec![
                TimelineEvent::new(1, 0, "add", json!({ "amount": 1 })),
                TimelineEvent::new(2, 100, "add", json!({ "amount": 10 })),
                TimelineEvent::new(3, 200, "mystery", json!({})),
                TimelineEvent::new(4, 300, "add", json!({ "amount": 100 })),
            ],
        )
        .unwrap()
    }

    fn controller() -> TimelineController<Counter> {
        let mut timeline = TimelineController::with_scenario(scenario(), TimelineConfig::default());
        timeline.on("add", |state: &mut Counter, event| {
            if let Some(args) = event.args::<AddArgs>() {
                state.value += args.amount;
                state.log.push(event.id.to_string());
            }
        });
        timeline
    }

    #[test]
    fn test_step_forward_applies_in_order() {
        let mut timeline = controller();
        let mut state = Counter::default();

        assert!(timeline.step_forward(&mut state));
        assert_eq!(state.value, 1);
        assert_eq!(timeline.status(), PlaybackStatus::Paused);
        assert!(timeline.step_forward(&mut state));
        assert_eq!(state.value, 11);
        assert_eq!(timeline.cursor(), 2);
        assert_eq!(timeline.progress(), 50.0);
    }

    #[traced_test]
    #[test]
    fn test_unbound_event_is_skipped() {
        let mut timeline = controller();
        let mut state = Counter::default();

        for _ in 0..3 {
            timeline.step_forward(&mut state);
        }
        assert_eq!(state.value, 11);
        assert_eq!(timeline.cursor(), 3);
        assert!(logs_contain("No handler for event type"));
    }

    #[test]
    fn test_completes_on_last_event() {
        let mut timeline = controller();
        let mut state = Counter::default();
        timeline.play();
        assert_eq!(timeline.status(), PlaybackStatus::Playing);

        while timeline.step_forward(&mut state) {}
        assert_eq!(state.value, 111);
        assert!(timeline.is_complete());
        assert_eq!(timeline.progress(), 100.0);

        // Already complete: nothing more to do.
        assert!(!timeline.step_forward(&mut state));
        timeline.play();
        assert!(timeline.is_complete());
    }

    #[test]
    fn test_step_backward_restores_snapshot() {
        let mut timeline = controller();
        let mut state = Counter::default();
        timeline.step_forward(&mut state);
        let before = state.clone();

        timeline.step_forward(&mut state);
        state = timeline.step_backward().unwrap();
        assert_eq!(state, before);
        assert_eq!(timeline.cursor(), 1);

        // Forward/backward pairs are no-ops.
        for _ in 0..3 {
            timeline.step_forward(&mut state);
            state = timeline.step_backward().unwrap();
        }
        assert_eq!(state, before);
    }

    #[test]
    fn test_step_backward_without_history() {
        let mut timeline = controller();
        assert!(timeline.step_backward().is_none());
        assert!(!timeline.can_step_backward());
    }

    #[test]
    fn test_step_backward_from_complete_pauses() {
        let mut timeline = controller();
        let mut state = Counter::default();
        while timeline.step_forward(&mut state) {}

        state = timeline.step_backward().unwrap();
        assert_eq!(state.value, 11);
        assert_eq!(timeline.status(), PlaybackStatus::Paused);
    }

    #[test]
    fn test_jump_is_independent_of_cursor() {
        let mut fresh = controller();
        let mut from_start = Counter::default();
        assert!(fresh.jump_to_event(EventId(2), &mut from_start));

        let mut scrubbed = controller();
        let mut state = Counter::default();
        while scrubbed.step_forward(&mut state) {}
        assert!(scrubbed.jump_to_event(EventId(2), &mut state));

        assert_eq!(state, from_start);
        assert_eq!(state.value, 11);
        assert_eq!(scrubbed.cursor(), 2);
        assert_eq!(scrubbed.status(), PlaybackStatus::Paused);

        // History was rebuilt, so stepping back still works.
        let previous = scrubbed.step_backward().unwrap();
        assert_eq!(previous.value, 1);
    }

    #[test]
    fn test_jump_to_unknown_event() {
        let mut timeline = controller();
        let mut state = Counter::default();
        timeline.step_forward(&mut state);

        assert!(!timeline.jump_to_event(EventId(42), &mut state));
        assert_eq!(state.value, 1);
        assert_eq!(timeline.cursor(), 1);
    }

    #[test]
    fn test_speed() {
        let mut timeline = controller();
        assert_eq!(timeline.tick_interval(), Duration::from_millis(1000));

        timeline.set_speed(2.0).unwrap();
        assert_eq!(timeline.tick_interval(), Duration::from_millis(500));

        assert_eq!(timeline.set_speed(0.0), Err(TimelineError::InvalidSpeed(0.0)));
        assert!(timeline.set_speed(f64::NAN).is_err());
        assert!(timeline.set_speed(-1.0).is_err());
        assert_eq!(timeline.speed(), 2.0);
    }

    #[test]
    fn test_pause_is_idempotent() {
        let mut timeline = controller();
        timeline.play();
        timeline.pause();
        timeline.pause();
        assert_eq!(timeline.status(), PlaybackStatus::Paused);
    }

    #[test]
    fn test_reset_and_reload() {
        let mut timeline = controller();
        let mut state = Counter::default();
        timeline.step_forward(&mut state);
        timeline.reset();

        assert_eq!(timeline.cursor(), 0);
        assert_eq!(timeline.status(), PlaybackStatus::Stopped);
        assert!(!timeline.can_step_backward());

        timeline.load(Scenario::default());
        assert_eq!(timeline.progress(), 0.0);
        assert!(timeline.has_handler("add"));
    }

    #[test]
    fn test_later_handler_replaces_earlier() {
        let mut timeline = controller();
        timeline.on("add", |state: &mut Counter, _| state.value -= 1);
        let mut state = Counter::default();
        timeline.step_forward(&mut state);
        assert_eq!(state.value, -1);
    }

    #[test]
    fn test_history_cap() {
        let config = TimelineConfig::default().with_max_history(1);
        let mut timeline = TimelineController::with_scenario(scenario(), config);
        timeline.on("add", |state: &mut Counter, _| state.value += 1);
        let mut state = Counter::default();

        timeline.step_forward(&mut state);
        timeline.step_forward(&mut state);
        assert!(timeline.step_backward().is_some());
        assert!(timeline.step_backward().is_none());
        assert_eq!(timeline.cursor(), 1);
    }
}

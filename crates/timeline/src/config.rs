//! Timeline configuration.

use std::time::Duration;

/// Configuration for a [`TimelineController`](crate::TimelineController).
#[derive(Debug, Clone)]
pub struct TimelineConfig {
    /// Interval between steps at speed 1.0.
    pub base_interval: Duration,

    /// Initial speed multiplier.
    pub default_speed: f64,

    /// Cap on stored snapshots. `None` keeps one per applied event.
    ///
    /// When the cap is hit the oldest snapshot is discarded, so stepping
    /// backward stops short of the start of the script.
    pub max_history: Option<usize>,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(1000),
            default_speed: 1.0,
            max_history: None,
        }
    }
}

impl TimelineConfig {
    /// Set the base interval.
    pub fn with_base_interval(mut self, interval: Duration) -> Self {
        self.base_interval = interval;
        self
    }

    /// Set the initial speed. Invalid values fall back to 1.0.
    pub fn with_default_speed(mut self, speed: f64) -> Self {
        self.default_speed = if speed.is_finite() && speed > 0.0 {
            speed
        } else {
            1.0
        };
        self
    }

    /// Cap the snapshot history.
    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = Some(max);
        self
    }
}

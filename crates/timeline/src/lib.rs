//! Timeline controller for distlab scenarios.
//!
//! Turns a fixed, timestamped script of events into a scrubbable replay:
//! play, pause, step forward/backward, jump, speed control and progress.
//!
//! ```text
//!   Scenario ──load──▶ TimelineController<S> ──handler──▶ S (host state)
//!                        cursor │ history
//!                               ▼
//!                     one snapshot of S per applied event
//! ```
//!
//! The controller never mutates host state except through registered
//! handlers, and never reads wall-clock time: the host decides when to call
//! [`TimelineController::step_forward`], using
//! [`TimelineController::tick_interval`] as its cadence.

mod config;
mod controller;
mod error;
mod event;

pub use config::TimelineConfig;
pub use controller::{EventHandler, PlaybackStatus, Replay, TimelineController};
pub use error::{ScenarioError, TimelineError};
pub use event::{Scenario, TimelineEvent};

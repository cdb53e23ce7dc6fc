//! Error types for scenarios and playback.

use distlab_types::EventId;
use thiserror::Error;

/// Errors loading a scenario script.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// The scenario is not valid JSON or does not match the schema.
    #[error("Invalid scenario JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// An event's timestamp is earlier than its predecessor's.
    #[error("Event {id} at {timestamp}ms precedes previous event at {previous}ms")]
    Unsorted {
        id: EventId,
        timestamp: u64,
        previous: u64,
    },

    /// Event ids must strictly increase through the script.
    #[error("Event id {id} does not follow {previous}")]
    NonIncreasingId { id: EventId, previous: EventId },
}

/// Errors controlling playback.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimelineError {
    /// Speed multipliers must be finite and positive.
    #[error("Invalid playback speed: {0}")]
    InvalidSpeed(f64),
}

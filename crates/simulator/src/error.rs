//! Replay errors.

use distlab_simulation::ConfigError;
use distlab_timeline::{ScenarioError, TimelineError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid scenario: {0}")]
    Scenario(#[from] ScenarioError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Timeline(#[from] TimelineError),

    #[error("Failed to encode stats: {0}")]
    Stats(#[from] serde_json::Error),
}

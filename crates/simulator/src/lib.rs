//! Headless scenario replay.
//!
//! Loads a scenario file, binds it to one protocol model through
//! `distlab-simulation`, plays it to completion on the virtual clock and
//! reports the final statistics.
//!
//! # Example
//!
//! ```ignore
//! use distlab_simulator::{replay, Protocol, ReplayConfig};
//!
//! let scenario = distlab_simulator::load_scenario("scenarios/raft-election.json")?;
//! let config = ReplayConfig::new(Protocol::Raft).with_nodes(5).with_seed(7);
//! let report = replay(scenario, &config)?;
//! println!("{report}");
//! ```

mod config;
mod error;
mod runner;

pub use config::{Protocol, ReplayConfig};
pub use error::ReplayError;
pub use runner::{load_scenario, replay, ReplayReport};

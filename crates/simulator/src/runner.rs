//! Replay runner.

use crate::{Protocol, ReplayConfig, ReplayError};
use distlab_core::ProtocolStateMachine;
use distlab_crdt::{GCounter, LwwRegister, OrSet, PnCounter};
use distlab_simulation::{self as simulation, Playback, PlaybackStats};
use distlab_timeline::Scenario;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// Outcome of one replay.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub scenario: String,
    pub protocol: Protocol,
    pub speed: f64,
    /// False if playback hit its step bound before going quiet.
    pub settled: bool,
    pub playback: PlaybackStats,
    /// Host time the run would take at `speed`, in milliseconds.
    pub wall_ms: u64,
    /// Final protocol statistics.
    pub stats: serde_json::Value,
}

impl fmt::Display for ReplayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "scenario:   {} ({})", self.scenario, self.protocol)?;
        writeln!(
            f,
            "events:     {}/{} ({:.0}%)",
            self.playback.cursor, self.playback.events, self.playback.progress
        )?;
        writeln!(f, "deliveries: {}", self.playback.deliveries)?;
        writeln!(
            f,
            "clock:      {}ms script, {}ms at {}x",
            self.playback.clock_ms, self.wall_ms, self.speed
        )?;
        writeln!(f, "settled:    {}", if self.settled { "yes" } else { "no" })?;
        let stats = serde_json::to_string_pretty(&self.stats).map_err(|_| fmt::Error)?;
        writeln!(f, "stats:\n{stats}")
    }
}

/// Read and validate a scenario file.
pub fn load_scenario(path: impl AsRef<Path>) -> Result<Scenario, ReplayError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Scenario::from_json(&json)?)
}

/// Replay `scenario` against the configured protocol until nothing is left
/// to fire.
pub fn replay(scenario: Scenario, config: &ReplayConfig) -> Result<ReplayReport, ReplayError> {
    let harness = config.harness_config();
    let name = scenario.name.clone();
    match config.protocol {
        Protocol::Raft => run(
            name,
            config,
            simulation::raft(config.raft_config(), scenario, &harness)?,
        ),
        Protocol::Paxos => run(
            name,
            config,
            simulation::paxos(config.paxos_config(), scenario, &harness)?,
        ),
        Protocol::Pbft => run(
            name,
            config,
            simulation::pbft(config.pbft_config(), scenario, &harness)?,
        ),
        Protocol::Quorum => run(
            name,
            config,
            simulation::quorum(config.quorum_config(), scenario, &harness)?,
        ),
        Protocol::Isr => run(
            name,
            config,
            simulation::isr(config.isr_config(), scenario, &harness)?,
        ),
        Protocol::Chain => run(
            name,
            config,
            simulation::chain(config.chain_config(), scenario, &harness)?,
        ),
        Protocol::AntiEntropy => run(
            name,
            config,
            simulation::anti_entropy(config.anti_entropy_config(), scenario, &harness)?,
        ),
        Protocol::TwoPhaseCommit => run(
            name,
            config,
            simulation::two_phase_commit(config.commit_config(), scenario, &harness)?,
        ),
        Protocol::ThreePhaseCommit => run(
            name,
            config,
            simulation::three_phase_commit(config.commit_config(), scenario, &harness)?,
        ),
        Protocol::Gossip => run(
            name,
            config,
            simulation::gossip(config.gossip_config(), scenario, &harness)?,
        ),
        Protocol::PhiAccrual => run(
            name,
            config,
            simulation::phi_accrual(config.phi_accrual_config(), scenario, &harness)?,
        ),
        Protocol::Sharding => run(
            name,
            config,
            simulation::sharding(config.sharding_config(), scenario, &harness)?,
        ),
        Protocol::GCounter => run(
            name,
            config,
            simulation::crdt::<GCounter>(config.crdt_config(), scenario, &harness)?,
        ),
        Protocol::PnCounter => run(
            name,
            config,
            simulation::crdt::<PnCounter>(config.crdt_config(), scenario, &harness)?,
        ),
        Protocol::LwwRegister => run(
            name,
            config,
            simulation::crdt::<LwwRegister>(config.crdt_config(), scenario, &harness)?,
        ),
        Protocol::OrSet => run(
            name,
            config,
            simulation::crdt::<OrSet>(config.crdt_config(), scenario, &harness)?,
        ),
        Protocol::Lamport => run(
            name,
            config,
            simulation::lamport(config.clock_config(), scenario, &harness)?,
        ),
        Protocol::VectorClocks => run(
            name,
            config,
            simulation::vector_clocks(config.clock_config(), scenario, &harness)?,
        ),
        Protocol::CausalBroadcast => run(
            name,
            config,
            simulation::causal_broadcast(config.clock_config(), scenario, &harness)?,
        ),
        Protocol::LockService => run(
            name,
            config,
            simulation::lock_service(config.lock_config(), scenario, &harness)?,
        ),
        Protocol::WorkQueue => run(
            name,
            config,
            simulation::work_queue(config.work_queue_config(), scenario, &harness)?,
        ),
    }
}

fn run<S: ProtocolStateMachine>(
    scenario: String,
    config: &ReplayConfig,
    mut playback: Playback<S>,
) -> Result<ReplayReport, ReplayError> {
    playback.timeline_mut().set_speed(config.speed)?;
    let settled = playback.run_to_completion();
    if !settled {
        warn!(scenario = %scenario, "Replay stopped before settling");
    }

    let stats = playback.stats();
    let wall_ms = (stats.clock_ms as f64 / config.speed).round() as u64;
    info!(
        scenario = %scenario,
        protocol = %config.protocol,
        events = stats.cursor,
        deliveries = stats.deliveries,
        clock_ms = stats.clock_ms,
        "Replay finished"
    );

    Ok(ReplayReport {
        scenario,
        protocol: config.protocol,
        speed: config.speed,
        settled,
        playback: stats,
        wall_ms,
        stats: serde_json::to_value(playback.state().stats())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use distlab_timeline::TimelineEvent;
    use serde_json::json;
    use tracing_test::traced_test;

    fn scenario() -> Scenario {
        Scenario::new(
            "two-phase",
            vec![
                TimelineEvent::new(1, 0, "begin", json!({ "txn": "t1" })),
                TimelineEvent::new(2, 3000, "begin", json!({ "txn": "t2" })),
            ],
        )
        .unwrap()
    }

    #[traced_test]
    #[test]
    fn test_report_carries_protocol_stats() {
        let config = ReplayConfig::new(Protocol::TwoPhaseCommit).with_speed(2.0);
        let report = replay(scenario(), &config).unwrap();

        assert!(report.settled);
        assert_eq!(report.playback.cursor, 2);
        assert_eq!(report.stats["committed"], 3);
        assert_eq!(report.stats["coordinator"], "committed");
        assert_eq!(report.wall_ms, report.playback.clock_ms / 2);
        assert!(report.to_string().contains("two-phase (two-phase-commit)"));
        assert!(logs_contain("Replay finished"));
    }

    #[test]
    fn test_pbft_nodes_round_down_to_three_f_plus_one() {
        let scenario = Scenario::new(
            "pbft",
            vec![TimelineEvent::new(1, 0, "client_request", json!({ "operation": "SET x=1" }))],
        )
        .unwrap();
        let config = ReplayConfig::new(Protocol::Pbft).with_nodes(6);
        let report = replay(scenario, &config).unwrap();

        assert_eq!(config.pbft_config().faults, 1);
        assert_eq!(report.stats["honest_committed"], 4);
        assert!(report.to_string().contains("pbft (pbft)"));
    }

    #[test]
    fn test_crdt_protocols_share_one_scenario_shape() {
        let scenario = Scenario::new(
            "register",
            vec![
                TimelineEvent::new(1, 0, "apply", json!({ "node": "replica-1", "op": "blue" })),
                TimelineEvent::new(2, 100, "broadcast", json!({ "node": "replica-1" })),
            ],
        )
        .unwrap();
        let report = replay(scenario, &ReplayConfig::new(Protocol::LwwRegister)).unwrap();

        assert!(report.settled);
        assert_eq!(report.stats["converged"], true);
        assert_eq!(report.protocol.to_string(), "lww-register");
    }

    #[test]
    fn test_invalid_speed_is_an_error() {
        let config = ReplayConfig::new(Protocol::Raft).with_speed(0.0);
        assert!(matches!(
            replay(scenario(), &config),
            Err(ReplayError::Timeline(_))
        ));
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let err = load_scenario("no/such/scenario.json").unwrap_err();
        assert!(matches!(err, ReplayError::Io { .. }));
        assert!(err.to_string().contains("no/such/scenario.json"));
    }
}

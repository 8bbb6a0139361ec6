use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{ArgStyle, ProtocolProfile};
use crate::topology::Position;

/// Problems that make an experiment impossible to start. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no {0} executable configured")]
    MissingExecutable(&'static str),
    #[error("executable {0} cannot be resolved")]
    UnresolvableExecutable(PathBuf),
    #[error("unknown protocol '{0}', expected one of svs, syncps, ip")]
    UnknownProtocol(String),
    #[error("invalid topology: {0}")]
    InvalidTopology(String),
    #[error("node '{0}' already exists")]
    DuplicateNode(String),
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub anchors: usize,
    pub participants_per_anchor: usize,
    pub link_delay_ms: u64,
    pub mobile_name: String,
    /// Explicit anchor positions; derived from the anchor count when absent.
    pub positions: Option<Vec<Position>>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            anchors: 4,
            participants_per_anchor: 5,
            link_delay_ms: 10,
            mobile_name: "uav".to_string(),
            positions: None,
        }
    }
}

impl TopologyConfig {
    pub fn anchor_positions(&self) -> Vec<Position> {
        if let Some(positions) = &self.positions
            && positions.len() == self.anchors
        {
            return positions.clone();
        }
        if self.anchors == 4 {
            // Corners of the square flight path, in hand-off order from ap1.
            return vec![
                Position::new(200.0, 800.0),
                Position::new(800.0, 800.0),
                Position::new(800.0, 200.0),
                Position::new(200.0, 200.0),
            ];
        }
        (0..self.anchors)
            .map(|i| {
                let angle = std::f64::consts::TAU * i as f64 / self.anchors as f64;
                Position::new(500.0 + 300.0 * angle.cos(), 500.0 + 300.0 * angle.sin())
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartAnchor {
    Fixed(usize),
    /// Drawn from the run's seeded random source.
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub dwell_ms: u64,
    pub start_anchor: StartAnchor,
    pub initial_skip: usize,
    /// Full anchor rounds while workers publish.
    pub publish_rounds: usize,
    /// Full anchor rounds after the drain trigger.
    pub drain_rounds: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            dwell_ms: 30_000,
            start_anchor: StartAnchor::Fixed(0),
            initial_skip: 1,
            publish_rounds: 2,
            drain_rounds: 2,
        }
    }
}

impl ScheduleConfig {
    pub fn total_ticks(&self, anchors: usize) -> usize {
        (self.publish_rounds + self.drain_rounds) * anchors + 1
    }

    pub fn drain_tick(&self, anchors: usize) -> usize {
        self.publish_rounds * anchors
    }
}

/// Loss percentages (0 to 100) applied to anchor links.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossValues {
    pub connected: f64,
    pub disconnected: f64,
}

impl Default for LossValues {
    fn default() -> Self {
        Self {
            connected: 1.0,
            disconnected: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub interval_ms: u64,
    pub node_timeout_ms: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            node_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub launch_timeout_ms: u64,
    pub grace_period_ms: u64,
    /// Pause between stopping everything and the final snapshot.
    pub settle_ms: u64,
    /// Pause after daemons start, before baseline commands.
    pub warmup_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            launch_timeout_ms: 5_000,
            grace_period_ms: 3_000,
            settle_ms: 3_000,
            warmup_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunsConfig {
    pub count: usize,
    pub seed_base: u64,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            count: 1,
            seed_base: 0,
        }
    }
}

impl RunsConfig {
    pub fn seed_for(&self, run: usize) -> u64 {
        self.seed_base.wrapping_add(run as u64)
    }
}

/// Free-space (Friis) link budget used to turn distance into loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    pub tx_power_dbm: f64,
    pub tx_gain_dbi: f64,
    pub rx_gain_dbi: f64,
    pub frequency_mhz: f64,
    /// Below this received power the link is treated as disconnected.
    pub sensitivity_dbm: f64,
    /// Above sensitivity + margin the link is treated as connected.
    pub margin_db: f64,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            tx_power_dbm: 14.0,
            tx_gain_dbi: 5.0,
            rx_gain_dbi: 5.0,
            frequency_mhz: 2412.0,
            sensitivity_dbm: -70.0,
            margin_db: 6.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    /// Closed path for the mobile node. Empty means the square path of the
    /// platoon scenario.
    pub waypoints: Vec<Position>,
    /// Average time per leg; defaults to the effective dwell. Speed is
    /// constant over the whole path.
    pub leg_ms: Option<u64>,
    pub propagation: PropagationConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum MobilityPolicy {
    /// Binary switching: one anchor link connected, the rest disconnected.
    #[default]
    Handoff,
    /// Position-driven loss from a propagation model.
    Trajectory(TrajectoryConfig),
}

/// Everything one experiment batch needs. Built once, validated, then shared
/// read-only by every component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub protocol: ProtocolProfile,
    pub topology: TopologyConfig,
    pub mobility: MobilityPolicy,
    pub schedule: ScheduleConfig,
    pub loss: LossValues,
    pub sampling: SamplingConfig,
    pub lifecycle: LifecycleConfig,
    pub runs: RunsConfig,
    pub log_root: PathBuf,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "roaming".to_string(),
            protocol: ProtocolProfile::svs(),
            topology: TopologyConfig::default(),
            mobility: MobilityPolicy::default(),
            schedule: ScheduleConfig::default(),
            loss: LossValues::default(),
            sampling: SamplingConfig::default(),
            lifecycle: LifecycleConfig::default(),
            runs: RunsConfig::default(),
            log_root: PathBuf::from("logs"),
        }
    }
}

impl ExperimentConfig {
    /// Dwell actually waited per scheduling tick. A zero dwell still costs
    /// one control tick so the loop never spins.
    pub fn effective_dwell(&self) -> Duration {
        Duration::from_millis(self.schedule.dwell_ms.max(self.sampling.interval_ms))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sampling.interval_ms)
    }

    pub fn total_ticks(&self) -> usize {
        self.schedule.total_ticks(self.topology.anchors)
    }

    pub fn drain_tick(&self) -> usize {
        self.schedule.drain_tick(self.topology.anchors)
    }

    pub fn protocol_root(&self) -> PathBuf {
        self.log_root.join(&self.protocol.name)
    }

    pub fn run_dir(&self, run: usize) -> PathBuf {
        self.protocol_root().join(run.to_string())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topology.anchors == 0 {
            return Err(ConfigError::InvalidTopology(
                "at least one anchor is required".to_string(),
            ));
        }
        if let Some(positions) = &self.topology.positions
            && positions.len() != self.topology.anchors
        {
            return Err(invalid(
                "topology.positions",
                format!(
                    "{} positions for {} anchors",
                    positions.len(),
                    self.topology.anchors
                ),
            ));
        }
        for (field, value) in [
            ("loss.connected", self.loss.connected),
            ("loss.disconnected", self.loss.disconnected),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(invalid(field, format!("{value} is outside 0..=100")));
            }
        }
        if self.loss.connected == self.loss.disconnected {
            return Err(invalid(
                "loss",
                "connected and disconnected loss must differ",
            ));
        }
        if self.sampling.interval_ms == 0 {
            return Err(invalid("sampling.interval_ms", "must be positive"));
        }
        if self.sampling.node_timeout_ms == 0 {
            return Err(invalid("sampling.node_timeout_ms", "must be positive"));
        }
        if self.runs.count == 0 {
            return Err(invalid("runs.count", "at least one run is required"));
        }
        if let StartAnchor::Fixed(k) = self.schedule.start_anchor
            && k >= self.topology.anchors
        {
            return Err(invalid(
                "schedule.start_anchor",
                format!("anchor {k} does not exist"),
            ));
        }
        if let MobilityPolicy::Trajectory(trajectory) = &self.mobility {
            if trajectory.waypoints.len() == 1 {
                return Err(invalid(
                    "mobility.waypoints",
                    "a trajectory needs at least two waypoints",
                ));
            }
            if trajectory.leg_ms == Some(0) {
                return Err(invalid("mobility.leg_ms", "must be positive"));
            }
        }
        if let ArgStyle::Store { listen_address } = &self.protocol.arg_style
            && listen_address.is_empty()
        {
            return Err(invalid("protocol.listen_address", "must not be empty"));
        }
        if self.protocol.participant_executable.is_none() {
            return Err(ConfigError::MissingExecutable("participant"));
        }
        if self.protocol.mobile_executable.is_none() {
            return Err(ConfigError::MissingExecutable("mobile"));
        }
        Ok(())
    }
}

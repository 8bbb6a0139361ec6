use std::f64::consts::PI;
use std::time::Duration;

use roam_lab_abstract::{
    ExperimentConfig, LossValues, MobilityPolicy, Position, PropagationConfig, TrajectoryConfig,
};

use crate::schedule::ConnectivitySchedule;

const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Highest ramp position any anchor but the strongest may reach, so that
/// only one link is ever fully connected.
const RUNNER_UP_CEILING: f64 = 0.9;

/// One connectivity change, as decided by a mobility model.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Discrete hand-off to a single anchor.
    Connect(usize),
    /// Explicit loss per anchor link; `strongest` is the best-served anchor.
    Shape { strongest: usize, losses: Vec<f64> },
}

/// Decides the connectivity of each scheduling tick. The controller only
/// talks to this trait, whatever the configured policy is.
pub trait MobilityModel: Send {
    /// `elapsed` is the start of the tick's dwell window, measured from the
    /// start of ACTIVE.
    fn advance(&mut self, tick: usize, elapsed: Duration) -> Transition;
}

pub struct HandoffModel {
    schedule: ConnectivitySchedule,
}

impl HandoffModel {
    pub fn new(schedule: ConnectivitySchedule) -> Self {
        Self { schedule }
    }
}

impl MobilityModel for HandoffModel {
    fn advance(&mut self, tick: usize, _elapsed: Duration) -> Transition {
        Transition::Connect(self.schedule.anchor_at(tick))
    }
}

/// Moves the mobile node along a closed path at constant speed and derives
/// the loss of every anchor link from its distance to that anchor.
pub struct TrajectoryModel {
    path: Vec<Position>,
    anchors: Vec<Position>,
    period: Duration,
    propagation: PropagationConfig,
    loss: LossValues,
}

/// The square flight path the platoon scenario was recorded with.
pub fn default_waypoints() -> Vec<Position> {
    vec![
        Position::new(400.0, 800.0),
        Position::new(800.0, 800.0),
        Position::new(800.0, 200.0),
        Position::new(200.0, 200.0),
        Position::new(200.0, 800.0),
    ]
}

impl TrajectoryModel {
    pub fn new(config: &TrajectoryConfig, anchors: Vec<Position>, leg: Duration, loss: LossValues) -> Self {
        let path = if config.waypoints.len() >= 2 {
            config.waypoints.clone()
        } else {
            default_waypoints()
        };
        let leg = config.leg_ms.map(Duration::from_millis).unwrap_or(leg);
        Self {
            period: leg * path.len() as u32,
            path,
            anchors,
            propagation: config.propagation.clone(),
            loss,
        }
    }

    /// Position after `elapsed`, with the path repeated once per period.
    pub fn position_at(&self, elapsed: Duration) -> Position {
        let segments: Vec<(Position, Position, f64)> = (0..self.path.len())
            .map(|i| {
                let a = self.path[i];
                let b = self.path[(i + 1) % self.path.len()];
                (a, b, a.distance_to(&b))
            })
            .collect();
        let total: f64 = segments.iter().map(|s| s.2).sum();
        if total == 0.0 || self.period.is_zero() {
            return self.path[0];
        }
        let phase = (elapsed.as_secs_f64() % self.period.as_secs_f64()) / self.period.as_secs_f64();
        let mut travelled = phase * total;
        for (a, b, length) in &segments {
            if travelled <= *length {
                return a.lerp(b, if *length == 0.0 { 0.0 } else { travelled / length });
            }
            travelled -= length;
        }
        self.path[0]
    }

    /// Friis free-space received power in dBm.
    pub fn received_power(&self, distance_m: f64) -> f64 {
        let p = &self.propagation;
        let wavelength = SPEED_OF_LIGHT / (p.frequency_mhz * 1e6);
        let distance = distance_m.max(1.0);
        p.tx_power_dbm + p.tx_gain_dbi + p.rx_gain_dbi + 20.0 * (wavelength / (4.0 * PI * distance)).log10()
    }

    /// Position of `power_dbm` on the loss ramp: 0 at or below sensitivity,
    /// 1 at sensitivity + margin and above.
    fn ramp(&self, power_dbm: f64) -> f64 {
        let floor = self.propagation.sensitivity_dbm;
        let margin = self.propagation.margin_db;
        if power_dbm >= floor + margin {
            1.0
        } else if power_dbm < floor || margin <= 0.0 {
            0.0
        } else {
            (power_dbm - floor) / margin
        }
    }

    fn interpolate(&self, t: f64) -> f64 {
        if t >= 1.0 {
            self.loss.connected
        } else {
            self.loss.disconnected + (self.loss.connected - self.loss.disconnected) * t
        }
    }

    pub fn loss_for(&self, power_dbm: f64) -> f64 {
        self.interpolate(self.ramp(power_dbm))
    }
}

impl MobilityModel for TrajectoryModel {
    fn advance(&mut self, _tick: usize, elapsed: Duration) -> Transition {
        let here = self.position_at(elapsed);
        let powers: Vec<f64> = self
            .anchors
            .iter()
            .map(|anchor| self.received_power(here.distance_to(anchor)))
            .collect();
        let strongest = powers
            .iter()
            .enumerate()
            .fold(0, |best, (i, &p)| if p > powers[best] { i } else { best });
        let losses = powers
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let t = self.ramp(p);
                self.interpolate(if i == strongest { t } else { t.min(RUNNER_UP_CEILING) })
            })
            .collect();
        Transition::Shape { strongest, losses }
    }
}

/// Build the model selected by the configuration.
pub fn model_for(config: &ExperimentConfig, schedule: ConnectivitySchedule) -> Box<dyn MobilityModel> {
    match &config.mobility {
        MobilityPolicy::Handoff => Box::new(HandoffModel::new(schedule)),
        MobilityPolicy::Trajectory(trajectory) => Box::new(TrajectoryModel::new(
            trajectory,
            config.topology.anchor_positions(),
            schedule.dwell(),
            config.loss,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roam_lab_abstract::TopologyConfig;

    fn square() -> TrajectoryModel {
        TrajectoryModel::new(
            &TrajectoryConfig::default(),
            TopologyConfig::default().anchor_positions(),
            Duration::from_secs(30),
            LossValues::default(),
        )
    }

    #[test]
    fn test_path_is_closed_and_constant_speed() {
        let model = square();
        let near = |a: Position, b: Position| a.distance_to(&b) < 1e-6;
        assert!(near(model.position_at(Duration::ZERO), Position::new(400.0, 800.0)));
        // 2400 m of path over 150 s, so 16 m/s.
        assert!(near(model.position_at(Duration::from_secs(25)), Position::new(800.0, 800.0)));
        assert!(near(model.position_at(Duration::from_millis(81_250)), Position::new(500.0, 200.0)));
        assert!(near(model.position_at(Duration::from_secs(150)), Position::new(400.0, 800.0)));
    }

    #[test]
    fn test_loss_mapping_is_bounded() {
        let model = square();
        let loss = LossValues::default();
        assert_eq!(model.loss_for(model.received_power(0.0)), loss.connected);
        assert_eq!(model.loss_for(model.received_power(600.0)), loss.disconnected);
        let middle = model.loss_for(-67.0);
        assert!(middle > loss.connected && middle < loss.disconnected);
    }

    #[test]
    fn test_closest_anchor_is_connected() {
        let mut model = square();
        // At (800, 800) the mobile node sits on ap1.
        match model.advance(0, Duration::from_secs(25)) {
            Transition::Shape { strongest, losses } => {
                assert_eq!(strongest, 1);
                assert_eq!(losses[1], 1.0);
                assert_eq!(losses[3], 100.0);
            }
            other => panic!("unexpected transition {other:?}"),
        }
    }

    #[test]
    fn test_only_the_strongest_anchor_is_connected() {
        let anchors = vec![
            Position::new(400.0, 800.0),
            Position::new(450.0, 800.0),
            Position::new(800.0, 200.0),
            Position::new(200.0, 200.0),
        ];
        let mut model = TrajectoryModel::new(
            &TrajectoryConfig::default(),
            anchors,
            Duration::from_secs(30),
            LossValues::default(),
        );
        // Both ap0 and ap1 are well within range of (400, 800).
        assert_eq!(model.loss_for(model.received_power(50.0)), 1.0);
        match model.advance(0, Duration::ZERO) {
            Transition::Shape { strongest, losses } => {
                assert_eq!(strongest, 0);
                assert_eq!(losses[0], 1.0);
                assert!(losses[1] > 1.0 && losses[1] < 100.0, "{losses:?}");
                assert_eq!(losses.iter().filter(|&&l| l == 1.0).count(), 1);
            }
            other => panic!("unexpected transition {other:?}"),
        }
    }

    #[test]
    fn test_handoff_follows_schedule() {
        use rand::SeedableRng;
        let config = ExperimentConfig::default();
        let schedule = ConnectivitySchedule::round_robin(&config, &mut rand::rngs::StdRng::seed_from_u64(0));
        let mut model = model_for(&config, schedule);
        assert_eq!(model.advance(3, Duration::ZERO), Transition::Connect(0));
    }
}

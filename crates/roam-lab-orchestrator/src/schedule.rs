use rand::Rng;
use rand::rngs::StdRng;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use roam_lab_abstract::{
    ConfigError, ExperimentConfig, LinkId, LossValues, StartAnchor, TopologyProvider,
};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::LabError;
use crate::mobility::Transition;

/// Ordered dwell windows of one run: which anchor is connected during each
/// scheduling tick. Windows are back to back, `dwell` long each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivitySchedule {
    start: usize,
    anchors: Vec<usize>,
    dwell: Duration,
}

impl ConnectivitySchedule {
    /// Round-robin hand-off: tick `i` connects anchor `(start + skip + i) mod P`.
    /// A random start anchor is drawn from `rng`, so the schedule is a pure
    /// function of the configuration and the run seed.
    pub fn round_robin(config: &ExperimentConfig, rng: &mut StdRng) -> Self {
        let count = config.topology.anchors.max(1);
        let start = match config.schedule.start_anchor {
            StartAnchor::Fixed(k) => k % count,
            StartAnchor::Random => rng.random_range(0..count),
        };
        let anchors = (0..config.total_ticks())
            .map(|i| (start + config.schedule.initial_skip + i) % count)
            .collect();
        Self {
            start,
            anchors,
            dwell: config.effective_dwell(),
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn dwell(&self) -> Duration {
        self.dwell
    }

    /// Anchor of `tick`; ticks past the end keep the last anchor.
    pub fn anchor_at(&self, tick: usize) -> usize {
        self.anchors
            .get(tick)
            .or(self.anchors.last())
            .copied()
            .unwrap_or(self.start)
    }

    /// Time span of `tick`, measured from the start of ACTIVE.
    pub fn window(&self, tick: usize) -> Range<Duration> {
        let start = self.dwell * tick as u32;
        start..start + self.dwell
    }

    /// `(anchor, dwell)` pairs in tick order.
    pub fn windows(&self) -> impl Iterator<Item = (usize, Duration)> + '_ {
        self.anchors.iter().map(|&anchor| (anchor, self.dwell))
    }
}

/// Applies connectivity to the anchor links of the mobile node.
///
/// Every transition runs with the write side of `gate` held; the sampler
/// takes the read side around each retrieval, so no snapshot ever sees a
/// transition half applied.
pub struct ConnectivityScheduler {
    provider: Arc<dyn TopologyProvider>,
    links: Vec<LinkId>,
    loss: LossValues,
    gate: Arc<RwLock<()>>,
}

impl ConnectivityScheduler {
    pub fn new(
        provider: Arc<dyn TopologyProvider>,
        loss: LossValues,
        gate: Arc<RwLock<()>>,
    ) -> Result<Self, LabError> {
        let topology = provider.topology();
        let count = topology.anchors().len();
        if count == 0 {
            return Err(ConfigError::InvalidTopology("topology has no anchors".to_string()).into());
        }
        let links = (0..count)
            .map(|k| {
                topology.anchor_link(k).ok_or_else(|| {
                    ConfigError::InvalidTopology(format!("anchor {k} is not linked to the mobile node"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            provider,
            links,
            loss,
            gate,
        })
    }

    pub fn anchors(&self) -> usize {
        self.links.len()
    }

    pub fn gate(&self) -> Arc<RwLock<()>> {
        Arc::clone(&self.gate)
    }

    /// Connected loss on anchor `k`, disconnected loss on every other anchor.
    /// Always re-applied, even when `k` is already the connected anchor.
    pub async fn connect(&self, k: usize) -> Result<(), LabError> {
        if k >= self.links.len() {
            return Err(LabError::Range {
                index: k,
                anchors: self.links.len(),
            });
        }
        let losses = (0..self.links.len())
            .map(|i| {
                if i == k {
                    self.loss.connected
                } else {
                    self.loss.disconnected
                }
            })
            .collect();
        self.shape(losses).await
    }

    /// Apply one loss value per anchor link inside a single exclusive section.
    pub async fn shape(&self, losses: Vec<f64>) -> Result<(), LabError> {
        if losses.len() != self.links.len() {
            return Err(LabError::Range {
                index: losses.len(),
                anchors: self.links.len(),
            });
        }
        let _transition = self.gate.write().await;
        let provider = Arc::clone(&self.provider);
        let links = self.links.clone();
        tokio::task::spawn_blocking(move || {
            for (link, loss) in links.into_iter().zip(losses) {
                provider.set_loss(link, loss)?;
            }
            Ok::<_, std::io::Error>(())
        })
        .await
        .map_err(|e| LabError::provider("set_loss task", e))?
        .map_err(|e| LabError::provider("set_loss", e))
    }

    /// Carry out a mobility transition and return the anchor it connects.
    pub async fn apply(&self, transition: Transition) -> Result<usize, LabError> {
        match transition {
            Transition::Connect(k) => {
                self.connect(k).await?;
                debug!(anchor = k, "hand-off applied");
                Ok(k)
            }
            Transition::Shape { strongest, losses } => {
                self.shape(losses).await?;
                debug!(anchor = strongest, "trajectory step applied");
                Ok(strongest)
            }
        }
    }

    /// Loss currently set on each anchor link, in anchor order.
    pub async fn current(&self) -> Result<Vec<f64>, LabError> {
        let _view = self.gate.read().await;
        self.links
            .iter()
            .map(|&link| {
                self.provider
                    .loss(link)
                    .map_err(|e| LabError::provider("loss", e))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use roam_lab_abstract::{TopologyConfig, TopologySpec};
    use roam_lab_provider::EmulatedTopology;

    fn scheduler(anchors: usize) -> ConnectivityScheduler {
        let spec = TopologySpec::platoons(&TopologyConfig {
            anchors,
            participants_per_anchor: 1,
            ..Default::default()
        })
        .unwrap();
        ConnectivityScheduler::new(
            Arc::new(EmulatedTopology::new(spec)),
            LossValues::default(),
            Arc::new(RwLock::new(())),
        )
        .unwrap()
    }

    #[test]
    fn test_round_robin_sequence() {
        let config = ExperimentConfig::default();
        let schedule = ConnectivitySchedule::round_robin(&config, &mut StdRng::seed_from_u64(0));
        assert_eq!(schedule.len(), 17);
        let first: Vec<usize> = schedule.windows().take(9).map(|(a, _)| a).collect();
        assert_eq!(first, vec![1, 2, 3, 0, 1, 2, 3, 0, 1]);
        assert_eq!(schedule.anchor_at(100), schedule.anchor_at(16));
    }

    #[test]
    fn test_windows_partition_time() {
        let config = ExperimentConfig::default();
        let schedule = ConnectivitySchedule::round_robin(&config, &mut StdRng::seed_from_u64(0));
        for tick in 1..schedule.len() {
            assert_eq!(schedule.window(tick - 1).end, schedule.window(tick).start);
        }
        assert_eq!(schedule.window(0).start, Duration::ZERO);
        assert_eq!(schedule.window(16).end, Duration::from_secs(17 * 30));
    }

    #[test]
    fn test_random_start_follows_seed() {
        let mut config = ExperimentConfig::default();
        config.schedule.start_anchor = StartAnchor::Random;
        let a = ConnectivitySchedule::round_robin(&config, &mut StdRng::seed_from_u64(7));
        let b = ConnectivitySchedule::round_robin(&config, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert!(a.start() < 4);
    }

    #[tokio::test]
    async fn test_exactly_one_anchor_connected() {
        let loss = LossValues::default();
        for anchors in 1..=5 {
            let scheduler = scheduler(anchors);
            for k in [0, anchors - 1, anchors / 2, 0] {
                scheduler.connect(k).await.unwrap();
                let current = scheduler.current().await.unwrap();
                assert_eq!(current.iter().filter(|&&l| l == loss.connected).count(), 1);
                assert!(current
                    .iter()
                    .all(|&l| l == loss.connected || l == loss.disconnected));
                assert_eq!(current[k], loss.connected);
            }
        }
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_and_checks_range() {
        let scheduler = scheduler(4);
        scheduler.connect(2).await.unwrap();
        let once = scheduler.current().await.unwrap();
        scheduler.connect(2).await.unwrap();
        assert_eq!(scheduler.current().await.unwrap(), once);

        assert!(matches!(
            scheduler.connect(4).await,
            Err(LabError::Range { index: 4, anchors: 4 })
        ));
        assert_eq!(scheduler.current().await.unwrap(), once);
    }
}

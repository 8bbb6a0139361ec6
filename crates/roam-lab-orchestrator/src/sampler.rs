use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use roam_lab_abstract::{CommandOutput, NodeHandle, TopologyProvider};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::LabError;

/// Which of the two per-node reports a snapshot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// Workload/protocol-level state.
    Status,
    /// Interface/connectivity-level state.
    Interface,
}

impl ReportKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportKind::Status => "status",
            ReportKind::Interface => "ifconfig",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub run: usize,
    pub node: String,
    pub phase: String,
    pub kind: ReportKind,
    pub elapsed_ms: u64,
    pub payload: String,
}

/// Result of one sampling pass over every node.
#[derive(Debug, Default)]
pub struct SamplePass {
    pub snapshots: Vec<StatusSnapshot>,
    /// Nodes that produced nothing this pass, with the reason.
    pub gaps: Vec<LabError>,
}

/// `report-<phase>-<node>.<ext>` inside the run directory.
pub fn report_path(run_dir: &Path, phase: &str, node: &str, kind: ReportKind) -> PathBuf {
    run_dir.join(format!("report-{phase}-{node}.{}", kind.extension()))
}

async fn append_block(path: &Path, elapsed_ms: u64, payload: &str) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let block = format!("EVAL_TIME=={elapsed_ms}\n{payload}");
    file.write_all(block.as_bytes()).await?;
    file.flush().await
}

/// Captures time-tagged status reports of every node in one run.
pub struct StatusSampler {
    provider: Arc<dyn TopologyProvider>,
    run: usize,
    run_dir: PathBuf,
    nodes: Vec<NodeHandle>,
    status_command: Option<Vec<String>>,
    interface_command: Vec<String>,
    node_timeout: Duration,
    gate: Arc<RwLock<()>>,
    last_elapsed: Mutex<HashMap<String, u64>>,
}

impl StatusSampler {
    pub fn new(
        provider: Arc<dyn TopologyProvider>,
        run: usize,
        run_dir: impl Into<PathBuf>,
        status_command: Option<Vec<String>>,
        interface_command: Vec<String>,
        node_timeout: Duration,
        gate: Arc<RwLock<()>>,
    ) -> Self {
        let nodes = provider
            .topology()
            .nodes()
            .iter()
            .filter_map(|n| provider.resolve(&n.name))
            .collect();
        Self {
            provider,
            run,
            run_dir: run_dir.into(),
            nodes,
            status_command,
            interface_command,
            node_timeout,
            gate,
            last_elapsed: Mutex::new(HashMap::new()),
        }
    }

    /// Take one snapshot of every node and append it to the `phase` logs.
    ///
    /// Nodes are queried concurrently, each bounded by the node timeout. A
    /// node that does not answer in time is reported as a gap and the pass
    /// goes on without it. `elapsed` is the run-relative time of the pass;
    /// timestamps never go backwards for a node even if it does.
    pub async fn sample(&self, phase: &str, elapsed: Duration) -> SamplePass {
        let elapsed_ms = elapsed.as_millis() as u64;
        let mut tasks = JoinSet::new();
        for node in &self.nodes {
            let provider = Arc::clone(&self.provider);
            let gate = Arc::clone(&self.gate);
            let node = node.clone();
            let status = self.status_command.clone();
            let interface = self.interface_command.clone();
            let timeout = self.node_timeout;
            tasks.spawn(async move {
                let name = node.name.clone();
                let _view = gate.read_owned().await;
                let query = tokio::task::spawn_blocking(move || {
                    let status = status.map(|cmd| provider.execute(&node, &cmd));
                    let interface = provider.execute(&node, &interface);
                    (status, interface)
                });
                let outcome = tokio::time::timeout(timeout, query).await;
                (name, outcome)
            });
        }

        let mut pass = SamplePass::default();
        let mut answers = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (node, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    pass.gaps.push(LabError::provider("sample task", e));
                    continue;
                }
            };
            match outcome {
                Err(_) => {
                    warn!(node = %node, phase, "status retrieval timed out");
                    pass.gaps.push(LabError::CommandTimeout {
                        node,
                        operation: format!("{phase} status report"),
                        timeout: self.node_timeout,
                    });
                }
                Ok(Err(e)) => pass.gaps.push(LabError::provider(&node, e)),
                Ok(Ok((status, interface))) => answers.push((node, status, interface)),
            }
        }
        answers.sort_by(|a, b| a.0.cmp(&b.0));

        for (node, status, interface) in answers {
            let stamp = self.stamp(&node, elapsed_ms);
            let reports = status
                .map(|s| (ReportKind::Status, s))
                .into_iter()
                .chain([(ReportKind::Interface, interface)]);
            for (kind, output) in reports {
                match output {
                    Ok(output) => match self.record(&node, phase, kind, stamp, output).await {
                        Ok(snapshot) => pass.snapshots.push(snapshot),
                        Err(e) => pass.gaps.push(e),
                    },
                    Err(e) => pass.gaps.push(LabError::provider(&node, e)),
                }
            }
        }
        debug!(
            run = self.run,
            phase,
            elapsed_ms,
            snapshots = pass.snapshots.len(),
            gaps = pass.gaps.len(),
            "sampling pass done"
        );
        pass
    }

    fn stamp(&self, node: &str, elapsed_ms: u64) -> u64 {
        let mut last = self
            .last_elapsed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = last.entry(node.to_string()).or_insert(0);
        *slot = (*slot).max(elapsed_ms);
        *slot
    }

    async fn record(
        &self,
        node: &str,
        phase: &str,
        kind: ReportKind,
        elapsed_ms: u64,
        output: CommandOutput,
    ) -> Result<StatusSnapshot, LabError> {
        if !output.success() {
            debug!(node, ?kind, code = output.exit_code, "report command failed");
        }
        let path = report_path(&self.run_dir, phase, node, kind);
        append_block(&path, elapsed_ms, &output.stdout).await?;
        Ok(StatusSnapshot {
            run: self.run,
            node: node.to_string(),
            phase: phase.to_string(),
            kind,
            elapsed_ms,
            payload: output.stdout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roam_lab_abstract::{TopologyConfig, TopologySpec};
    use roam_lab_provider::EmulatedTopology;

    fn setup(name: &str, status: bool) -> (Arc<EmulatedTopology>, StatusSampler, PathBuf) {
        let spec = TopologySpec::platoons(&TopologyConfig {
            anchors: 2,
            participants_per_anchor: 1,
            ..Default::default()
        })
        .unwrap();
        let topo = Arc::new(EmulatedTopology::new(spec));
        let dir = std::env::temp_dir().join(format!("roam-lab-sampler-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let status = status.then(|| vec!["nfdc".to_string(), "status".to_string(), "report".to_string()]);
        let sampler = StatusSampler::new(
            topo.clone(),
            0,
            &dir,
            status,
            vec!["ifconfig".to_string()],
            Duration::from_millis(100),
            Arc::new(RwLock::new(())),
        );
        (topo, sampler, dir)
    }

    #[tokio::test]
    async fn test_blocks_are_appended_with_elapsed_time() {
        let (_topo, sampler, dir) = setup("append", true);
        let first = sampler.sample("eval", Duration::from_millis(500)).await;
        assert!(first.gaps.is_empty());
        // 5 nodes, two reports each.
        assert_eq!(first.snapshots.len(), 10);
        sampler.sample("eval", Duration::from_millis(1000)).await;

        let log = std::fs::read_to_string(report_path(&dir, "eval", "uav", ReportKind::Interface)).unwrap();
        let stamps: Vec<&str> = log.lines().filter(|l| l.starts_with("EVAL_TIME==")).collect();
        assert_eq!(stamps, vec!["EVAL_TIME==500", "EVAL_TIME==1000"]);
        assert!(report_path(&dir, "eval", "ap1", ReportKind::Status).exists());
    }

    #[tokio::test]
    async fn test_timestamps_never_decrease() {
        let (_topo, sampler, _dir) = setup("monotonic", false);
        sampler.sample("eval", Duration::from_millis(900)).await;
        let pass = sampler.sample("eval", Duration::from_millis(400)).await;
        assert!(pass.snapshots.iter().all(|s| s.elapsed_ms == 900));
        assert!(pass.snapshots.iter().all(|s| s.kind == ReportKind::Interface));
    }

    #[tokio::test]
    async fn test_stalled_node_is_a_gap() {
        let (topo, sampler, dir) = setup("stall", false);
        topo.stall("ap0", Duration::from_millis(400));
        let started = std::time::Instant::now();
        let pass = sampler.sample("eval", Duration::ZERO).await;

        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(pass.gaps.len(), 1);
        assert!(matches!(&pass.gaps[0], LabError::CommandTimeout { node, .. } if node == "ap0"));
        assert_eq!(pass.snapshots.len(), 4);
        assert!(!report_path(&dir, "eval", "ap0", ReportKind::Interface).exists());
        assert!(report_path(&dir, "eval", "ap1", ReportKind::Interface).exists());
    }
}

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use roam_lab_abstract::{
    ConfigError, ExitState, LifecycleConfig, NodeHandle, ProcessSpec, StopSignal, TopologyProvider,
    WorkerProcess,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::LabError;

const EXIT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    /// Per-node forwarder, started during WARMUP.
    Daemon,
    Participant,
    Mobile,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Daemon => "daemon",
            WorkerRole::Participant => "participant",
            WorkerRole::Mobile => "mobile",
        }
    }

    /// Roles that run the workload under test.
    pub fn is_worker(&self) -> bool {
        !matches!(self, WorkerRole::Daemon)
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `start` hands back: enough to find the process and its logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchRecord {
    pub node: String,
    pub role: WorkerRole,
    pub identity: String,
    pub pid: Option<u32>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

struct ProcessHandle {
    record: LaunchRecord,
    process: Box<dyn WorkerProcess>,
}

impl ProcessHandle {
    fn exited(&mut self) -> Option<ExitState> {
        match self.process.try_wait() {
            Ok(state) => state,
            Err(e) => {
                warn!(node = %self.record.node, "cannot query {}: {e}", self.record.identity);
                None
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopSummary {
    /// Processes that exited after the interrupt.
    pub stopped: usize,
    /// Survivors of the grace period, killed by identity.
    pub forced: Vec<(String, WorkerRole)>,
}

type HandleKey = (String, WorkerRole);

/// A spawn that was still running when its launch timed out.
struct LateLaunch {
    record: LaunchRecord,
    job: JoinHandle<std::io::Result<Box<dyn WorkerProcess>>>,
}

/// Owns every worker process of one run.
///
/// At most one live process exists per (node, role). Starts on the same node
/// are serialized; starts on different nodes may run concurrently.
pub struct ProcessManager {
    provider: Arc<dyn TopologyProvider>,
    run_dir: PathBuf,
    launch_timeout: Duration,
    grace_period: Duration,
    handles: Mutex<BTreeMap<HandleKey, ProcessHandle>>,
    late: Mutex<Vec<LateLaunch>>,
    node_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProcessManager {
    pub fn new(provider: Arc<dyn TopologyProvider>, run_dir: impl Into<PathBuf>, lifecycle: &LifecycleConfig) -> Self {
        Self {
            provider,
            run_dir: run_dir.into(),
            launch_timeout: Duration::from_millis(lifecycle.launch_timeout_ms),
            grace_period: Duration::from_millis(lifecycle.grace_period_ms),
            handles: Mutex::new(BTreeMap::new()),
            late: Mutex::new(Vec::new()),
            node_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// `<run dir>/stdout/<node>.<role>.log` and the matching stderr path.
    pub fn log_paths(&self, node: &str, role: WorkerRole) -> (PathBuf, PathBuf) {
        let file = format!("{node}.{role}.log");
        (
            self.run_dir.join("stdout").join(&file),
            self.run_dir.join("stderr").join(file),
        )
    }

    fn node_lock(&self, node: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(lock(&self.node_locks).entry(node.to_string()).or_default())
    }

    pub async fn start(
        &self,
        node: &str,
        role: WorkerRole,
        program: Option<&Path>,
        args: Vec<String>,
    ) -> Result<LaunchRecord, LabError> {
        let program = program.ok_or(ConfigError::MissingExecutable(role.as_str()))?;
        let program = self
            .provider
            .resolve_executable(program)
            .ok_or_else(|| ConfigError::UnresolvableExecutable(program.to_path_buf()))?;
        let handle: NodeHandle = self
            .provider
            .resolve(node)
            .ok_or_else(|| ConfigError::UnknownNode(node.to_string()))?;

        let node_lock = self.node_lock(node);
        let _serial = node_lock.lock().await;

        let key = (node.to_string(), role);
        {
            let mut handles = lock(&self.handles);
            if let Some(existing) = handles.get_mut(&key) {
                if existing.exited().is_none() {
                    return Err(LabError::AlreadyRunning {
                        node: node.to_string(),
                        role,
                    });
                }
                handles.remove(&key);
            }
        }

        let (stdout, stderr) = self.log_paths(node, role);
        let spec = ProcessSpec {
            program,
            args,
            stdout,
            stderr,
        };
        let mut record = LaunchRecord {
            node: node.to_string(),
            role,
            identity: spec.identity(),
            pid: None,
            stdout: spec.stdout.clone(),
            stderr: spec.stderr.clone(),
        };
        let launch_error = |reason: String| LabError::Launch {
            node: node.to_string(),
            role,
            reason,
        };

        let provider = Arc::clone(&self.provider);
        let mut job = tokio::task::spawn_blocking(move || {
            for path in [&spec.stdout, &spec.stderr] {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
            }
            provider.spawn(&handle, &spec)
        });
        let spawned = match tokio::time::timeout(self.launch_timeout, &mut job).await {
            Ok(joined) => joined
                .map_err(|e| launch_error(e.to_string()))?
                .map_err(|e| launch_error(e.to_string()))?,
            Err(_) => {
                // The spawn may still succeed; keep it so teardown can stop it.
                lock(&self.late).push(LateLaunch { record, job });
                return Err(launch_error(format!(
                    "no answer within {:?}",
                    self.launch_timeout
                )));
            }
        };

        record.pid = spawned.pid();
        debug!(node, %role, pid = ?record.pid, "started {}", record.identity);
        lock(&self.handles).insert(
            key,
            ProcessHandle {
                record: record.clone(),
                process: spawned,
            },
        );
        Ok(record)
    }

    /// Identities of the live processes matching `predicate`, deduplicated.
    fn identities(&self, predicate: impl Fn(&str, WorkerRole) -> bool) -> BTreeSet<String> {
        lock(&self.handles)
            .iter()
            .filter(|((node, role), _)| predicate(node.as_str(), *role))
            .map(|(_, h)| h.record.identity.clone())
            .collect()
    }

    async fn signal_identities(&self, identities: BTreeSet<String>, signal: StopSignal) -> Result<usize, LabError> {
        if identities.is_empty() {
            return Ok(0);
        }
        let provider = Arc::clone(&self.provider);
        tokio::task::spawn_blocking(move || {
            identities
                .iter()
                .map(|identity| provider.signal_identity(identity, signal))
                .sum::<std::io::Result<usize>>()
        })
        .await
        .map_err(|e| LabError::provider("signal task", e))?
        .map_err(|e| LabError::provider("signal_identity", e))
    }

    /// Send `signal` to the process groups of matching handles without
    /// forgetting them. Used for the drain signal.
    pub async fn signal(
        &self,
        predicate: impl Fn(&str, WorkerRole) -> bool,
        signal: StopSignal,
    ) -> Result<usize, LabError> {
        let identities = self.identities(predicate);
        let matched = self.signal_identities(identities, signal).await?;
        info!(matched, ?signal, "signalled workers");
        Ok(matched)
    }

    /// Interrupt matching processes, wait up to the grace period, then kill
    /// the survivors by identity. Finding nothing to stop is not an error.
    pub async fn stop_all(&self, predicate: impl Fn(&str, WorkerRole) -> bool) -> Result<StopSummary, LabError> {
        let mut taken: Vec<ProcessHandle> = {
            let mut handles = lock(&self.handles);
            let keys: Vec<HandleKey> = handles
                .keys()
                .filter(|(node, role)| predicate(node.as_str(), *role))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| handles.remove(k)).collect()
        };
        if taken.is_empty() {
            return Ok(StopSummary::default());
        }

        let identities: BTreeSet<String> = taken.iter().map(|h| h.record.identity.clone()).collect();
        if let Err(e) = self.signal_identities(identities, StopSignal::Interrupt).await {
            warn!("interrupt failed, escalating: {e}");
        }

        let deadline = Instant::now() + self.grace_period;
        loop {
            if taken.iter_mut().all(|h| h.exited().is_some()) || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(EXIT_POLL.min(self.grace_period)).await;
        }

        let mut summary = StopSummary::default();
        let mut survivors = Vec::new();
        for mut handle in taken {
            if handle.exited().is_some() {
                summary.stopped += 1;
            } else {
                survivors.push(handle);
            }
        }
        if survivors.is_empty() {
            return Ok(summary);
        }

        let identities: BTreeSet<String> = survivors.iter().map(|h| h.record.identity.clone()).collect();
        if let Err(e) = self.signal_identities(identities, StopSignal::Kill).await {
            warn!("kill by identity failed: {e}");
        }
        for mut handle in survivors {
            if handle.exited().is_none()
                && let Err(e) = handle.process.kill()
            {
                warn!(node = %handle.record.node, "kill of {} failed: {e}", handle.record.identity);
            }
            warn!(
                node = %handle.record.node,
                role = %handle.record.role,
                "{} ignored the interrupt and was killed",
                handle.record.identity
            );
            summary.forced.push((handle.record.node, handle.record.role));
        }
        Ok(summary)
    }

    /// Forget handles whose process exited on its own and report them.
    pub fn reap(&self) -> Vec<(LaunchRecord, ExitState)> {
        let mut handles = lock(&self.handles);
        let exited: Vec<(HandleKey, ExitState)> = handles
            .iter_mut()
            .filter_map(|(key, h)| h.exited().map(|state| (key.clone(), state)))
            .collect();
        exited
            .into_iter()
            .filter_map(|(key, state)| handles.remove(&key).map(|h| (h.record, state)))
            .collect()
    }

    /// Number of handles whose process is still running, plus launches
    /// whose outcome is still unknown.
    pub fn live(&self) -> usize {
        let running = lock(&self.handles)
            .values_mut()
            .filter_map(|h| h.exited().is_none().then_some(()))
            .count();
        running + lock(&self.late).len()
    }

    /// Wait for launches that outlived their timeout and take over whatever
    /// they started, so that `stop_all` covers it.
    pub async fn adopt_late_launches(&self) -> Vec<LaunchRecord> {
        let late = std::mem::take(&mut *lock(&self.late));
        let bound = self.launch_timeout + self.grace_period;
        let mut adopted = Vec::new();
        for LateLaunch { mut record, mut job } in late {
            let mut process = match tokio::time::timeout(bound, &mut job).await {
                Ok(Ok(Ok(process))) => process,
                Ok(Ok(Err(e))) => {
                    debug!(node = %record.node, "late launch of {} failed: {e}", record.identity);
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(node = %record.node, "late launch of {} panicked: {e}", record.identity);
                    continue;
                }
                Err(_) => {
                    warn!(node = %record.node, "launch of {} still pending", record.identity);
                    lock(&self.late).push(LateLaunch { record, job });
                    continue;
                }
            };
            record.pid = process.pid();
            let key = (record.node.clone(), record.role);
            let mut handles = lock(&self.handles);
            if handles.contains_key(&key) {
                if let Err(e) = process.kill() {
                    warn!(node = %record.node, "kill of duplicate {} failed: {e}", record.identity);
                }
                continue;
            }
            warn!(node = %record.node, pid = ?record.pid, "adopted late launch of {}", record.identity);
            handles.insert(
                key,
                ProcessHandle {
                    record: record.clone(),
                    process,
                },
            );
            adopted.push(record);
        }
        adopted
    }

    /// Kill every process of `identities`, tracked or not.
    pub async fn sweep(&self, identities: BTreeSet<String>) -> Result<usize, LabError> {
        let killed = self.signal_identities(identities, StopSignal::Kill).await?;
        if killed > 0 {
            warn!(killed, "killed stray worker processes");
        }
        Ok(killed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roam_lab_abstract::{TopologyConfig, TopologySpec};
    use roam_lab_provider::EmulatedTopology;

    fn setup(name: &str) -> (Arc<EmulatedTopology>, ProcessManager) {
        let spec = TopologySpec::platoons(&TopologyConfig {
            anchors: 2,
            participants_per_anchor: 2,
            ..Default::default()
        })
        .unwrap();
        let topo = Arc::new(EmulatedTopology::new(spec));
        let dir = std::env::temp_dir().join(format!("roam-lab-lifecycle-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let lifecycle = LifecycleConfig {
            grace_period_ms: 30,
            ..Default::default()
        };
        let manager = ProcessManager::new(topo.clone(), dir, &lifecycle);
        (topo, manager)
    }

    fn worker() -> Option<&'static Path> {
        Some(Path::new("/opt/lab/SVSClient"))
    }

    #[tokio::test]
    async fn test_start_redirects_logs_deterministically() {
        let (_topo, manager) = setup("logs");
        let record = manager
            .start("unit_1_0", WorkerRole::Participant, worker(), vec!["x".to_string()])
            .await
            .unwrap();
        assert_eq!(record.identity, "SVSClient");
        assert_eq!(record.stdout, manager.run_dir().join("stdout/unit_1_0.participant.log"));
        assert_eq!(record.stderr, manager.run_dir().join("stderr/unit_1_0.participant.log"));
        assert!(record.stdout.exists());
        assert_eq!(manager.live(), 1);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_alive() {
        let (_topo, manager) = setup("twice");
        manager.start("uav", WorkerRole::Mobile, worker(), vec![]).await.unwrap();
        assert!(matches!(
            manager.start("uav", WorkerRole::Mobile, worker(), vec![]).await,
            Err(LabError::AlreadyRunning { role: WorkerRole::Mobile, .. })
        ));
        // A different role on the same node is fine.
        manager.start("uav", WorkerRole::Daemon, Some(Path::new("nfd")), vec![]).await.unwrap();
        assert_eq!(manager.live(), 2);
    }

    #[tokio::test]
    async fn test_configuration_errors() {
        let (topo, manager) = setup("config");
        assert!(matches!(
            manager.start("uav", WorkerRole::Mobile, None, vec![]).await,
            Err(LabError::Configuration(ConfigError::MissingExecutable("mobile")))
        ));
        topo.mark_missing("/opt/lab/SVSClient");
        assert!(matches!(
            manager.start("unit_0_0", WorkerRole::Participant, worker(), vec![]).await,
            Err(LabError::Configuration(ConfigError::UnresolvableExecutable(_)))
        ));
    }

    #[tokio::test]
    async fn test_launch_failure_is_reported() {
        let (topo, manager) = setup("launch");
        topo.fail_launches("unit_0_1", 1);
        assert!(matches!(
            manager.start("unit_0_1", WorkerRole::Participant, worker(), vec![]).await,
            Err(LabError::Launch { .. })
        ));
        assert_eq!(manager.live(), 0);
        manager.start("unit_0_1", WorkerRole::Participant, worker(), vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn test_timed_out_launch_is_adopted_and_stopped() {
        let (topo, _) = setup("late");
        topo.slow_launches("uav", Duration::from_millis(150));
        topo.exit_after_interrupts("SVSClient", 1);
        let lifecycle = LifecycleConfig {
            launch_timeout_ms: 50,
            grace_period_ms: 30,
            ..Default::default()
        };
        let dir = std::env::temp_dir().join(format!("roam-lab-lifecycle-late-{}", std::process::id()));
        let manager = ProcessManager::new(topo.clone(), dir, &lifecycle);

        assert!(matches!(
            manager.start("uav", WorkerRole::Mobile, worker(), vec![]).await,
            Err(LabError::Launch { role: WorkerRole::Mobile, .. })
        ));
        // Outcome unknown: still counted until teardown settles it.
        assert_eq!(manager.live(), 1);

        let adopted = manager.adopt_late_launches().await;
        assert_eq!(adopted.len(), 1);
        assert_eq!(adopted[0].node, "uav");
        assert!(adopted[0].pid.is_some());
        assert_eq!(topo.live_processes(), 1);

        let summary = manager.stop_all(|_, _| true).await.unwrap();
        assert_eq!(summary.stopped, 1);
        assert_eq!(manager.live(), 0);
        assert_eq!(topo.live_processes(), 0);
        assert!(manager.adopt_late_launches().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_all_escalates_to_kill() {
        let (topo, manager) = setup("stop");
        topo.exit_after_interrupts("SVSClient", 0);
        for node in ["unit_0_0", "unit_1_1"] {
            manager.start(node, WorkerRole::Participant, worker(), vec![]).await.unwrap();
        }
        manager.start("uav", WorkerRole::Mobile, Some(Path::new("/opt/lab/SVSUAV")), vec![]).await.unwrap();

        let summary = manager.stop_all(|_, role| role == WorkerRole::Participant).await.unwrap();
        assert_eq!(summary.stopped, 0);
        assert_eq!(summary.forced.len(), 2);
        assert_eq!(manager.live(), 1);

        // The mobile worker exits on its second interrupt.
        manager.signal(|_, role| role.is_worker(), StopSignal::Interrupt).await.unwrap();
        let summary = manager.stop_all(|_, _| true).await.unwrap();
        assert_eq!(summary.stopped, 1);
        assert!(summary.forced.is_empty());
        assert_eq!(topo.live_processes(), 0);

        assert_eq!(manager.stop_all(|_, _| true).await.unwrap(), StopSummary::default());
    }

    #[tokio::test]
    async fn test_reap_reports_crashes() {
        let (topo, manager) = setup("reap");
        manager.start("unit_0_0", WorkerRole::Participant, worker(), vec![]).await.unwrap();
        assert!(manager.reap().is_empty());

        topo.crash_after_queries("unit_0_0", 1);
        let node = topo.resolve("unit_0_0").unwrap();
        topo.execute(&node, &["ifconfig".to_string()]).unwrap();

        let crashed = manager.reap();
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0].0.node, "unit_0_0");
        assert_eq!(crashed[0].1.code, Some(roam_lab_provider::emulated::CRASH_EXIT_CODE));
        assert_eq!(manager.live(), 0);
    }
}

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use roam_lab_abstract::{
    CommandOutput, ExitState, LinkId, NodeHandle, ProcessSpec, StopSignal, TopologyProvider,
    TopologySpec, WorkerProcess,
};
use tracing::debug;

/// Exit code reported by processes killed through a scripted crash.
pub const CRASH_EXIT_CODE: i32 = 139;

#[derive(Debug, Clone)]
struct ProcessEntry {
    node: String,
    identity: String,
    args: Vec<String>,
    interrupts: u32,
    exit: Option<ExitState>,
}

#[derive(Default)]
struct ProcessTable {
    next_pid: u32,
    entries: HashMap<u32, ProcessEntry>,
    /// Interrupts needed before a process of this identity exits. Missing
    /// identities use the worker default of two (stop publishing, then exit).
    interrupts_to_exit: HashMap<String, u32>,
}

impl ProcessTable {
    fn deliver(&mut self, pid: u32, signal: StopSignal) -> bool {
        let Some(entry) = self.entries.get_mut(&pid) else {
            return false;
        };
        if entry.exit.is_some() {
            return false;
        }
        let threshold = self
            .interrupts_to_exit
            .get(&entry.identity)
            .copied()
            .unwrap_or(2);
        match signal {
            StopSignal::Kill => entry.exit = Some(ExitState { code: None }),
            StopSignal::Interrupt => {
                entry.interrupts += 1;
                if threshold > 0 && entry.interrupts >= threshold {
                    entry.exit = Some(ExitState { code: Some(0) });
                }
            }
        }
        true
    }
}

#[derive(Default)]
struct Faults {
    launch_failures: HashMap<String, usize>,
    launch_delays: HashMap<String, Duration>,
    crash_after_queries: HashMap<String, usize>,
    stalls: HashMap<String, Duration>,
    missing_executables: HashSet<PathBuf>,
}

struct NetworkState {
    loss: Vec<f64>,
    executed: Vec<(String, Vec<String>)>,
    queries: HashMap<String, usize>,
    faults: Faults,
}

/// In-memory stand-in for an emulated network. Links hold loss values,
/// commands return synthetic text and processes live in a table. Faults can
/// be scripted per node to exercise the orchestrator's failure paths.
pub struct EmulatedTopology {
    spec: TopologySpec,
    state: Mutex<NetworkState>,
    processes: Arc<Mutex<ProcessTable>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EmulatedTopology {
    pub fn new(spec: TopologySpec) -> Self {
        let links = spec.links().len();
        Self {
            spec,
            state: Mutex::new(NetworkState {
                loss: vec![0.0; links],
                executed: Vec::new(),
                queries: HashMap::new(),
                faults: Faults::default(),
            }),
            processes: Arc::new(Mutex::new(ProcessTable {
                next_pid: 1000,
                ..Default::default()
            })),
        }
    }

    /// Make the next `count` launches on `node` fail.
    pub fn fail_launches(&self, node: &str, count: usize) {
        lock(&self.state)
            .faults
            .launch_failures
            .insert(node.to_string(), count);
    }

    /// Every launch on `node` blocks for `delay` before the process exists.
    pub fn slow_launches(&self, node: &str, delay: Duration) {
        lock(&self.state)
            .faults
            .launch_delays
            .insert(node.to_string(), delay);
    }

    /// After `queries` more commands on `node`, every process there dies.
    pub fn crash_after_queries(&self, node: &str, queries: usize) {
        lock(&self.state)
            .faults
            .crash_after_queries
            .insert(node.to_string(), queries);
    }

    /// Every command on `node` blocks for `delay` before answering.
    pub fn stall(&self, node: &str, delay: Duration) {
        lock(&self.state)
            .faults
            .stalls
            .insert(node.to_string(), delay);
    }

    pub fn mark_missing(&self, program: impl Into<PathBuf>) {
        lock(&self.state)
            .faults
            .missing_executables
            .insert(program.into());
    }

    /// Number of interrupts a process of `identity` needs before it exits.
    /// Zero means it ignores interrupts altogether.
    pub fn exit_after_interrupts(&self, identity: &str, interrupts: u32) {
        lock(&self.processes)
            .interrupts_to_exit
            .insert(identity.to_string(), interrupts);
    }

    /// Every command executed so far, as (node, argv).
    pub fn executed(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.state).executed.clone()
    }

    pub fn live_processes(&self) -> usize {
        lock(&self.processes)
            .entries
            .values()
            .filter(|e| e.exit.is_none())
            .count()
    }

    /// Launch arguments of every process ever started on `node`, oldest first.
    pub fn launches_on(&self, node: &str) -> Vec<Vec<String>> {
        let table = lock(&self.processes);
        let mut pids: Vec<_> = table
            .entries
            .iter()
            .filter(|(_, e)| e.node == node)
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids.iter().map(|pid| table.entries[pid].args.clone()).collect()
    }

    /// Interrupts received by live or dead processes on `node`.
    pub fn interrupts_on(&self, node: &str) -> u32 {
        lock(&self.processes)
            .entries
            .values()
            .filter(|e| e.node == node)
            .map(|e| e.interrupts)
            .sum()
    }

    fn crash_node(&self, node: &str) {
        let mut table = lock(&self.processes);
        for entry in table.entries.values_mut() {
            if entry.node == node && entry.exit.is_none() {
                debug!("emulated crash of {} on {}", entry.identity, node);
                entry.exit = Some(ExitState {
                    code: Some(CRASH_EXIT_CODE),
                });
            }
        }
    }

    fn interface_report(&self, node: &str, loss: &[f64]) -> String {
        let mut out = String::new();
        for link in self.spec.links() {
            let (ifname, side) = if link.a == node {
                (format!("{}-eth{}", node, link.id.0), 1)
            } else if link.b == node {
                (format!("{}-eth{}", node, link.id.0), 2)
            } else {
                continue;
            };
            out.push_str(&format!(
                "{ifname}: flags=4163<UP,BROADCAST,RUNNING,MULTICAST>\n        inet 10.0.{}.{side}  netmask 255.255.255.0\n        loss {:.1}%\n",
                link.id.0, loss[link.id.0]
            ));
        }
        out
    }
}

impl TopologyProvider for EmulatedTopology {
    fn topology(&self) -> &TopologySpec {
        &self.spec
    }

    fn resolve(&self, name: &str) -> Option<NodeHandle> {
        self.spec.node(name).map(|n| NodeHandle {
            name: n.name.clone(),
            role: n.role,
        })
    }

    fn execute(&self, node: &NodeHandle, command: &[String]) -> io::Result<CommandOutput> {
        let (stall, crash, loss, count) = {
            let mut state = lock(&self.state);
            state.executed.push((node.name.clone(), command.to_vec()));
            let count = {
                let c = state.queries.entry(node.name.clone()).or_default();
                *c += 1;
                *c
            };
            let crash = match state.faults.crash_after_queries.get_mut(&node.name) {
                Some(0) => false,
                Some(remaining) => {
                    *remaining -= 1;
                    *remaining == 0
                }
                None => false,
            };
            let stall = state.faults.stalls.get(&node.name).copied();
            (stall, crash, state.loss.clone(), count)
        };
        if let Some(delay) = stall {
            std::thread::sleep(delay);
        }
        if crash {
            self.crash_node(&node.name);
        }

        let stdout = match command.first().map(String::as_str) {
            Some("ifconfig") => self.interface_report(&node.name, &loss),
            Some("nfdc") if command.get(1).map(String::as_str) == Some("status") => format!(
                "General NFD status:\n       nfdId={}\n     nQueries={}\n",
                node.name, count
            ),
            _ => String::new(),
        };
        Ok(CommandOutput {
            stdout,
            exit_code: 0,
        })
    }

    fn set_loss(&self, link: LinkId, percent: f64) -> io::Result<()> {
        let mut state = lock(&self.state);
        let slot = state
            .loss
            .get_mut(link.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no link {}", link.0)))?;
        *slot = percent;
        Ok(())
    }

    fn loss(&self, link: LinkId) -> io::Result<f64> {
        lock(&self.state)
            .loss
            .get(link.0)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no link {}", link.0)))
    }

    fn spawn(&self, node: &NodeHandle, spec: &ProcessSpec) -> io::Result<Box<dyn WorkerProcess>> {
        let delay = {
            let mut state = lock(&self.state);
            if let Some(remaining) = state.faults.launch_failures.get_mut(&node.name)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(io::Error::other(format!(
                    "emulated launch failure for {} on {}",
                    spec.identity(),
                    node.name
                )));
            }
            state.faults.launch_delays.get(&node.name).copied()
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        for path in [&spec.stdout, &spec.stderr] {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::File::create(path)?;
        }

        let mut table = lock(&self.processes);
        table.next_pid += 1;
        let pid = table.next_pid;
        table.entries.insert(
            pid,
            ProcessEntry {
                node: node.name.clone(),
                identity: spec.identity(),
                args: spec.args.clone(),
                interrupts: 0,
                exit: None,
            },
        );
        Ok(Box::new(EmulatedProcess {
            pid,
            table: Arc::clone(&self.processes),
        }))
    }

    fn signal_identity(&self, identity: &str, signal: StopSignal) -> io::Result<usize> {
        let mut table = lock(&self.processes);
        let pids: Vec<u32> = table
            .entries
            .iter()
            .filter(|(_, e)| e.identity == identity && e.exit.is_none())
            .map(|(pid, _)| *pid)
            .collect();
        for pid in &pids {
            table.deliver(*pid, signal);
        }
        Ok(pids.len())
    }

    fn addresses(&self, node: &NodeHandle) -> io::Result<Vec<String>> {
        Ok(self
            .spec
            .links()
            .iter()
            .filter_map(|link| {
                if link.a == node.name {
                    Some(format!("10.0.{}.1", link.id.0))
                } else if link.b == node.name {
                    Some(format!("10.0.{}.2", link.id.0))
                } else {
                    None
                }
            })
            .collect())
    }

    fn resolve_executable(&self, program: &Path) -> Option<PathBuf> {
        let state = lock(&self.state);
        (!program.as_os_str().is_empty() && !state.faults.missing_executables.contains(program))
            .then(|| program.to_path_buf())
    }
}

struct EmulatedProcess {
    pid: u32,
    table: Arc<Mutex<ProcessTable>>,
}

impl WorkerProcess for EmulatedProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn signal(&mut self, signal: StopSignal) -> io::Result<()> {
        lock(&self.table).deliver(self.pid, signal);
        Ok(())
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitState>> {
        Ok(lock(&self.table)
            .entries
            .get(&self.pid)
            .and_then(|e| e.exit))
    }

    fn kill(&mut self) -> io::Result<()> {
        self.signal(StopSignal::Kill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roam_lab_abstract::{NodeRole, TopologyConfig};

    fn topology() -> EmulatedTopology {
        let config = TopologyConfig {
            anchors: 2,
            participants_per_anchor: 1,
            ..Default::default()
        };
        EmulatedTopology::new(TopologySpec::platoons(&config).unwrap())
    }

    fn spec_in(dir: &Path, program: &str) -> ProcessSpec {
        ProcessSpec {
            program: PathBuf::from(program),
            args: vec!["a".to_string()],
            stdout: dir.join("stdout/x.log"),
            stderr: dir.join("stderr/x.log"),
        }
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("roam-lab-emulated-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_worker_exits_on_second_interrupt() {
        let topo = topology();
        let node = topo.resolve("unit_0_0").unwrap();
        let dir = scratch("interrupt");
        let mut process = topo.spawn(&node, &spec_in(&dir, "/bin/SVSClient")).unwrap();

        process.signal(StopSignal::Interrupt).unwrap();
        assert!(process.try_wait().unwrap().is_none());
        assert_eq!(topo.signal_identity("SVSClient", StopSignal::Interrupt).unwrap(), 1);
        assert_eq!(process.try_wait().unwrap(), Some(ExitState { code: Some(0) }));
        assert_eq!(topo.signal_identity("SVSClient", StopSignal::Kill).unwrap(), 0);
        assert!(dir.join("stdout/x.log").exists());
    }

    #[test]
    fn test_scripted_faults() {
        let topo = topology();
        let node = topo.resolve("uav").unwrap();
        assert_eq!(node.role, NodeRole::Mobile);
        let dir = scratch("faults");

        topo.fail_launches("uav", 1);
        assert!(topo.spawn(&node, &spec_in(&dir, "uav-bin")).is_err());
        let mut process = topo.spawn(&node, &spec_in(&dir, "uav-bin")).unwrap();

        topo.crash_after_queries("uav", 2);
        topo.execute(&node, &["ifconfig".to_string()]).unwrap();
        assert!(process.try_wait().unwrap().is_none());
        topo.execute(&node, &["ifconfig".to_string()]).unwrap();
        assert_eq!(
            process.try_wait().unwrap(),
            Some(ExitState {
                code: Some(CRASH_EXIT_CODE)
            })
        );
        assert_eq!(topo.live_processes(), 0);
    }

    #[test]
    fn test_interface_report_shows_loss() {
        let topo = topology();
        let link = topo.topology().anchor_link(1).unwrap();
        topo.set_loss(link, 100.0).unwrap();
        let node = topo.resolve("uav").unwrap();
        let report = topo.execute(&node, &["ifconfig".to_string()]).unwrap();
        assert!(report.stdout.contains("loss 100.0%"));
        assert_eq!(topo.loss(link).unwrap(), 100.0);
        assert_eq!(topo.addresses(&node).unwrap().len(), 2);
    }
}

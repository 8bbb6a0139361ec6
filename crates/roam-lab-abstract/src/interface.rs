use std::io;
use std::path::{Path, PathBuf};

use crate::topology::{LinkId, NodeRole, TopologySpec};

/// Resolved reference to a node inside a running topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle {
    pub name: String,
    pub role: NodeRole,
}

/// Result of a synchronous, node-addressed command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopSignal {
    /// SIGINT. The first one asks workers to stop publishing, the second one
    /// asks them to exit.
    Interrupt,
    /// SIGKILL.
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    pub code: Option<i32>,
}

/// Structured launch request. Arguments are passed as a vector, never joined
/// into a shell string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl ProcessSpec {
    /// Executable base name, the identity used by group signals.
    pub fn identity(&self) -> String {
        identity_of(&self.program)
    }
}

pub fn identity_of(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

/// A process started on some node.
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Deliver a signal to this process only.
    fn signal(&mut self, signal: StopSignal) -> io::Result<()>;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> io::Result<Option<ExitState>>;

    /// Kill and reap.
    fn kill(&mut self) -> io::Result<()>;
}

/// What the orchestrator needs from the emulated network.
///
/// All methods are synchronous. Callers that must not block the control loop
/// dispatch them onto blocking threads and bound them with timeouts.
pub trait TopologyProvider: Send + Sync {
    /// The static layout this provider was built from.
    fn topology(&self) -> &TopologySpec;

    /// Look a node up by name.
    fn resolve(&self, name: &str) -> Option<NodeHandle>;

    /// Run a command inside `node` and collect its stdout and exit code.
    fn execute(&self, node: &NodeHandle, command: &[String]) -> io::Result<CommandOutput>;

    /// Set the loss percentage (0 to 100) on both directions of a link.
    fn set_loss(&self, link: LinkId, percent: f64) -> io::Result<()>;

    /// Current loss percentage of a link as the provider sees it.
    fn loss(&self, link: LinkId) -> io::Result<f64>;

    /// Start a process inside `node` with redirected stdout/stderr.
    fn spawn(&self, node: &NodeHandle, spec: &ProcessSpec) -> io::Result<Box<dyn WorkerProcess>>;

    /// Signal every process whose executable base name is `identity`.
    /// Returns how many processes matched; zero is not an error.
    fn signal_identity(&self, identity: &str, signal: StopSignal) -> io::Result<usize>;

    /// Addresses assigned to the node's interfaces.
    fn addresses(&self, node: &NodeHandle) -> io::Result<Vec<String>>;

    /// Locate an executable as the nodes would see it.
    fn resolve_executable(&self, program: &Path) -> Option<PathBuf>;

    /// Release whatever the provider created. Called once after the last run.
    fn shutdown(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_base_name() {
        let spec = ProcessSpec {
            program: PathBuf::from("/home/lab/svs-client/SVSClient"),
            args: vec![],
            stdout: PathBuf::from("out.log"),
            stderr: PathBuf::from("err.log"),
        };
        assert_eq!(spec.identity(), "SVSClient");
        assert_eq!(identity_of(Path::new("dtnd")), "dtnd");
    }
}

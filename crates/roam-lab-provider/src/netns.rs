use anyhow::{Context, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use roam_lab_abstract::{
    CommandOutput, ExitState, LinkId, NodeHandle, ProcessSpec, StopSignal, TopologyProvider,
    TopologySpec, WorkerProcess,
};
use tracing::{debug, info, warn};

/// Linux network-namespace backend: one namespace per node, one veth pair
/// per link, `tc netem` for delay and loss. Needs CAP_NET_ADMIN.
pub struct NetnsTopology {
    spec: TopologySpec,
    prefix: String,
    loss: Mutex<Vec<f64>>,
}

fn run(program: &str, args: &[&str]) -> io::Result<CommandOutput> {
    let output = Command::new(program).args(args).output()?;
    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

fn run_checked(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to invoke `{program}`"))?;
    if !output.status.success() {
        anyhow::bail!(
            "`{} {}` failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

fn signal_name(signal: StopSignal) -> &'static str {
    match signal {
        StopSignal::Interrupt => "INT",
        StopSignal::Kill => "KILL",
    }
}

impl NetnsTopology {
    /// Create every namespace and link of `spec`. Links start with zero loss.
    pub fn build(spec: TopologySpec, prefix: impl Into<String>) -> Result<Self> {
        let topology = Self {
            loss: Mutex::new(vec![0.0; spec.links().len()]),
            spec,
            prefix: prefix.into(),
        };

        for node in topology.spec.nodes() {
            let ns = topology.namespace(&node.name);
            run_checked("ip", &["netns", "add", ns.as_str()])?;
            run_checked("ip", &["-n", ns.as_str(), "link", "set", "lo", "up"])?;
        }

        for link in topology.spec.links() {
            let (if_a, if_b) = interface_names(link.id);
            let (ns_a, ns_b) = (topology.namespace(&link.a), topology.namespace(&link.b));
            run_checked(
                "ip",
                &[
                    "link",
                    "add",
                    if_a.as_str(),
                    "netns",
                    ns_a.as_str(),
                    "type",
                    "veth",
                    "peer",
                    "name",
                    if_b.as_str(),
                    "netns",
                    ns_b.as_str(),
                ],
            )?;
            for (ns, ifname, host) in [(&ns_a, &if_a, 1), (&ns_b, &if_b, 2)] {
                let address = format!("10.{}.{}.{}/24", link.id.0 / 256, link.id.0 % 256, host);
                run_checked(
                    "ip",
                    &["-n", ns.as_str(), "addr", "add", address.as_str(), "dev", ifname.as_str()],
                )?;
                run_checked("ip", &["-n", ns.as_str(), "link", "set", ifname.as_str(), "up"])?;
                let delay = format!("{}ms", link.delay_ms);
                run_checked(
                    "ip",
                    &[
                        "netns",
                        "exec",
                        ns.as_str(),
                        "tc",
                        "qdisc",
                        "add",
                        "dev",
                        ifname.as_str(),
                        "root",
                        "netem",
                        "delay",
                        delay.as_str(),
                        "loss",
                        "0%",
                    ],
                )?;
            }
        }
        info!(
            "Built {} namespaces and {} links",
            topology.spec.nodes().len(),
            topology.spec.links().len()
        );
        Ok(topology)
    }

    fn namespace(&self, node: &str) -> String {
        format!("{}{}", self.prefix, node)
    }
}

fn interface_names(link: LinkId) -> (String, String) {
    (format!("rl{}a", link.0), format!("rl{}b", link.0))
}

impl TopologyProvider for NetnsTopology {
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
        let ns = self.namespace(&node.name);
        let mut args: Vec<&str> = vec!["netns", "exec", ns.as_str()];
        args.extend(command.iter().map(String::as_str));
        run("ip", &args)
    }

    fn set_loss(&self, link: LinkId, percent: f64) -> io::Result<()> {
        let spec = self.spec.link(link).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no link {}", link.0))
        })?;
        let (if_a, if_b) = interface_names(link);
        let delay = format!("{}ms", spec.delay_ms);
        let loss = format!("{percent}%");
        for (node, ifname) in [(&spec.a, &if_a), (&spec.b, &if_b)] {
            let ns = self.namespace(node);
            let out = run(
                "ip",
                &[
                    "netns",
                    "exec",
                    ns.as_str(),
                    "tc",
                    "qdisc",
                    "change",
                    "dev",
                    ifname.as_str(),
                    "root",
                    "netem",
                    "delay",
                    delay.as_str(),
                    "loss",
                    loss.as_str(),
                ],
            )?;
            if !out.success() {
                return Err(io::Error::other(format!(
                    "tc on {ns}/{ifname} exited with {}",
                    out.exit_code
                )));
            }
        }
        if let Some(slot) = self
            .loss
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(link.0)
        {
            *slot = percent;
        }
        Ok(())
    }

    fn loss(&self, link: LinkId) -> io::Result<f64> {
        self.loss
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(link.0)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no link {}", link.0)))
    }

    fn spawn(&self, node: &NodeHandle, spec: &ProcessSpec) -> io::Result<Box<dyn WorkerProcess>> {
        let ns = self.namespace(&node.name);
        let stdout = File::create(&spec.stdout)?;
        let stderr = File::create(&spec.stderr)?;
        // `ip netns exec` execs the program, so the child pid is the worker's.
        let child = Command::new("ip")
            .args(["netns", "exec", ns.as_str()])
            .arg(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()?;
        debug!("spawned {} on {} as pid {}", spec.identity(), node.name, child.id());
        Ok(Box::new(NetnsProcess { child }))
    }

    fn signal_identity(&self, identity: &str, signal: StopSignal) -> io::Result<usize> {
        let out = run("pkill", &["--signal", signal_name(signal), "-c", "-x", identity])?;
        // pkill exits with 1 when nothing matched.
        match out.exit_code {
            0 | 1 => Ok(out.stdout.trim().parse().unwrap_or(0)),
            code => Err(io::Error::other(format!("pkill exited with {code}"))),
        }
    }

    fn addresses(&self, node: &NodeHandle) -> io::Result<Vec<String>> {
        let out = self.execute(
            node,
            &["ip", "-o", "-4", "addr", "show"].map(String::from),
        )?;
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| {
                let mut words = line.split_whitespace();
                words.find(|w| *w == "inet")?;
                let cidr = words.next()?;
                let address = cidr.split('/').next()?;
                (address != "127.0.0.1").then(|| address.to_string())
            })
            .collect())
    }

    fn resolve_executable(&self, program: &Path) -> Option<PathBuf> {
        if program.components().count() > 1 {
            return program.is_file().then(|| program.to_path_buf());
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    }

    fn shutdown(&self) -> io::Result<()> {
        for node in self.spec.nodes() {
            let ns = self.namespace(&node.name);
            let out = run("ip", &["netns", "del", ns.as_str()])?;
            if !out.success() {
                warn!("could not delete namespace {ns}");
            }
        }
        Ok(())
    }
}

struct NetnsProcess {
    child: Child,
}

impl WorkerProcess for NetnsProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn signal(&mut self, signal: StopSignal) -> io::Result<()> {
        let pid = self.child.id().to_string();
        let out = run("kill", &["-s", signal_name(signal), pid.as_str()])?;
        if out.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("kill {pid} exited with {}", out.exit_code)))
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitState>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| ExitState { code: status.code() }))
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_names_fit_ifnamsiz() {
        let (a, b) = interface_names(LinkId(9999));
        assert!(a.len() < 16 && b.len() < 16);
        assert_ne!(a, b);
    }
}

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use roam_lab_abstract::{ConfigError, ExperimentConfig, StopSignal, TopologyProvider, identity_of};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{ErrorRecord, LabError};
use crate::lifecycle::{LaunchRecord, ProcessManager, WorkerRole};
use crate::mobility::{self, MobilityModel};
use crate::sampler::StatusSampler;
use crate::schedule::{ConnectivitySchedule, ConnectivityScheduler};
use crate::trace::{BatchReport, RunReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Warmup,
    Active,
    Draining,
    Teardown,
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Init => "INIT",
            RunState::Warmup => "WARMUP",
            RunState::Active => "ACTIVE",
            RunState::Draining => "DRAINING",
            RunState::Teardown => "TEARDOWN",
            RunState::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// How the ACTIVE/DRAINING loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Exhausted,
    Faulted,
    Aborted,
}

struct LaunchRequest {
    node: String,
    role: WorkerRole,
    program: Option<PathBuf>,
    args: Vec<String>,
}

/// Mutable bookkeeping of the run in progress.
struct RunContext {
    run: usize,
    state: RunState,
    started: Duration,
    report: RunReport,
}

impl RunContext {
    fn enter(&mut self, state: RunState) {
        info!(run = self.run, "{} -> {}", self.state, state);
        self.state = state;
        self.report.states.push(state);
    }

    fn note(&mut self, node: Option<&str>, error: LabError) {
        let record = ErrorRecord::new(self.run, self.state, node, &error);
        warn!(
            run = self.run,
            node = record.node.as_deref().unwrap_or("-"),
            phase = %self.state,
            "{error}"
        );
        if error.taints_run() {
            self.report.suspect = true;
            if let Some(node) = &record.node {
                self.report.suspect_nodes.insert(node.clone());
            }
        }
        self.report.errors.push(record);
    }
}

/// Drives whole runs: INIT, WARMUP, ACTIVE, DRAINING, TEARDOWN, DONE.
///
/// The configuration is checked once in [`RunController::new`]; after that
/// nothing that goes wrong inside a run stops the batch. Errors are recorded
/// against the run, node and phase and the affected run is marked suspect.
pub struct RunController<C: Clock> {
    config: Arc<ExperimentConfig>,
    provider: Arc<dyn TopologyProvider>,
    clock: C,
    abort: Option<watch::Receiver<bool>>,
}

impl<C: Clock> RunController<C> {
    pub fn new(config: ExperimentConfig, provider: Arc<dyn TopologyProvider>, clock: C) -> Result<Self, LabError> {
        config.validate()?;
        let topology = provider.topology();
        if topology.mobile().is_none() {
            return Err(ConfigError::InvalidTopology("no mobile node".to_string()).into());
        }
        let anchors = topology.anchors().len();
        if anchors != config.topology.anchors {
            return Err(ConfigError::InvalidTopology(format!(
                "provider has {anchors} anchors, configuration expects {}",
                config.topology.anchors
            ))
            .into());
        }
        let programs = config
            .protocol
            .participant_executable
            .iter()
            .chain(config.protocol.mobile_executable.iter())
            .chain(config.protocol.daemon.iter().map(|d| &d.executable));
        for program in programs {
            if provider.resolve_executable(program).is_none() {
                return Err(ConfigError::UnresolvableExecutable(program.clone()).into());
            }
        }
        Ok(Self {
            config: Arc::new(config),
            provider,
            clock,
            abort: None,
        })
    }

    /// Stop the batch as soon as `abort` turns true.
    pub fn with_abort(mut self, abort: watch::Receiver<bool>) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    fn abort_requested(&self) -> bool {
        self.abort.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleep on the run clock. Returns true when interrupted by an abort.
    async fn wait(&self, duration: Duration) -> bool {
        let Some(abort) = &self.abort else {
            self.clock.sleep(duration).await;
            return false;
        };
        let mut abort = abort.clone();
        if *abort.borrow_and_update() {
            return true;
        }
        let slept = tokio::select! {
            _ = self.clock.sleep(duration) => true,
            _ = abort_signalled(&mut abort) => false,
        };
        !slept || *abort.borrow()
    }

    fn elapsed(&self, ctx: &RunContext) -> Duration {
        self.clock.now().saturating_sub(ctx.started)
    }

    /// Every configured run, in order. Only a configuration problem makes
    /// this fail, and only before the first run.
    pub async fn run_batch(&self) -> Result<BatchReport, LabError> {
        let root = self.config.protocol_root();
        tokio::fs::create_dir_all(&root).await?;
        if let Err(e) = self.write_addresses(&root.join("ips.json")).await {
            warn!("could not write address map: {e}");
        }

        let mut batch = BatchReport {
            experiment: self.config.name.clone(),
            protocol: self.config.protocol.name.clone(),
            ..Default::default()
        };
        for run in 0..self.config.runs.count {
            if self.abort_requested() {
                batch.aborted = true;
                break;
            }
            let report = self.run_once(run).await;
            let aborted = report.aborted;
            batch.runs.push(report);
            if aborted {
                batch.aborted = true;
                break;
            }
        }
        info!(
            runs = batch.runs.len(),
            suspect = ?batch.suspect_runs(),
            "batch finished"
        );
        Ok(batch)
    }

    async fn write_addresses(&self, path: &Path) -> Result<(), LabError> {
        let provider = Arc::clone(&self.provider);
        let addresses = tokio::task::spawn_blocking(move || {
            provider
                .topology()
                .nodes()
                .iter()
                .filter_map(|n| provider.resolve(&n.name))
                .map(|handle| -> std::io::Result<(String, Vec<String>)> {
                    Ok((handle.name.clone(), provider.addresses(&handle)?))
                })
                .collect::<std::io::Result<BTreeMap<String, Vec<String>>>>()
        })
        .await
        .map_err(|e| LabError::provider("addresses task", e))??;
        let data = serde_json::to_vec_pretty(&addresses).map_err(std::io::Error::other)?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    /// One run from INIT to DONE. Always ends with every process stopped.
    pub async fn run_once(&self, run: usize) -> RunReport {
        let config = Arc::clone(&self.config);
        let seed = config.runs.seed_for(run);
        let mut rng = StdRng::seed_from_u64(seed);
        let run_dir = config.run_dir(run);
        let mut ctx = RunContext {
            run,
            state: RunState::Init,
            started: self.clock.now(),
            report: RunReport::new(run, seed, &config.protocol.name),
        };
        info!(run, seed, dir = %run_dir.display(), "starting run");

        ctx.report.states.push(RunState::Init);
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            ctx.note(None, e.into());
        }
        let gate = Arc::new(RwLock::new(()));
        let processes = Arc::new(ProcessManager::new(
            Arc::clone(&self.provider),
            &run_dir,
            &config.lifecycle,
        ));
        let sampler = StatusSampler::new(
            Arc::clone(&self.provider),
            run,
            &run_dir,
            config.protocol.status_command.clone(),
            config.protocol.interface_command.clone(),
            Duration::from_millis(config.sampling.node_timeout_ms),
            Arc::clone(&gate),
        );
        let scheduler = match ConnectivityScheduler::new(Arc::clone(&self.provider), config.loss, gate) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                ctx.note(None, e);
                return self.teardown(ctx, &processes, &sampler, &run_dir).await;
            }
        };

        if let Err(e) = processes.sweep(self.identities()).await {
            ctx.note(None, e);
        }
        self.on_every_node(&mut ctx, &config.protocol.reset_commands, "reset").await;

        let schedule = ConnectivitySchedule::round_robin(&config, &mut rng);
        let mut participants: Vec<String> = self
            .provider
            .topology()
            .participants()
            .iter()
            .map(|n| n.name.clone())
            .collect();
        participants.shuffle(&mut rng);
        ctx.report.start_anchor = schedule.start();
        ctx.report.launch_order = participants.clone();
        let mut model = mobility::model_for(&config, schedule.clone());

        self.sample(&mut ctx, &sampler, "start").await;
        if let Err(e) = scheduler.apply(model.advance(0, Duration::ZERO)).await {
            ctx.note(None, e);
        }

        ctx.enter(RunState::Warmup);
        let mut aborted = false;
        if let Some(daemon) = &config.protocol.daemon {
            let requests = self
                .provider
                .topology()
                .nodes()
                .iter()
                .map(|n| LaunchRequest {
                    node: n.name.clone(),
                    role: WorkerRole::Daemon,
                    program: Some(daemon.executable.clone()),
                    args: daemon.args.clone(),
                })
                .collect();
            self.launch(&mut ctx, &processes, requests).await;
            aborted = self
                .wait(Duration::from_millis(config.lifecycle.warmup_ms))
                .await;
        }
        if !aborted {
            self.on_every_node(&mut ctx, &config.protocol.baseline_commands, "baseline")
                .await;
        }

        if aborted {
            ctx.report.aborted = true;
        } else {
            ctx.enter(RunState::Active);
            let requests = participants
                .iter()
                .map(|node| LaunchRequest {
                    node: node.clone(),
                    role: WorkerRole::Participant,
                    program: config.protocol.participant_executable.clone(),
                    args: config
                        .protocol
                        .participant_args(node, &worker_log(&run_dir, node)),
                })
                .collect();
            self.launch(&mut ctx, &processes, requests).await;
            if let Some(mobile) = self.provider.topology().mobile() {
                let request = LaunchRequest {
                    node: mobile.name.clone(),
                    role: WorkerRole::Mobile,
                    program: config.protocol.mobile_executable.clone(),
                    args: config
                        .protocol
                        .mobile_args(&mobile.name, &worker_log(&run_dir, &mobile.name)),
                };
                self.launch(&mut ctx, &processes, vec![request]).await;
            }

            let exit = self
                .drive(&mut ctx, &scheduler, &sampler, &processes, model.as_mut(), &schedule)
                .await;
            match exit {
                LoopExit::Exhausted => {}
                LoopExit::Faulted => ctx.report.faulted = true,
                LoopExit::Aborted => ctx.report.aborted = true,
            }
        }

        self.teardown(ctx, &processes, &sampler, &run_dir).await
    }

    /// Executable identities of everything a run may start.
    fn identities(&self) -> BTreeSet<String> {
        let protocol = &self.config.protocol;
        protocol
            .participant_executable
            .iter()
            .chain(protocol.mobile_executable.iter())
            .chain(protocol.daemon.iter().map(|d| &d.executable))
            .map(|p| identity_of(p))
            .collect()
    }

    async fn launch(&self, ctx: &mut RunContext, processes: &Arc<ProcessManager>, requests: Vec<LaunchRequest>) {
        let mut tasks = JoinSet::new();
        for (index, request) in requests.into_iter().enumerate() {
            let processes = Arc::clone(processes);
            tasks.spawn(async move {
                let result = processes
                    .start(&request.node, request.role, request.program.as_deref(), request.args)
                    .await;
                (index, request.node, result)
            });
        }

        let mut outcomes: Vec<(usize, String, Result<LaunchRecord, LabError>)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => ctx.note(None, LabError::provider("launch task", e)),
            }
        }
        outcomes.sort_by_key(|(index, _, _)| *index);
        for (_, node, result) in outcomes {
            match result {
                Ok(record) => ctx.report.launched.push(record),
                Err(e) => ctx.note(Some(&node), e),
            }
        }
    }

    /// Run each command on every node; a non-zero exit taints that node.
    async fn on_every_node(&self, ctx: &mut RunContext, commands: &[Vec<String>], label: &'static str) {
        if commands.is_empty() {
            return;
        }
        let timeout = Duration::from_millis(self.config.sampling.node_timeout_ms);
        let mut tasks = JoinSet::new();
        for node in self.provider.topology().nodes() {
            let Some(handle) = self.provider.resolve(&node.name) else {
                continue;
            };
            let provider = Arc::clone(&self.provider);
            let commands = commands.to_vec();
            tasks.spawn(async move {
                let name = handle.name.clone();
                let job = tokio::task::spawn_blocking(move || {
                    commands
                        .iter()
                        .map(|cmd| provider.execute(&handle, cmd).map(|out| (cmd.join(" "), out)))
                        .collect::<std::io::Result<Vec<_>>>()
                });
                (name, tokio::time::timeout(timeout, job).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (node, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    ctx.note(None, LabError::provider(label, e));
                    continue;
                }
            };
            match outcome {
                Err(_) => ctx.note(
                    Some(&node),
                    LabError::CommandTimeout {
                        node: node.clone(),
                        operation: format!("{label} commands"),
                        timeout,
                    },
                ),
                Ok(Err(e)) => ctx.note(Some(&node), LabError::provider(label, e)),
                Ok(Ok(Err(e))) => ctx.note(Some(&node), LabError::provider(label, e)),
                Ok(Ok(Ok(outputs))) => {
                    for (command, output) in outputs {
                        if !output.success() {
                            ctx.note(
                                Some(&node),
                                LabError::Provider(format!(
                                    "{label} `{command}` exited with {}",
                                    output.exit_code
                                )),
                            );
                        }
                    }
                }
            }
        }
    }

    async fn sample(&self, ctx: &mut RunContext, sampler: &StatusSampler, phase: &str) {
        let pass = sampler.sample(phase, self.elapsed(ctx)).await;
        ctx.report.snapshots += pass.snapshots.len();
        ctx.report.gaps += pass.gaps.len();
        for gap in pass.gaps {
            ctx.note(None, gap);
        }
    }

    /// ACTIVE and DRAINING: one scheduler advance per dwell window, sampling
    /// on every sub-interval in between.
    async fn drive(
        &self,
        ctx: &mut RunContext,
        scheduler: &ConnectivityScheduler,
        sampler: &StatusSampler,
        processes: &ProcessManager,
        model: &mut dyn MobilityModel,
        schedule: &ConnectivitySchedule,
    ) -> LoopExit {
        let interval = self.config.sample_interval();
        let drain_tick = self.config.drain_tick();
        let dwell = schedule.dwell();

        for tick in 0..schedule.len() {
            if tick == drain_tick {
                ctx.enter(RunState::Draining);
                if let Err(e) = processes
                    .signal(|_, role| role == WorkerRole::Participant, StopSignal::Interrupt)
                    .await
                {
                    ctx.note(None, e);
                }
            }
            ctx.report.tick_states.push(ctx.state);

            match scheduler
                .apply(model.advance(tick, schedule.window(tick).start))
                .await
            {
                Ok(anchor) => ctx.report.anchor_sequence.push(anchor),
                Err(e) => ctx.note(None, e),
            }

            let mut waited = Duration::ZERO;
            while waited < dwell {
                self.sample(ctx, sampler, "eval").await;

                let crashed = processes.reap();
                if !crashed.is_empty() {
                    for (record, exit) in crashed {
                        ctx.note(
                            None,
                            LabError::Crashed {
                                node: record.node,
                                role: record.role,
                                code: exit.code,
                            },
                        );
                    }
                    return LoopExit::Faulted;
                }

                let step = interval.min(dwell - waited);
                if self.wait(step).await {
                    info!(run = ctx.run, tick, "abort requested");
                    return LoopExit::Aborted;
                }
                waited += step;
            }
        }
        LoopExit::Exhausted
    }

    /// Stop everything, take the final snapshot and write `run.json`.
    async fn teardown(
        &self,
        mut ctx: RunContext,
        processes: &ProcessManager,
        sampler: &StatusSampler,
        run_dir: &Path,
    ) -> RunReport {
        ctx.enter(RunState::Teardown);
        let adopted = processes.adopt_late_launches().await;
        if !adopted.is_empty() {
            warn!(run = ctx.report.run, count = adopted.len(), "stopping processes whose launch timed out");
        }
        for workers in [true, false] {
            match processes.stop_all(|_, role| role.is_worker() == workers).await {
                Ok(summary) => {
                    for (node, role) in summary.forced {
                        ctx.note(None, LabError::Teardown { node, role });
                    }
                }
                Err(e) => ctx.note(None, e),
            }
        }
        if let Err(e) = processes.sweep(self.identities()).await {
            ctx.note(None, e);
        }
        ctx.report.live_after_teardown = processes.live();

        self.clock
            .sleep(Duration::from_millis(self.config.lifecycle.settle_ms))
            .await;
        self.sample(&mut ctx, sampler, "end").await;

        ctx.enter(RunState::Done);
        let report = ctx.report;
        match serde_json::to_vec_pretty(&report) {
            Ok(data) => {
                if let Err(e) = tokio::fs::write(run_dir.join("run.json"), data).await {
                    warn!(run = report.run, "could not write run report: {e}");
                }
            }
            Err(e) => warn!(run = report.run, "could not serialize run report: {e}"),
        }
        info!(
            run = report.run,
            suspect = report.suspect,
            snapshots = report.snapshots,
            errors = report.errors.len(),
            "run finished"
        );
        report
    }
}

async fn abort_signalled(abort: &mut watch::Receiver<bool>) {
    if abort.wait_for(|&aborted| aborted).await.is_err() {
        // Sender gone: nobody can abort any more.
        std::future::pending::<()>().await;
    }
}

fn worker_log(run_dir: &Path, node: &str) -> PathBuf {
    run_dir.join(format!("{node}.log"))
}

use serde::Serialize;
use std::collections::BTreeSet;

use crate::controller::RunState;
use crate::error::{ErrorKind, ErrorRecord};
use crate::lifecycle::LaunchRecord;

/// What happened in one run, written to `<run dir>/run.json`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run: usize,
    pub seed: u64,
    pub protocol: String,
    /// Some data of this run cannot be trusted.
    pub suspect: bool,
    pub suspect_nodes: BTreeSet<String>,
    pub aborted: bool,
    /// A worker died on its own and the run was cut short.
    pub faulted: bool,
    pub start_anchor: usize,
    /// Participant launch order drawn from the run seed.
    pub launch_order: Vec<String>,
    pub launched: Vec<LaunchRecord>,
    /// Connected (or best-served) anchor per scheduling tick.
    pub anchor_sequence: Vec<usize>,
    /// Run state during each scheduling tick.
    pub tick_states: Vec<RunState>,
    /// Every state the run passed through, in order.
    pub states: Vec<RunState>,
    pub snapshots: usize,
    pub gaps: usize,
    pub errors: Vec<ErrorRecord>,
    /// Processes still alive after TEARDOWN; always zero unless the
    /// provider lost track of something.
    pub live_after_teardown: usize,
}

impl RunReport {
    pub fn new(run: usize, seed: u64, protocol: &str) -> Self {
        Self {
            run,
            seed,
            protocol: protocol.to_string(),
            ..Default::default()
        }
    }

    pub fn errors_of(&self, kind: ErrorKind) -> impl Iterator<Item = &ErrorRecord> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub experiment: String,
    pub protocol: String,
    pub runs: Vec<RunReport>,
    /// The batch stopped early on an external abort.
    pub aborted: bool,
}

impl BatchReport {
    pub fn suspect_runs(&self) -> Vec<usize> {
        self.runs.iter().filter(|r| r.suspect).map(|r| r.run).collect()
    }
}

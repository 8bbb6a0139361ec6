use serde::Serialize;
use std::io;
use std::time::Duration;
use thiserror::Error;

use roam_lab_abstract::ConfigError;

use crate::controller::RunState;
use crate::lifecycle::WorkerRole;

#[derive(Debug, Error)]
pub enum LabError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("anchor {index} out of range, topology has {anchors} anchors")]
    Range { index: usize, anchors: usize },

    #[error("{role} already running on {node}")]
    AlreadyRunning { node: String, role: WorkerRole },

    #[error("failed to launch {role} on {node}: {reason}")]
    Launch {
        node: String,
        role: WorkerRole,
        reason: String,
    },

    #[error("{operation} on {node} timed out after {timeout:?}")]
    CommandTimeout {
        node: String,
        operation: String,
        timeout: Duration,
    },

    #[error("{role} on {node} ignored the interrupt and was killed")]
    Teardown { node: String, role: WorkerRole },

    #[error("worker {role} on {node} exited unexpectedly with {code:?}")]
    Crashed {
        node: String,
        role: WorkerRole,
        code: Option<i32>,
    },

    #[error("provider call failed: {0}")]
    Provider(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Range,
    AlreadyRunning,
    Launch,
    CommandTimeout,
    Teardown,
    Crashed,
    Provider,
    Io,
}

impl LabError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LabError::Configuration(_) => ErrorKind::Configuration,
            LabError::Range { .. } => ErrorKind::Range,
            LabError::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            LabError::Launch { .. } => ErrorKind::Launch,
            LabError::CommandTimeout { .. } => ErrorKind::CommandTimeout,
            LabError::Teardown { .. } => ErrorKind::Teardown,
            LabError::Crashed { .. } => ErrorKind::Crashed,
            LabError::Provider(_) => ErrorKind::Provider,
            LabError::Io(_) => ErrorKind::Io,
        }
    }

    /// The node an error is about, when it is about one.
    pub fn node(&self) -> Option<&str> {
        match self {
            LabError::AlreadyRunning { node, .. }
            | LabError::Launch { node, .. }
            | LabError::CommandTimeout { node, .. }
            | LabError::Teardown { node, .. }
            | LabError::Crashed { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Errors after which the data of the affected node cannot be trusted.
    pub fn taints_run(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::CommandTimeout | ErrorKind::Teardown
        )
    }

    pub(crate) fn provider(context: &str, err: impl std::fmt::Display) -> Self {
        LabError::Provider(format!("{context}: {err}"))
    }
}

/// An error attributed to the run, node and phase it happened in.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub run: usize,
    pub node: Option<String>,
    pub phase: RunState,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(run: usize, phase: RunState, node: Option<&str>, error: &LabError) -> Self {
        Self {
            run,
            node: node.or(error.node()).map(str::to_string),
            phase,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_takes_node_from_error() {
        let err = LabError::Launch {
            node: "unit_0_1".to_string(),
            role: WorkerRole::Participant,
            reason: "exec format error".to_string(),
        };
        let record = ErrorRecord::new(3, RunState::Active, None, &err);
        assert_eq!(record.node.as_deref(), Some("unit_0_1"));
        assert_eq!(record.kind, ErrorKind::Launch);
        assert!(record.message.contains("participant on unit_0_1"));
        assert!(err.taints_run());
    }

    #[test]
    fn test_gaps_do_not_taint() {
        let err = LabError::CommandTimeout {
            node: "ap2".to_string(),
            operation: "status report".to_string(),
            timeout: Duration::from_millis(2000),
        };
        assert!(!err.taints_run());
        let json = serde_json::to_value(ErrorRecord::new(0, RunState::Draining, None, &err)).unwrap();
        assert_eq!(json["kind"], "command_timeout");
        assert_eq!(json["phase"], "draining");
    }
}

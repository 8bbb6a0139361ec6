pub mod clock;
pub mod controller;
pub mod error;
pub mod lifecycle;
pub mod mobility;
pub mod sampler;
pub mod schedule;
pub mod trace;

pub use clock::{Clock, SimulatedClock, SystemClock};
pub use controller::{RunController, RunState};
pub use error::{ErrorKind, ErrorRecord, LabError};
pub use lifecycle::{LaunchRecord, ProcessManager, StopSummary, WorkerRole};
pub use mobility::{HandoffModel, MobilityModel, TrajectoryModel, Transition, model_for};
pub use sampler::{ReportKind, SamplePass, StatusSampler, StatusSnapshot};
pub use schedule::{ConnectivitySchedule, ConnectivityScheduler};
pub use trace::{BatchReport, RunReport};

pub mod config;
pub mod interface;
pub mod protocol;
pub mod scenario;
pub mod topology;

pub use config::{
    ConfigError, ExperimentConfig, LifecycleConfig, LossValues, MobilityPolicy, PropagationConfig,
    RunsConfig, SamplingConfig, ScheduleConfig, StartAnchor, TopologyConfig, TrajectoryConfig,
};
pub use interface::{
    CommandOutput, ExitState, NodeHandle, ProcessSpec, StopSignal, TopologyProvider,
    WorkerProcess, identity_of,
};
pub use protocol::{ArgStyle, DaemonSpec, ProtocolProfile, name_prefix, profile_by_name};
pub use scenario::ExperimentFile;
pub use topology::{Link, LinkId, Node, NodeRole, Position, TopologySpec};

use serde::Deserialize;
use std::path::PathBuf;

use crate::config::{
    ConfigError, ExperimentConfig, LifecycleConfig, LossValues, MobilityPolicy, RunsConfig,
    SamplingConfig, ScheduleConfig, TopologyConfig,
};
use crate::protocol::{ArgStyle, DaemonSpec, profile_by_name};

/// On-disk experiment description. Every field is optional and layered on top
/// of `ExperimentConfig::default()`.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ExperimentFile {
    pub name: Option<String>,
    pub description: Option<String>,
    pub protocol: ProtocolOverride,
    pub topology: Option<TopologyConfig>,
    pub mobility: Option<MobilityPolicy>,
    pub schedule: Option<ScheduleConfig>,
    pub loss: Option<LossValues>,
    pub sampling: Option<SamplingConfig>,
    pub lifecycle: Option<LifecycleConfig>,
    pub runs: Option<RunsConfig>,
    pub log_root: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ProtocolOverride {
    /// Selects the base profile (`svs`, `syncps`, `ip`).
    pub name: Option<String>,
    pub participant_executable: Option<PathBuf>,
    pub mobile_executable: Option<PathBuf>,
    pub listen_address: Option<String>,
    pub status_command: Option<Vec<String>>,
    pub interface_command: Option<Vec<String>>,
    pub reset_commands: Option<Vec<Vec<String>>>,
    pub daemon: Option<DaemonSpec>,
    pub baseline_commands: Option<Vec<Vec<String>>>,
}

impl ProtocolOverride {
    pub fn apply_to(&self, config: &mut ExperimentConfig) -> Result<(), ConfigError> {
        if let Some(name) = &self.name {
            config.protocol = profile_by_name(name)?;
        }
        let profile = &mut config.protocol;
        if let Some(v) = &self.participant_executable {
            profile.participant_executable = Some(v.clone());
        }
        if let Some(v) = &self.mobile_executable {
            profile.mobile_executable = Some(v.clone());
        }
        if let Some(v) = &self.listen_address {
            profile.arg_style = ArgStyle::Store {
                listen_address: v.clone(),
            };
        }
        if let Some(v) = &self.status_command {
            profile.status_command = (!v.is_empty()).then(|| v.clone());
        }
        if let Some(v) = &self.interface_command {
            profile.interface_command = v.clone();
        }
        if let Some(v) = &self.reset_commands {
            profile.reset_commands = v.clone();
        }
        if let Some(v) = &self.daemon {
            profile.daemon = Some(v.clone());
        }
        if let Some(v) = &self.baseline_commands {
            profile.baseline_commands = v.clone();
        }
        Ok(())
    }
}

impl ExperimentFile {
    pub fn apply_to(&self, config: &mut ExperimentConfig) -> Result<(), ConfigError> {
        if let Some(v) = &self.name {
            config.name = v.clone();
        }
        self.protocol.apply_to(config)?;
        if let Some(v) = &self.topology {
            config.topology = v.clone();
        }
        if let Some(v) = &self.mobility {
            config.mobility = v.clone();
        }
        if let Some(v) = &self.schedule {
            config.schedule = v.clone();
        }
        if let Some(v) = self.loss {
            config.loss = v;
        }
        if let Some(v) = &self.sampling {
            config.sampling = v.clone();
        }
        if let Some(v) = &self.lifecycle {
            config.lifecycle = v.clone();
        }
        if let Some(v) = &self.runs {
            config.runs = v.clone();
        }
        if let Some(v) = &self.log_root {
            config.log_root = v.clone();
        }
        Ok(())
    }

    pub fn into_config(&self) -> Result<ExperimentConfig, ConfigError> {
        let mut config = ExperimentConfig::default();
        self.apply_to(&mut config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StartAnchor;

    const WIFI: &str = r#"
        name = "wifi-ip"
        log_root = "/vagrant/logs/47"

        [protocol]
        name = "ip"
        participant_executable = "/home/vagrant/dtn7-go/dtnd"
        mobile_executable = "/home/vagrant/dtn7-go/uav"

        [schedule]
        dwell_ms = 30000
        start_anchor = "random"

        [loss]
        connected = 1
        disconnected = 100

        [mobility]
        policy = "trajectory"
        leg_ms = 25000

        [runs]
        count = 5
    "#;

    #[test]
    fn test_partial_file_layers_on_defaults() {
        let file: ExperimentFile = toml::from_str(WIFI).unwrap();
        let config = file.into_config().unwrap();

        assert_eq!(config.name, "wifi-ip");
        assert_eq!(config.protocol.name, "ip");
        assert!(config.protocol.status_command.is_none());
        assert_eq!(config.schedule.start_anchor, StartAnchor::Random);
        assert_eq!(config.schedule.publish_rounds, 2);
        assert_eq!(config.runs.count, 5);
        assert_eq!(config.runs.seed_base, 0);
        assert_eq!(config.topology.anchors, 4);
        assert_eq!(config.protocol_root(), PathBuf::from("/vagrant/logs/47/ip"));
        match &config.mobility {
            MobilityPolicy::Trajectory(t) => {
                assert_eq!(t.leg_ms, Some(25_000));
                assert!(t.waypoints.is_empty());
            }
            other => panic!("unexpected policy {other:?}"),
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_protocol_fails() {
        let file: ExperimentFile = toml::from_str("[protocol]\nname = \"tcp\"").unwrap();
        assert!(matches!(
            file.into_config(),
            Err(ConfigError::UnknownProtocol(_))
        ));
    }

    #[test]
    fn test_empty_status_command_disables_report() {
        let file: ExperimentFile = toml::from_str("[protocol]\nstatus_command = []").unwrap();
        let config = file.into_config().unwrap();
        assert_eq!(config.protocol.name, "svs");
        assert!(config.protocol.status_command.is_none());
    }
}

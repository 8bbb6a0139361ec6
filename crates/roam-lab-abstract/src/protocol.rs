use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::ConfigError;

/// How positional arguments are laid out for the worker executables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum ArgStyle {
    /// `<name-prefix> <log-path>` for participants, no arguments for the mobile node.
    NamePrefix,
    /// `<identity> <log-path> <listen-address> store_<identity>` for every worker.
    Store { listen_address: String },
}

/// A per-node forwarding daemon that must be up before workers start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSpec {
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Everything that differs between the protocols under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolProfile {
    pub name: String,
    pub participant_executable: Option<PathBuf>,
    pub mobile_executable: Option<PathBuf>,
    pub arg_style: ArgStyle,
    /// Workload-level status report; `None` when the stack has none.
    pub status_command: Option<Vec<String>>,
    pub interface_command: Vec<String>,
    /// Run on every node during INIT to drop cached content.
    pub reset_commands: Vec<Vec<String>>,
    pub daemon: Option<DaemonSpec>,
    /// Applied on every node during WARMUP; each must exit with 0.
    pub baseline_commands: Vec<Vec<String>>,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl ProtocolProfile {
    /// State-vector sync over NDN.
    pub fn svs() -> Self {
        Self {
            name: "svs".to_string(),
            participant_executable: None,
            mobile_executable: None,
            arg_style: ArgStyle::NamePrefix,
            status_command: Some(argv(&["nfdc", "status", "report"])),
            interface_command: argv(&["ifconfig"]),
            reset_commands: vec![argv(&["nfdc", "cs", "erase", "/"])],
            daemon: Some(DaemonSpec {
                executable: PathBuf::from("nfd"),
                args: Vec::new(),
            }),
            baseline_commands: vec![
                argv(&["nfdc", "strategy", "set", "/ndn/", "/localhost/nfd/strategy/multicast"]),
                argv(&["nfdc", "strategy", "set", "/voice/", "/localhost/nfd/strategy/multicast"]),
            ],
        }
    }

    /// Same NDN stack as svs, different sync library.
    pub fn syncps() -> Self {
        Self {
            name: "syncps".to_string(),
            ..Self::svs()
        }
    }

    /// Store-and-forward over plain IP; no forwarder, no content store.
    pub fn ip() -> Self {
        Self {
            name: "ip".to_string(),
            participant_executable: None,
            mobile_executable: None,
            arg_style: ArgStyle::Store {
                listen_address: ":8333".to_string(),
            },
            status_command: None,
            interface_command: argv(&["ifconfig"]),
            reset_commands: Vec::new(),
            daemon: None,
            baseline_commands: Vec::new(),
        }
    }

    pub fn participant_args(&self, node: &str, log_path: &Path) -> Vec<String> {
        match &self.arg_style {
            ArgStyle::NamePrefix => vec![name_prefix(node), log_path.display().to_string()],
            ArgStyle::Store { listen_address } => store_args(node, log_path, listen_address),
        }
    }

    pub fn mobile_args(&self, node: &str, log_path: &Path) -> Vec<String> {
        match &self.arg_style {
            ArgStyle::NamePrefix => Vec::new(),
            ArgStyle::Store { listen_address } => store_args(node, log_path, listen_address),
        }
    }
}

fn store_args(node: &str, log_path: &Path, listen_address: &str) -> Vec<String> {
    vec![
        node.to_string(),
        log_path.display().to_string(),
        listen_address.to_string(),
        format!("store_{node}"),
    ]
}

/// `unit_{platoon}_{unit}` maps to `/ndn/platoon{platoon}/unit{unit}/`; any
/// other node name gets a flat `/ndn/{name}/` prefix.
pub fn name_prefix(node: &str) -> String {
    let mut parts = node.split('_');
    if let (Some("unit"), Some(platoon), Some(unit), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    {
        return format!("/ndn/platoon{platoon}/unit{unit}/");
    }
    format!("/ndn/{node}/")
}

/// Map a user-visible protocol name to its profile.
pub fn profile_by_name(name: &str) -> Result<ProtocolProfile, ConfigError> {
    match name {
        "svs" => Ok(ProtocolProfile::svs()),
        "syncps" => Ok(ProtocolProfile::syncps()),
        "ip" => Ok(ProtocolProfile::ip()),
        other => Err(ConfigError::UnknownProtocol(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_prefix() {
        assert_eq!(name_prefix("unit_2_4"), "/ndn/platoon2/unit4/");
        assert_eq!(name_prefix("uav"), "/ndn/uav/");
        assert_eq!(name_prefix("unit_1_2_3"), "/ndn/unit_1_2_3/");
    }

    #[test]
    fn test_ndn_arguments() {
        let profile = ProtocolProfile::svs();
        let log = Path::new("/logs/svs/0/unit_0_1.log");
        assert_eq!(
            profile.participant_args("unit_0_1", log),
            vec!["/ndn/platoon0/unit1/", "/logs/svs/0/unit_0_1.log"]
        );
        assert!(profile.mobile_args("uav", log).is_empty());
    }

    #[test]
    fn test_store_arguments() {
        let profile = ProtocolProfile::ip();
        let log = Path::new("/logs/ip/0/uav.log");
        assert_eq!(
            profile.mobile_args("uav", log),
            vec!["uav", "/logs/ip/0/uav.log", ":8333", "store_uav"]
        );
        assert!(profile.status_command.is_none());
        assert!(profile.reset_commands.is_empty());
    }

    #[test]
    fn test_unknown_profile() {
        assert!(profile_by_name("syncps").is_ok());
        assert!(matches!(
            profile_by_name("quic"),
            Err(ConfigError::UnknownProtocol(name)) if name == "quic"
        ));
    }
}

use serde::{Deserialize, Serialize};

use crate::error::{StyraError, StyraResult};

/// Host used for reverse-proxy routes that do not bind a specific address.
pub const WILDCARD_HOST: &str = "0.0.0.0";

/// Sentinel reported when an eventually-consistent field never materialized.
pub const FIELD_UNAVAILABLE: &str = "-";

/// Opaque remote identifier for a machine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineId(pub String);

impl MachineId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MachineId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Power state of a remote machine as reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Stopped,
    Running,
    Paused,
    Suspended,
    /// Pre-query state, or a state string the control plane added after us
    Unknown,
}

impl PowerState {
    pub fn parse(s: &str) -> Self {
        match s {
            "stopped" => PowerState::Stopped,
            "running" => PowerState::Running,
            "paused" => PowerState::Paused,
            "suspended" => PowerState::Suspended,
            _ => PowerState::Unknown,
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PowerState::Stopped => "stopped",
            PowerState::Running => "running",
            PowerState::Paused => "paused",
            PowerState::Suspended => "suspended",
            PowerState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Power transition requested from the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerOp {
    Start,
    Stop,
    Resume,
    Pause,
    Suspend,
}

impl PowerOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerOp::Start => "start",
            PowerOp::Stop => "stop",
            PowerOp::Resume => "resume",
            PowerOp::Pause => "pause",
            PowerOp::Suspend => "suspend",
        }
    }
}

impl std::fmt::Display for PowerOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of a remote machine
///
/// Handles are refreshed by re-querying the control plane after every
/// state-changing call; they are never cached across orchestration runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub name: String,
    pub state: PowerState,
    pub external_ip: Option<String>,
    pub internal_ip: Option<String>,
}

/// Hardware sizing applied in the apply-specs stage (requires a stopped machine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareSpec {
    pub cpus: u32,
    pub memory_mb: u32,
}

impl Default for HardwareSpec {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mb: 2048,
        }
    }
}

/// One machine setting applied in the apply-config stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

/// Host directory exposed to the guest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFolder {
    pub name: String,
    pub host_path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Power state the machine should be left in when an orchestration run ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredPower {
    Running,
    Stopped,
}

impl Default for DesiredPower {
    fn default() -> Self {
        DesiredPower::Running
    }
}

impl DesiredPower {
    pub fn as_state(&self) -> PowerState {
        match self {
            DesiredPower::Running => PowerState::Running,
            DesiredPower::Stopped => PowerState::Stopped,
        }
    }
}

/// Desired configuration of one machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,
    /// Base image or catalog template the machine is created from
    pub source: String,
    #[serde(default)]
    pub hardware: HardwareSpec,
    #[serde(default)]
    pub config: Vec<ConfigEntry>,
    /// Raw hypervisor flag commands applied after the config entries
    #[serde(default)]
    pub custom_flags: Vec<String>,
    #[serde(default)]
    pub shared_folders: Vec<SharedFolder>,
    #[serde(default)]
    pub post_create_scripts: Vec<String>,
    #[serde(default)]
    pub pre_destroy_script: Option<String>,
    #[serde(default)]
    pub routes: Vec<ProxyRoute>,
    #[serde(default)]
    pub desired_power: DesiredPower,
    /// Replace an existing machine with the same name instead of failing
    #[serde(default)]
    pub force_replace: bool,
}

impl MachineSpec {
    /// Validate the spec before any remote call is made
    pub fn validate(&self) -> StyraResult<()> {
        if self.name.is_empty() {
            return Err(StyraError::InvalidInput {
                field: "name".to_string(),
                message: "machine name cannot be empty".to_string(),
            });
        }
        if self.source.is_empty() {
            return Err(StyraError::InvalidInput {
                field: "source".to_string(),
                message: "machine source image cannot be empty".to_string(),
            });
        }
        if self.hardware.cpus == 0 {
            return Err(StyraError::InvalidInput {
                field: "hardware.cpus".to_string(),
                message: "machine must have at least 1 vCPU".to_string(),
            });
        }
        if self.hardware.memory_mb == 0 {
            return Err(StyraError::InvalidInput {
                field: "hardware.memory_mb".to_string(),
                message: "machine must have at least 1 MB of memory".to_string(),
            });
        }
        for route in &self.routes {
            route.validate()?;
        }
        Ok(())
    }
}

/// Reverse-proxy route exposing a guest port through the host
///
/// Identity is the normalized `host:port` pair, not the remote ID: an empty
/// host means the wildcard address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRoute {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub host: String,
    pub port: String,
    pub target_host: String,
    pub target_port: String,
}

impl ProxyRoute {
    /// Identity key: normalized `host:port` with the wildcard default applied
    pub fn key(&self) -> String {
        let host = if self.host.is_empty() {
            WILDCARD_HOST
        } else {
            self.host.as_str()
        };
        format!("{}:{}", host, self.port)
    }

    /// Payload equality, ignoring remote identity
    pub fn same_target(&self, other: &ProxyRoute) -> bool {
        self.target_host == other.target_host && self.target_port == other.target_port
    }

    pub fn validate(&self) -> StyraResult<()> {
        if self.port.is_empty() {
            return Err(StyraError::InvalidInput {
                field: "routes.port".to_string(),
                message: "proxy route port cannot be empty".to_string(),
            });
        }
        if self.target_port.is_empty() {
            return Err(StyraError::InvalidInput {
                field: "routes.target_port".to_string(),
                message: "proxy route target port cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Authorization user principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
}

/// Authorization role; the payload is the identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
}

/// Authorization claim; the payload is the identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub name: String,
}

/// API key principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_route_key_defaults_empty_host_to_wildcard() {
        let route = ProxyRoute {
            id: None,
            host: String::new(),
            port: "8080".to_string(),
            target_host: "10.0.0.5".to_string(),
            target_port: "80".to_string(),
        };
        assert_eq!(route.key(), "0.0.0.0:8080");
    }

    #[test]
    fn proxy_route_key_keeps_explicit_host() {
        let route = ProxyRoute {
            id: None,
            host: "192.168.1.10".to_string(),
            port: "443".to_string(),
            target_host: "10.0.0.5".to_string(),
            target_port: "8443".to_string(),
        };
        assert_eq!(route.key(), "192.168.1.10:443");
    }

    #[test]
    fn spec_validation_rejects_zero_resources() {
        let mut spec = MachineSpec {
            name: "web-01".to_string(),
            source: "ubuntu-22.04".to_string(),
            hardware: HardwareSpec::default(),
            config: vec![],
            custom_flags: vec![],
            shared_folders: vec![],
            post_create_scripts: vec![],
            pre_destroy_script: None,
            routes: vec![],
            desired_power: DesiredPower::default(),
            force_replace: false,
        };
        assert!(spec.validate().is_ok());

        spec.hardware.cpus = 0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn power_state_parse_is_total() {
        assert_eq!(PowerState::parse("running"), PowerState::Running);
        assert_eq!(PowerState::parse("suspended"), PowerState::Suspended);
        assert_eq!(PowerState::parse("rebooting"), PowerState::Unknown);
    }
}

//! Persisted machine state and its schema migrations
//!
//! Callers persist a [`PersistedMachine`] after a successful orchestration
//! run and hand it back for updates and destroys. Older persisted payloads
//! are upgraded through explicit per-version migration functions: plain
//! field-by-field copies that default the fields a newer schema introduced.
//! No decision logic lives here.

use serde::{Deserialize, Serialize};

use crate::error::{StyraError, StyraResult};
use crate::types::{DesiredPower, MachineId, FIELD_UNAVAILABLE};

pub const CURRENT_VERSION: u32 = 3;

/// First persisted schema: machine identity and the external address only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMachineV1 {
    pub machine_id: String,
    pub name: String,
    pub external_ip: Option<String>,
}

/// Second schema: internal address and dependent route identifiers added
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMachineV2 {
    pub machine_id: String,
    pub name: String,
    pub external_ip: Option<String>,
    pub internal_ip: Option<String>,
    #[serde(default)]
    pub route_ids: Vec<String>,
}

/// Current schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMachine {
    #[serde(default = "current_version")]
    pub version: u32,
    pub machine_id: MachineId,
    pub name: String,
    /// Address strings carry the `"-"` sentinel when never observed
    #[serde(default = "unavailable")]
    pub external_ip: String,
    #[serde(default = "unavailable")]
    pub internal_ip: String,
    #[serde(default)]
    pub route_ids: Vec<String>,
    #[serde(default)]
    pub desired_power: DesiredPower,
    /// Script to run inside the guest before the machine is destroyed
    #[serde(default)]
    pub pre_destroy_script: Option<String>,
}

fn current_version() -> u32 {
    CURRENT_VERSION
}

fn unavailable() -> String {
    FIELD_UNAVAILABLE.to_string()
}

/// v1 -> v2: new fields get their empty defaults
pub fn upgrade_v1(v1: PersistedMachineV1) -> PersistedMachineV2 {
    PersistedMachineV2 {
        machine_id: v1.machine_id,
        name: v1.name,
        external_ip: v1.external_ip,
        internal_ip: None,
        route_ids: Vec::new(),
    }
}

/// v2 -> v3: addresses become sentinel strings, desired power defaults
pub fn upgrade_v2(v2: PersistedMachineV2) -> PersistedMachine {
    PersistedMachine {
        version: CURRENT_VERSION,
        machine_id: MachineId(v2.machine_id),
        name: v2.name,
        external_ip: v2.external_ip.unwrap_or_else(unavailable),
        internal_ip: v2.internal_ip.unwrap_or_else(unavailable),
        route_ids: v2.route_ids,
        desired_power: DesiredPower::default(),
        pre_destroy_script: None,
    }
}

/// Upgrade any persisted payload to the current schema.
///
/// Payloads without a `version` field predate versioning and are treated as
/// v1.
pub fn upgrade(raw: serde_json::Value) -> StyraResult<PersistedMachine> {
    let version = raw.get("version").and_then(|v| v.as_u64()).unwrap_or(1);
    match version {
        1 => {
            let v1: PersistedMachineV1 = serde_json::from_value(raw)?;
            Ok(upgrade_v2(upgrade_v1(v1)))
        }
        2 => {
            let v2: PersistedMachineV2 = serde_json::from_value(raw)?;
            Ok(upgrade_v2(v2))
        }
        3 => Ok(serde_json::from_value(raw)?),
        other => Err(StyraError::InvalidInput {
            field: "version".to_string(),
            message: format!("unknown persisted state version {}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn v1_payload_upgrades_with_defaults() {
        let raw = json!({
            "machine_id": "m-42",
            "name": "web-01",
            "external_ip": "192.168.1.50"
        });

        let upgraded = upgrade(raw).unwrap();

        assert_eq!(upgraded.version, CURRENT_VERSION);
        assert_eq!(upgraded.machine_id.as_str(), "m-42");
        assert_eq!(upgraded.external_ip, "192.168.1.50");
        assert_eq!(upgraded.internal_ip, FIELD_UNAVAILABLE);
        assert!(upgraded.route_ids.is_empty());
        assert_eq!(upgraded.desired_power, DesiredPower::Running);
    }

    #[test]
    fn v2_payload_keeps_route_ids() {
        let raw = json!({
            "version": 2,
            "machine_id": "m-42",
            "name": "web-01",
            "external_ip": null,
            "internal_ip": "10.211.55.7",
            "route_ids": ["r-1", "r-2"]
        });

        let upgraded = upgrade(raw).unwrap();

        assert_eq!(upgraded.external_ip, FIELD_UNAVAILABLE);
        assert_eq!(upgraded.internal_ip, "10.211.55.7");
        assert_eq!(upgraded.route_ids, vec!["r-1", "r-2"]);
    }

    #[test]
    fn current_payload_passes_through_unchanged() {
        let current = PersistedMachine {
            version: CURRENT_VERSION,
            machine_id: MachineId("m-7".to_string()),
            name: "db-01".to_string(),
            external_ip: "192.168.1.51".to_string(),
            internal_ip: FIELD_UNAVAILABLE.to_string(),
            route_ids: vec!["r-9".to_string()],
            desired_power: DesiredPower::Stopped,
            pre_destroy_script: Some("/opt/teardown.sh".to_string()),
        };

        let raw = serde_json::to_value(&current).unwrap();
        let upgraded = upgrade(raw).unwrap();

        assert_eq!(upgraded, current);
    }

    #[test]
    fn future_version_is_rejected() {
        let raw = json!({ "version": 9, "machine_id": "m-1", "name": "x" });
        assert!(upgrade(raw).is_err());
    }
}

//! The persisted shape of a bridge setup.
//!
//! Enums are stored by name so reordering them never breaks saved profiles.
//! Reading and writing files is left to the host application.

use crate::bridge::EngineConfig;
use crate::catalog::DatarefEntry;
use crate::input::InputMapping;
use crate::logic::LogicBlock;
use crate::router::UniversalMapping;
use crate::{BridgeError, Result};
use device_link::LinkConfig;
use serde::{Deserialize, Serialize};
use sim_link::SimConfig;
use std::collections::{BTreeMap, HashSet};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub port: String,
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Legacy direct mode: source name → device key.
    #[serde(default)]
    pub subscriptions: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(default)]
    pub value: f32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeProfile {
    pub name: Option<String>,
    pub sim: SimConfig,
    pub link: LinkConfig,
    pub engine: EngineConfig,
    pub devices: Vec<DeviceProfile>,
    pub mappings: Vec<UniversalMapping>,
    pub monitored: Vec<String>,
    pub inputs: Vec<InputMapping>,
    pub logic: Vec<LogicBlock>,
    pub variables: Vec<VariableDecl>,
    pub datarefs: Vec<DatarefEntry>,
}

impl BridgeProfile {
    /// Reject profiles whose tables would silently collapse on load.
    pub fn validate(&self) -> Result<()> {
        let mut keys = HashSet::new();
        for m in &self.mappings {
            let key = m.key.trim().to_ascii_uppercase();
            if key.is_empty() || m.source.trim().is_empty() {
                return Err(BridgeError::Profile(format!(
                    "mapping {:?} -> {:?} is incomplete",
                    m.source, m.key
                )));
            }
            if !keys.insert(key.clone()) {
                return Err(BridgeError::Profile(format!("key {key} mapped twice")));
            }
        }

        let mut triggers = HashSet::new();
        for input in &self.inputs {
            if input.input_key.trim().is_empty() {
                return Err(BridgeError::Profile("input mapping without a key".into()));
            }
            if !triggers.insert((input.input_key.as_str(), input.device_port.as_deref())) {
                return Err(BridgeError::Profile(format!(
                    "input {} on {} mapped twice",
                    input.input_key,
                    input.device_port.as_deref().unwrap_or("any device")
                )));
            }
        }

        let mut blocks = HashSet::new();
        for block in self.logic.iter().filter(|b| !b.name.is_empty()) {
            if !blocks.insert(block.name.as_str()) {
                return Err(BridgeError::Profile(format!(
                    "logic block {} defined twice",
                    block.name
                )));
            }
        }

        let mut ports = HashSet::new();
        for device in &self.devices {
            if !ports.insert(device.port.as_str()) {
                return Err(BridgeError::Profile(format!(
                    "device {} listed twice",
                    device.port
                )));
            }
        }
        Ok(())
    }
}

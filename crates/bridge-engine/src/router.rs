//! Fan-out of source values to hardware keys.
//!
//! A universal mapping binds an uppercase key to one source name. When the
//! source changes the value goes to every ready board, but only when it moved
//! more than [`CHANGE_THRESHOLD`] from what that board last got for that key.

use crate::catalog::{DatarefCatalog, DatarefKind};
use crate::sinks::{DeviceOutput, SimOutput};
use crate::values::{ValueStore, VariableOrigin};
use crate::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

pub const CHANGE_THRESHOLD: f32 = 0.001;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniversalMapping {
    pub key: String,
    pub source: String,
    #[serde(default)]
    pub is_variable: bool,
}

/// What one push did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub sent: usize,
    pub suppressed: usize,
}

impl BroadcastOutcome {
    fn merge(&mut self, other: BroadcastOutcome) {
        self.sent += other.sent;
        self.suppressed += other.suppressed;
    }
}

pub struct BroadcastRouter {
    sim: Arc<dyn SimOutput>,
    devices: Arc<dyn DeviceOutput>,
    catalog: Arc<dyn DatarefCatalog>,
    values: Arc<ValueStore>,
    mappings: RwLock<BTreeMap<String, UniversalMapping>>,
    monitored: RwLock<BTreeSet<String>>,
    /// port → key → last value sent.
    last_sent: Mutex<HashMap<String, HashMap<String, f32>>>,
}

impl BroadcastRouter {
    pub fn new(
        sim: Arc<dyn SimOutput>,
        devices: Arc<dyn DeviceOutput>,
        catalog: Arc<dyn DatarefCatalog>,
        values: Arc<ValueStore>,
    ) -> Self {
        Self {
            sim,
            devices,
            catalog,
            values,
            mappings: RwLock::new(BTreeMap::new()),
            monitored: RwLock::new(BTreeSet::new()),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `key` to `source`. Returns true when a simulator source became
    /// monitored by this call and needs a subscription.
    pub fn set_mapping(&self, source: &str, key: &str, is_variable: bool) -> bool {
        let key = key.trim().to_ascii_uppercase();
        let previous = self.mappings.write().insert(
            key.clone(),
            UniversalMapping {
                key: key.clone(),
                source: source.to_string(),
                is_variable,
            },
        );
        if let Some(prev) = previous.filter(|p| p.source != source) {
            warn!(key = %key, old = %prev.source, new = source, "remapping key");
            self.forget_key(&key);
        }
        !is_variable && self.add_monitored(source)
    }

    pub fn remove_mapping(&self, key: &str) -> Option<UniversalMapping> {
        let key = key.trim().to_ascii_uppercase();
        let removed = self.mappings.write().remove(&key);
        if removed.is_some() {
            self.forget_key(&key);
        }
        removed
    }

    pub fn mapping(&self, key: &str) -> Option<UniversalMapping> {
        self.mappings
            .read()
            .get(&key.trim().to_ascii_uppercase())
            .cloned()
    }

    pub fn mappings(&self) -> Vec<UniversalMapping> {
        self.mappings.read().values().cloned().collect()
    }

    pub fn keys_for(&self, source: &str) -> Vec<String> {
        self.mappings
            .read()
            .values()
            .filter(|m| m.source == source)
            .map(|m| m.key.clone())
            .collect()
    }

    pub fn add_monitored(&self, source: &str) -> bool {
        self.monitored.write().insert(source.to_string())
    }

    pub fn remove_monitored(&self, source: &str) -> bool {
        self.monitored.write().remove(source)
    }

    pub fn monitored(&self) -> Vec<String> {
        self.monitored.read().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.mappings.write().clear();
        self.monitored.write().clear();
        self.last_sent.lock().clear();
    }

    /// Forget what `port` was sent so the next push reaches it again.
    pub fn forget_port(&self, port: &str) {
        self.last_sent.lock().remove(port);
    }

    fn forget_key(&self, key: &str) {
        for keys in self.last_sent.lock().values_mut() {
            keys.remove(key);
        }
    }

    /// Push a changed source to every ready board.
    pub fn on_source_changed(&self, source: &str, value: f32) -> BroadcastOutcome {
        let keys = self.keys_for(source);
        let ports = self.devices.ready_ports();
        let mut outcome = BroadcastOutcome::default();
        if ports.is_empty() {
            return outcome;
        }

        let mut covered: HashSet<(String, String)> = HashSet::new();
        for key in &keys {
            for port in &ports {
                outcome.merge(self.send_if_changed(port, key, value));
                covered.insert((port.clone(), key.clone()));
            }
        }
        for (port, key) in self.devices.subscribers_of(source) {
            if covered.contains(&(port.clone(), key.clone())) || !ports.contains(&port) {
                continue;
            }
            outcome.merge(self.send_if_changed(&port, &key, value));
        }
        outcome
    }

    /// Push a value straight to `key` on every ready board.
    pub fn push_key(&self, key: &str, value: f32) -> BroadcastOutcome {
        let key = key.trim().to_ascii_uppercase();
        let mut outcome = BroadcastOutcome::default();
        for port in self.devices.ready_ports() {
            outcome.merge(self.send_if_changed(&port, &key, value));
        }
        outcome
    }

    /// Re-send every mapped value `lookup` knows to one board.
    pub fn resync(&self, port: &str, lookup: impl Fn(&str) -> Option<f32>) -> BroadcastOutcome {
        self.forget_port(port);
        let mut outcome = BroadcastOutcome::default();
        for mapping in self.mappings() {
            if let Some(value) = lookup(&mapping.source) {
                outcome.merge(self.send_if_changed(port, &mapping.key, value));
            }
        }
        outcome
    }

    fn send_if_changed(&self, port: &str, key: &str, value: f32) -> BroadcastOutcome {
        let unchanged = self
            .last_sent
            .lock()
            .get(port)
            .and_then(|keys| keys.get(key))
            .is_some_and(|last| (value - last).abs() <= CHANGE_THRESHOLD);
        if unchanged {
            return BroadcastOutcome {
                sent: 0,
                suppressed: 1,
            };
        }
        match self.devices.send_value(port, key, value) {
            Ok(()) => {
                self.last_sent
                    .lock()
                    .entry(port.to_string())
                    .or_default()
                    .insert(key.to_string(), value);
                BroadcastOutcome {
                    sent: 1,
                    suppressed: 0,
                }
            }
            Err(e) => {
                debug!(port, key, error = %e, "broadcast not delivered");
                BroadcastOutcome::default()
            }
        }
    }

    /// Write `value` to whatever `key` is bound to, shaped by the source's
    /// declared kind. Unmapped keys are written as a raw float under their own name.
    pub fn broadcast_by_key(&self, key: &str, value: f32) -> Result<()> {
        let Some(mapping) = self.mapping(key) else {
            debug!(key, value, "unmapped key, raw write");
            self.sim.write_value(key, value)?;
            return Ok(());
        };
        let source = mapping.source.as_str();
        if mapping.is_variable {
            self.values.set(source, value, VariableOrigin::Custom);
            self.on_source_changed(source, value);
            return Ok(());
        }

        match self.catalog.kind(source) {
            Some(DatarefKind::Command) => {
                if value > 0.0 {
                    self.sim.send_command(source)?;
                }
            }
            Some(DatarefKind::Array { len }) => {
                let mut first_err = None;
                for i in 0..len {
                    if let Err(e) = self.sim.write_value(&format!("{source}[{i}]"), value) {
                        first_err.get_or_insert(e);
                    }
                }
                if let Some(e) = first_err {
                    return Err(e.into());
                }
            }
            Some(DatarefKind::String { len }) | Some(DatarefKind::Byte { len }) => {
                self.sim.write_string(source, &value.to_string(), len)?;
            }
            Some(DatarefKind::Bool) => {
                let v = if value != 0.0 { 1.0 } else { 0.0 };
                self.write_scalar(source, v)?;
            }
            Some(DatarefKind::Int) => self.write_scalar(source, value.trunc())?,
            Some(DatarefKind::Float) | None => self.write_scalar(source, value)?,
        }
        Ok(())
    }

    fn write_scalar(&self, source: &str, value: f32) -> Result<()> {
        self.values.set(source, value, VariableOrigin::Custom);
        self.sim.write_value(source, value)?;
        Ok(())
    }
}

//! The shared value store.
//!
//! Every name can hold one value per origin. Lookups answer with the first
//! origin present in the order logic, simulator, custom, hardware.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableOrigin {
    /// Reported live by the simulator.
    Simulator,
    /// Written locally: user variables and writes not yet echoed back.
    Custom,
    /// Computed by a logic block.
    Logic,
    /// Reported by a hardware input.
    Hardware,
}

impl VariableOrigin {
    const LOOKUP_ORDER: [VariableOrigin; 4] = [
        VariableOrigin::Logic,
        VariableOrigin::Simulator,
        VariableOrigin::Custom,
        VariableOrigin::Hardware,
    ];

    fn slot(self) -> usize {
        match self {
            VariableOrigin::Logic => 0,
            VariableOrigin::Simulator => 1,
            VariableOrigin::Custom => 2,
            VariableOrigin::Hardware => 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableEntry {
    pub name: String,
    pub value: f32,
    pub origin: VariableOrigin,
    #[serde(with = "time::serde::rfc3339")]
    pub updated: OffsetDateTime,
}

type Slots = [Option<(f32, OffsetDateTime)>; 4];

#[derive(Default)]
pub struct ValueStore {
    slots: RwLock<HashMap<String, Slots>>,
    declared: RwLock<BTreeSet<String>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, value: f32, origin: VariableOrigin) {
        let mut slots = self.slots.write();
        let entry = slots.entry(name.to_string()).or_default();
        entry[origin.slot()] = Some((value, OffsetDateTime::now_utc()));
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.entry(name).map(|e| e.value)
    }

    pub fn get_from(&self, name: &str, origin: VariableOrigin) -> Option<f32> {
        self.slots
            .read()
            .get(name)
            .and_then(|s| s[origin.slot()])
            .map(|(v, _)| v)
    }

    /// The winning entry for `name`.
    pub fn entry(&self, name: &str) -> Option<VariableEntry> {
        let slots = self.slots.read();
        let held = slots.get(name)?;
        resolve(name, held)
    }

    pub fn remove(&self, name: &str, origin: VariableOrigin) {
        let mut slots = self.slots.write();
        if let Some(held) = slots.get_mut(name) {
            held[origin.slot()] = None;
            if held.iter().all(Option::is_none) {
                slots.remove(name);
            }
        }
    }

    /// Register a user variable, optionally seeding its value.
    pub fn declare(&self, name: &str, initial: Option<f32>) {
        self.declared.write().insert(name.to_string());
        if let Some(v) = initial {
            self.set(name, v, VariableOrigin::Custom);
        }
    }

    pub fn undeclare(&self, name: &str) -> bool {
        let removed = self.declared.write().remove(name);
        if removed {
            self.remove(name, VariableOrigin::Custom);
        }
        removed
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.declared.read().contains(name)
    }

    pub fn declared(&self) -> Vec<String> {
        self.declared.read().iter().cloned().collect()
    }

    /// Drop every declaration and every locally computed value. Live
    /// simulator and hardware values stay.
    pub fn reset_local(&self) {
        self.declared.write().clear();
        let mut slots = self.slots.write();
        for held in slots.values_mut() {
            held[VariableOrigin::Custom.slot()] = None;
            held[VariableOrigin::Logic.slot()] = None;
        }
        slots.retain(|_, held| held.iter().any(Option::is_some));
    }

    /// Every name with its winning entry, sorted by name.
    pub fn snapshot(&self) -> Vec<VariableEntry> {
        let slots = self.slots.read();
        let mut out: Vec<VariableEntry> = slots
            .iter()
            .filter_map(|(name, held)| resolve(name, held))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

fn resolve(name: &str, held: &Slots) -> Option<VariableEntry> {
    VariableOrigin::LOOKUP_ORDER.iter().find_map(|&origin| {
        held[origin.slot()].map(|(value, updated)| VariableEntry {
            name: name.to_string(),
            value,
            origin,
            updated,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_prefers_logic_then_simulator_then_custom_then_hardware() {
        let store = ValueStore::new();
        store.set("x", 4.0, VariableOrigin::Hardware);
        assert_eq!(store.get("x"), Some(4.0));
        store.set("x", 3.0, VariableOrigin::Custom);
        assert_eq!(store.get("x"), Some(3.0));
        store.set("x", 2.0, VariableOrigin::Simulator);
        assert_eq!(store.get("x"), Some(2.0));
        store.set("x", 1.0, VariableOrigin::Logic);
        assert_eq!(store.entry("x").map(|e| e.origin), Some(VariableOrigin::Logic));

        store.remove("x", VariableOrigin::Logic);
        assert_eq!(store.get("x"), Some(2.0));
        assert_eq!(store.get_from("x", VariableOrigin::Hardware), Some(4.0));
    }

    #[test]
    fn reset_local_keeps_live_values() {
        let store = ValueStore::new();
        store.declare("armed", Some(1.0));
        store.set("gear", 1.0, VariableOrigin::Simulator);
        store.set("block", 1.0, VariableOrigin::Logic);
        assert!(store.is_declared("armed"));

        store.reset_local();
        assert!(!store.is_declared("armed"));
        assert_eq!(store.get("armed"), None);
        assert_eq!(store.get("block"), None);
        assert_eq!(store.get("gear"), Some(1.0));
        assert_eq!(store.snapshot().len(), 1);
    }
}

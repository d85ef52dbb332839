//! Virtual variables: boolean blocks evaluated over live values.
//!
//! Each tick every enabled block combines its conditions through its gate and
//! publishes 0.0 or 1.0 under its name. A true block drives its outputs:
//! `set` outputs are held at their value, `toggle` and `command` outputs fire
//! once per false → true edge. A `set` aimed at a command fires on the edge too.

use crate::conditions::{evaluate_each, Condition, LogicGate};
use crate::resolver::ValueResolver;
use crate::router::CHANGE_THRESHOLD;
use crate::target::Target;
use crate::values::VariableOrigin;
use crate::{BridgeError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputAction {
    #[default]
    Set,
    Toggle,
    Command,
}

fn one() -> f32 {
    1.0
}

fn yes() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogicOutput {
    pub target: Target,
    #[serde(default = "one")]
    pub value: f32,
    #[serde(default)]
    pub action: OutputAction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogicBlock {
    /// Empty for an anonymous block, which only drives its outputs and key.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub logic_gate: LogicGate,
    #[serde(default)]
    pub outputs: Vec<LogicOutput>,
    #[serde(default)]
    pub initial_value: Option<f32>,
    #[serde(default)]
    pub output_key: Option<String>,
    #[serde(default = "yes")]
    pub enabled: bool,
}

impl LogicBlock {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            conditions: Vec::new(),
            logic_gate: LogicGate::And,
            outputs: Vec::new(),
            initial_value: None,
            output_key: None,
            enabled: true,
        }
    }

    /// False when there is nothing to evaluate or any referenced value is missing.
    pub fn evaluate(&self, lookup: impl Fn(&str) -> Option<f32>) -> bool {
        match evaluate_each(&self.conditions, lookup) {
            Some(results) if !results.is_empty() => self.logic_gate.combine(&results),
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct LogicEngine {
    blocks: RwLock<Vec<LogicBlock>>,
    last: Mutex<HashMap<String, bool>>,
    firing: Mutex<HashSet<String>>,
}

fn state_key(index: usize, block: &LogicBlock) -> String {
    if block.name.is_empty() {
        format!("#{index}")
    } else {
        block.name.clone()
    }
}

impl LogicEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block, replacing any block of the same name in place.
    pub fn add_block(&self, block: LogicBlock) -> Option<LogicBlock> {
        if let Some(init) = block.initial_value.filter(|_| !block.name.is_empty()) {
            self.last.lock().insert(block.name.clone(), init > 0.5);
        }
        let mut blocks = self.blocks.write();
        if !block.name.is_empty() {
            if let Some(slot) = blocks.iter_mut().find(|b| b.name == block.name) {
                info!(block = %block.name, "replacing logic block");
                return Some(std::mem::replace(slot, block));
            }
        }
        blocks.push(block);
        None
    }

    pub fn remove_block(&self, name: &str) -> Option<LogicBlock> {
        let mut blocks = self.blocks.write();
        let idx = blocks.iter().position(|b| b.name == name)?;
        self.last.lock().remove(name);
        Some(blocks.remove(idx))
    }

    pub fn contains(&self, name: &str) -> bool {
        !name.is_empty() && self.blocks.read().iter().any(|b| b.name == name)
    }

    pub fn block(&self, name: &str) -> Option<LogicBlock> {
        self.blocks.read().iter().find(|b| b.name == name).cloned()
    }

    pub fn blocks(&self) -> Vec<LogicBlock> {
        self.blocks.read().clone()
    }

    pub fn clear(&self) {
        self.blocks.write().clear();
        self.last.lock().clear();
    }

    /// Evaluate every enabled block once. Returns how many were evaluated.
    pub fn tick(&self, resolver: &ValueResolver) -> usize {
        let blocks = self.blocks();
        let mut evaluated = 0;
        for (idx, block) in blocks.iter().enumerate().filter(|(_, b)| b.enabled) {
            let state = block.evaluate(|n| resolver.value(n));
            let previous = self.last.lock().insert(state_key(idx, block), state);
            self.publish(block, state, previous != Some(state), resolver);
            if state {
                self.fire_outputs(block, previous != Some(true), resolver);
            }
            evaluated += 1;
        }
        evaluated
    }

    /// Re-evaluate one block now and, if true, fire all of its outputs.
    pub fn trigger(&self, name: &str, resolver: &ValueResolver) -> Result<bool> {
        let block = self
            .block(name)
            .ok_or_else(|| BridgeError::UnknownBlock(name.to_string()))?;
        if !self.firing.lock().insert(name.to_string()) {
            return Err(BridgeError::TriggerCycle(name.to_string()));
        }
        let state = block.evaluate(|n| resolver.value(n));
        let previous = self.last.lock().insert(name.to_string(), state);
        self.publish(&block, state, previous != Some(state), resolver);
        if state {
            self.fire_outputs(&block, true, resolver);
        }
        self.firing.lock().remove(name);
        Ok(state)
    }

    fn publish(&self, block: &LogicBlock, state: bool, changed: bool, resolver: &ValueResolver) {
        let value = if state { 1.0 } else { 0.0 };
        if !block.name.is_empty() {
            resolver
                .values()
                .set(&block.name, value, VariableOrigin::Logic);
        }
        if !changed {
            return;
        }
        debug!(block = %block.name, state, "logic block changed");
        if !block.name.is_empty() {
            resolver.router().on_source_changed(&block.name, value);
        }
        if let Some(key) = &block.output_key {
            let routed = resolver
                .router()
                .mapping(key)
                .is_some_and(|m| m.source == block.name);
            if !routed {
                resolver.router().push_key(key, value);
            }
        }
    }

    fn fire_outputs(&self, block: &LogicBlock, rising: bool, resolver: &ValueResolver) {
        for output in &block.outputs {
            let result = match output.action {
                OutputAction::Set if resolver.is_command(&output.target) => {
                    if !rising {
                        continue;
                    }
                    resolver.apply(&output.target, output.value)
                }
                OutputAction::Set => {
                    let current = resolver.target_value(&output.target);
                    if current.is_some_and(|c| (c - output.value).abs() <= CHANGE_THRESHOLD) {
                        continue;
                    }
                    resolver.apply(&output.target, output.value)
                }
                OutputAction::Toggle if rising => {
                    let current = resolver.target_value(&output.target).unwrap_or(0.0);
                    let next = if current > 0.5 { 0.0 } else { 1.0 };
                    resolver.apply(&output.target, next)
                }
                OutputAction::Command if rising => resolver.fire_command(&output.target),
                OutputAction::Toggle | OutputAction::Command => continue,
            };
            if let Err(e) = result {
                debug!(block = %block.name, target = %output.target, error = %e, "logic output failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DatarefKind;
    use crate::conditions::Operator;
    use crate::testing::rig;

    fn two_condition_block(name: &str, gate: LogicGate) -> LogicBlock {
        LogicBlock {
            conditions: vec![
                Condition::new("a", Operator::Greater, 0.5),
                Condition::new("b", Operator::Greater, 0.5),
            ],
            logic_gate: gate,
            ..LogicBlock::new(name)
        }
    }

    #[test]
    fn xor_needs_exactly_one_and_needs_both() {
        let r = rig();
        let logic = r.resolver.logic();
        logic.add_block(two_condition_block("x", LogicGate::Xor));
        logic.add_block(two_condition_block("y", LogicGate::And));

        for (a, b, xor, and) in [
            (0.0, 0.0, 0.0, 0.0),
            (1.0, 0.0, 1.0, 0.0),
            (0.0, 1.0, 1.0, 0.0),
            (1.0, 1.0, 0.0, 1.0),
        ] {
            r.values.set("a", a, VariableOrigin::Simulator);
            r.values.set("b", b, VariableOrigin::Simulator);
            assert_eq!(logic.tick(&r.resolver), 2);
            assert_eq!(r.values.get("x"), Some(xor), "xor a={a} b={b}");
            assert_eq!(r.values.get("y"), Some(and), "and a={a} b={b}");
        }
    }

    #[test]
    fn missing_values_and_empty_blocks_are_false() {
        let r = rig();
        let logic = r.resolver.logic();
        logic.add_block(two_condition_block("x", LogicGate::Nor));
        logic.add_block(LogicBlock::new("empty"));
        logic.tick(&r.resolver);
        assert_eq!(r.values.get("x"), Some(0.0));
        assert_eq!(r.values.get("empty"), Some(0.0));
    }

    #[test]
    fn set_holds_while_toggle_and_command_fire_on_edges() {
        let r = rig();
        let logic = r.resolver.logic();
        logic.add_block(LogicBlock {
            conditions: vec![Condition::new("a", Operator::Equal, 1.0)],
            outputs: vec![
                LogicOutput {
                    target: Target::parse("sim/held").unwrap(),
                    value: 1.0,
                    action: OutputAction::Set,
                },
                LogicOutput {
                    target: Target::parse("sim/flip").unwrap(),
                    value: 1.0,
                    action: OutputAction::Toggle,
                },
                LogicOutput {
                    target: Target::parse("CMD:sim/horn").unwrap(),
                    value: 1.0,
                    action: OutputAction::Command,
                },
            ],
            ..LogicBlock::new("blk")
        });
        r.values.set("a", 1.0, VariableOrigin::Simulator);

        logic.tick(&r.resolver);
        logic.tick(&r.resolver);
        assert_eq!(r.sim.commands(), vec!["sim/horn".to_string()]);
        assert_eq!(
            r.sim.writes(),
            vec![("sim/held".to_string(), 1.0), ("sim/flip".to_string(), 1.0)]
        );

        // The simulator moved the held value away; it is put back.
        r.values.set("sim/held", 0.0, VariableOrigin::Simulator);
        logic.tick(&r.resolver);
        assert_eq!(r.sim.writes().len(), 3);

        // Falling then rising again fires the edge outputs once more.
        r.values.set("a", 0.0, VariableOrigin::Simulator);
        logic.tick(&r.resolver);
        r.values.set("a", 1.0, VariableOrigin::Simulator);
        logic.tick(&r.resolver);
        assert_eq!(r.sim.commands().len(), 2);
        assert_eq!(r.values.get("sim/flip"), Some(0.0));
    }

    #[test]
    fn set_on_a_command_fires_once_per_edge() {
        let r = rig();
        r.catalog.insert("sim/engage", DatarefKind::Command);
        let logic = r.resolver.logic();
        logic.add_block(LogicBlock {
            conditions: vec![Condition::new("a", Operator::Equal, 1.0)],
            outputs: vec![LogicOutput {
                target: Target::parse("sim/engage").unwrap(),
                value: 1.0,
                action: OutputAction::Set,
            }],
            ..LogicBlock::new("engage_when_a")
        });
        r.values.set("a", 1.0, VariableOrigin::Simulator);
        for _ in 0..3 {
            logic.tick(&r.resolver);
        }
        assert_eq!(r.sim.commands(), vec!["sim/engage".to_string()]);

        r.values.set("a", 0.0, VariableOrigin::Simulator);
        logic.tick(&r.resolver);
        r.values.set("a", 1.0, VariableOrigin::Simulator);
        logic.tick(&r.resolver);
        assert_eq!(r.sim.commands().len(), 2);
        assert!(r.sim.writes().is_empty());
    }

    #[test]
    fn output_keys_reach_hardware() {
        let r = rig();
        let logic = r.resolver.logic();
        let mut anon = two_condition_block("", LogicGate::Or);
        anon.output_key = Some("led1".into());
        logic.add_block(anon);
        r.values.set("a", 1.0, VariableOrigin::Simulator);
        r.values.set("b", 0.0, VariableOrigin::Simulator);
        logic.tick(&r.resolver);
        logic.tick(&r.resolver);
        assert_eq!(r.devices.sent(), vec![("COM1".into(), "LED1".into(), 1.0)]);

        r.resolver.router().set_mapping("named", "LED2", true);
        let mut named = two_condition_block("named", LogicGate::And);
        named.output_key = Some("LED2".into());
        logic.add_block(named);
        r.values.set("b", 1.0, VariableOrigin::Simulator);
        logic.tick(&r.resolver);
        assert!(r.devices.sent().contains(&("COM1".into(), "LED2".into(), 1.0)));
    }

    #[test]
    fn add_replaces_by_name_and_trigger_checks_names() {
        let r = rig();
        let logic = r.resolver.logic();
        assert!(logic.add_block(LogicBlock::new("a")).is_none());
        assert!(logic.add_block(LogicBlock::new("a")).is_some());
        assert_eq!(logic.blocks().len(), 1);
        assert!(matches!(
            logic.trigger("nope", &r.resolver),
            Err(BridgeError::UnknownBlock(_))
        ));
        assert!(logic.remove_block("a").is_some());
        assert!(!logic.contains("a"));
    }

    #[test]
    fn blocks_that_trigger_each_other_terminate() {
        let r = rig();
        let logic = r.resolver.logic();
        r.values.set("on", 1.0, VariableOrigin::Simulator);
        for (name, other) in [("ping", "pong"), ("pong", "ping")] {
            logic.add_block(LogicBlock {
                conditions: vec![Condition::new("on", Operator::Equal, 1.0)],
                outputs: vec![LogicOutput {
                    target: Target::parse(other).unwrap(),
                    value: 1.0,
                    action: OutputAction::Command,
                }],
                ..LogicBlock::new(name)
            });
        }
        assert!(logic.trigger("ping", &r.resolver).unwrap());
        assert_eq!(r.values.get("pong"), Some(1.0));
    }
}

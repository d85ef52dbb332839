//! Hardware input → simulator actions.
//!
//! A mapping is identified by `(input_key, device_port)`; a mapping without a
//! port matches that key on every device. Every matching, enabled mapping whose
//! conditions pass is dispatched; axis mappings skip the condition check.

use crate::axis::AxisConfig;
use crate::conditions::{conditions_pass, Condition, ConditionLogic};
use crate::resolver::ValueResolver;
use crate::router::CHANGE_THRESHOLD;
use crate::sequence::{SequenceConfig, SequenceRun, SequenceRunner, SequenceStep, StepKind};
use crate::target::Target;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputAction {
    Command,
    Set,
    Toggle,
    Increment,
    Decrement,
    Axis,
    Sequence,
}

fn one() -> f32 {
    1.0
}

fn yes() -> bool {
    true
}

fn default_repeat_delay_ms() -> u64 {
    50
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetAction {
    pub target: Target,
    #[serde(default = "one")]
    pub value_on: f32,
    #[serde(default)]
    pub value_off: f32,
}

impl TargetAction {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            value_on: 1.0,
            value_off: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputMapping {
    pub input_key: String,
    /// `None` matches the key on any device.
    #[serde(default)]
    pub device_port: Option<String>,
    pub action: InputAction,
    #[serde(default)]
    pub targets: Vec<TargetAction>,
    /// Older single-target form, folded into `targets` when the mapping is added.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub condition_logic: ConditionLogic,
    #[serde(default)]
    pub axis: AxisConfig,
    #[serde(default = "one")]
    pub increment: f32,
    #[serde(default = "one")]
    pub multiplier: f32,
    #[serde(default)]
    pub min: Option<f32>,
    #[serde(default)]
    pub max: Option<f32>,
    #[serde(default)]
    pub wrap: bool,
    #[serde(default = "default_repeat_delay_ms")]
    pub repeat_delay_ms: u64,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub init_value: Option<f32>,
    #[serde(default = "yes")]
    pub enabled: bool,
}

impl InputMapping {
    pub fn new(input_key: &str, action: InputAction, targets: Vec<TargetAction>) -> Self {
        Self {
            input_key: input_key.to_string(),
            device_port: None,
            action,
            targets,
            target: None,
            conditions: Vec::new(),
            condition_logic: ConditionLogic::And,
            axis: AxisConfig::default(),
            increment: 1.0,
            multiplier: 1.0,
            min: None,
            max: None,
            wrap: false,
            repeat_delay_ms: default_repeat_delay_ms(),
            sequence: SequenceConfig::default(),
            init_value: None,
            enabled: true,
        }
    }

    pub fn on_port(mut self, port: &str) -> Self {
        self.device_port = Some(port.to_string());
        self
    }

    fn normalized(mut self) -> Self {
        if let Some(target) = self.target.take() {
            if self.targets.is_empty() {
                self.targets.push(TargetAction::new(target));
            }
        }
        self
    }

    fn same_trigger(&self, other: &InputMapping) -> bool {
        self.input_key == other.input_key && self.device_port == other.device_port
    }

    fn matches(&self, port: &str, key: &str) -> bool {
        self.enabled
            && self.input_key == key
            && self.device_port.as_deref().map_or(true, |p| p == port)
    }

    fn applies_to_port(&self, port: &str) -> bool {
        self.device_port.as_deref().map_or(true, |p| p == port)
    }

    fn id(&self) -> String {
        format!(
            "{}:{}",
            self.device_port.as_deref().unwrap_or("*"),
            self.input_key
        )
    }

    /// New value after one step of size `delta`, bounded by min/max.
    fn step_value(&self, current: f32, delta: f32) -> f32 {
        let next = current + delta;
        match (self.min, self.max) {
            (Some(lo), Some(hi)) if self.wrap && hi > lo => lo + (next - lo).rem_euclid(hi - lo),
            (Some(lo), Some(hi)) => next.clamp(lo.min(hi), hi.max(lo)),
            (Some(lo), None) => next.max(lo),
            (None, Some(hi)) => next.min(hi),
            (None, None) => next,
        }
    }
}

pub struct InputProcessor {
    resolver: Arc<ValueResolver>,
    mappings: RwLock<Vec<InputMapping>>,
    /// Last value this processor wrote per target.
    tracked: Mutex<HashMap<Target, f32>>,
    /// Last axis output per (mapping, target).
    axis_last: Mutex<HashMap<(String, Target), f32>>,
    sequences: SequenceRunner,
    repeat_pause: Duration,
}

impl InputProcessor {
    pub fn new(resolver: Arc<ValueResolver>, repeat_pause: Duration) -> Self {
        Self {
            resolver,
            mappings: RwLock::new(Vec::new()),
            tracked: Mutex::new(HashMap::new()),
            axis_last: Mutex::new(HashMap::new()),
            sequences: SequenceRunner::new(),
            repeat_pause,
        }
    }

    /// Add a mapping, replacing the one with the same key and port.
    pub fn add_mapping(&self, mapping: InputMapping) -> Option<InputMapping> {
        let mapping = mapping.normalized();
        let mut mappings = self.mappings.write();
        if let Some(slot) = mappings.iter_mut().find(|m| m.same_trigger(&mapping)) {
            info!(input = %mapping.input_key, port = ?mapping.device_port, "replacing input mapping");
            return Some(std::mem::replace(slot, mapping));
        }
        mappings.push(mapping);
        None
    }

    pub fn remove_mapping(&self, input_key: &str, device_port: Option<&str>) -> Option<InputMapping> {
        let mut mappings = self.mappings.write();
        let idx = mappings
            .iter()
            .position(|m| m.input_key == input_key && m.device_port.as_deref() == device_port)?;
        let removed = mappings.remove(idx);
        self.sequences.cancel(&removed.id());
        Some(removed)
    }

    pub fn mappings(&self) -> Vec<InputMapping> {
        self.mappings.read().clone()
    }

    pub fn clear(&self) {
        self.sequences.cancel_all();
        self.mappings.write().clear();
        self.tracked.lock().clear();
        self.axis_last.lock().clear();
    }

    pub fn cancel_all(&self) {
        self.sequences.cancel_all();
    }

    pub fn active_sequences(&self) -> usize {
        self.sequences.active()
    }

    /// Handle one raw input event. Returns how many mappings were dispatched.
    /// A port-specific mapping and a wildcard on the same key both run, the
    /// port-specific one first.
    pub fn process_input(&self, port: &str, key: &str, raw: f32) -> usize {
        let mut matching: Vec<InputMapping> = self
            .mappings
            .read()
            .iter()
            .filter(|m| m.matches(port, key))
            .cloned()
            .collect();
        matching.sort_by_key(|m| m.device_port.is_none());
        let mut dispatched = 0;
        for mapping in &matching {
            if mapping.action != InputAction::Axis
                && !conditions_pass(&mapping.conditions, mapping.condition_logic, |n| {
                    self.resolver.value(n)
                })
            {
                debug!(port, input = key, "conditions not met");
                continue;
            }
            self.dispatch(port, mapping, raw);
            dispatched += 1;
        }
        dispatched
    }

    /// Write every `init_value` that applies to `port`.
    pub fn apply_init_values(&self, port: &str) -> usize {
        let mappings = self.mappings();
        let mut applied = 0;
        for mapping in mappings.iter().filter(|m| m.enabled && m.applies_to_port(port)) {
            let Some(value) = mapping.init_value else {
                continue;
            };
            for t in &mapping.targets {
                self.write(&t.target, value);
                applied += 1;
            }
        }
        if applied > 0 {
            info!(port, applied, "initial values written");
        }
        applied
    }

    fn dispatch(&self, port: &str, mapping: &InputMapping, raw: f32) {
        let pressed = raw > 0.0;
        match mapping.action {
            InputAction::Command => {
                if pressed {
                    for t in &mapping.targets {
                        self.log_err(&t.target, self.resolver.fire_command(&t.target));
                    }
                }
            }
            InputAction::Set => {
                for t in &mapping.targets {
                    self.write(&t.target, if pressed { t.value_on } else { t.value_off });
                }
            }
            InputAction::Toggle => {
                if pressed {
                    for t in &mapping.targets {
                        let next = if self.current(&t.target) > 0.5 {
                            t.value_off
                        } else {
                            t.value_on
                        };
                        self.write(&t.target, next);
                    }
                }
            }
            InputAction::Increment | InputAction::Decrement => {
                self.step(mapping, raw);
            }
            InputAction::Axis => {
                let shaped = mapping.axis.shape(raw);
                for t in &mapping.targets {
                    let slot = (mapping.id(), t.target.clone());
                    let unchanged = self
                        .axis_last
                        .lock()
                        .get(&slot)
                        .is_some_and(|last| (shaped - last).abs() <= CHANGE_THRESHOLD);
                    if unchanged {
                        continue;
                    }
                    self.axis_last.lock().insert(slot, shaped);
                    self.write(&t.target, shaped);
                }
            }
            InputAction::Sequence => self.sequence(port, mapping, pressed),
        }
    }

    fn step(&self, mapping: &InputMapping, raw: f32) {
        if raw == 0.0 {
            return;
        }
        let sign = if mapping.action == InputAction::Decrement {
            -raw.signum()
        } else {
            raw.signum()
        };
        for t in &mapping.targets {
            if self.resolver.is_command(&t.target) {
                self.burst(mapping, &t.target);
                continue;
            }
            let delta = mapping.increment * mapping.multiplier * sign;
            let next = mapping.step_value(self.current(&t.target), delta);
            self.write(&t.target, next);
        }
    }

    /// Fire a command `ceil(multiplier)` times, `repeat_delay_ms` apart.
    fn burst(&self, mapping: &InputMapping, target: &Target) {
        let times = mapping.multiplier.ceil().max(1.0) as usize;
        if times == 1 || mapping.repeat_delay_ms == 0 {
            for _ in 0..times {
                self.log_err(target, self.resolver.fire_command(target));
            }
            return;
        }
        let steps = (0..times)
            .map(|_| SequenceStep {
                kind: StepKind::Command,
                target: target.clone(),
                value: 1.0,
                delay_ms: mapping.repeat_delay_ms,
            })
            .collect();
        let run = SequenceRun {
            steps,
            guard: None,
            repeat_while_held: false,
            pause: self.repeat_pause,
        };
        self.sequences
            .start_detached(run, Arc::clone(&self.resolver));
    }

    fn sequence(&self, port: &str, mapping: &InputMapping, pressed: bool) {
        let id = format!("{port}|{}", mapping.id());
        let cfg = &mapping.sequence;
        let guard = cfg
            .stop_on_error
            .then(|| (mapping.conditions.clone(), mapping.condition_logic));
        if pressed {
            let run = SequenceRun {
                steps: cfg.steps.clone(),
                guard,
                repeat_while_held: cfg.repeat_while_held,
                pause: self.repeat_pause,
            };
            self.sequences
                .start(&id, run, Arc::clone(&self.resolver));
        } else {
            self.sequences.release(&id);
            if cfg.reverse_on_release {
                let run = SequenceRun {
                    steps: cfg.reversed_steps(),
                    guard,
                    repeat_while_held: false,
                    pause: self.repeat_pause,
                };
                self.sequences
                    .start(&id, run, Arc::clone(&self.resolver));
            }
        }
    }

    /// Live value if known, else what this processor last wrote, else zero.
    fn current(&self, target: &Target) -> f32 {
        self.resolver
            .target_value(target)
            .or_else(|| self.tracked.lock().get(target).copied())
            .unwrap_or(0.0)
    }

    fn write(&self, target: &Target, value: f32) {
        self.tracked.lock().insert(target.clone(), value);
        self.log_err(target, self.resolver.apply(target, value));
    }

    fn log_err<T>(&self, target: &Target, result: crate::Result<T>) {
        if let Err(e) = result {
            debug!(target = %target, error = %e, "input write failed");
        }
    }
}

impl Drop for InputProcessor {
    fn drop(&mut self) {
        self.sequences.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DatarefKind;
    use crate::conditions::Operator;
    use crate::testing::{rig, Rig};
    use crate::values::VariableOrigin;
    use std::time::Instant;

    fn processor(r: &Rig) -> InputProcessor {
        InputProcessor::new(r.resolver.clone(), Duration::from_millis(20))
    }

    fn to(target: &str) -> Vec<TargetAction> {
        vec![TargetAction::new(Target::parse(target).unwrap())]
    }

    #[test]
    fn toggle_twice_restores_the_value() {
        let r = rig();
        let p = processor(&r);
        p.add_mapping(InputMapping::new("BTN1", InputAction::Toggle, to("sim/beacon")));
        p.process_input("COM1", "BTN1", 1.0);
        p.process_input("COM1", "BTN1", 0.0);
        assert_eq!(r.values.get("sim/beacon"), Some(1.0));
        p.process_input("COM1", "BTN1", 1.0);
        assert_eq!(r.values.get("sim/beacon"), Some(0.0));
        assert_eq!(r.sim.writes().len(), 2);
    }

    #[test]
    fn command_fires_on_press_only() {
        let r = rig();
        let p = processor(&r);
        p.add_mapping(InputMapping::new(
            "BTN",
            InputAction::Command,
            to("CMD:sim/autopilot/servos_toggle"),
        ));
        p.process_input("COM1", "BTN", 1.0);
        p.process_input("COM1", "BTN", 0.0);
        assert_eq!(r.sim.commands(), vec!["sim/autopilot/servos_toggle".to_string()]);
    }

    #[test]
    fn set_writes_on_and_off_values() {
        let r = rig();
        let p = processor(&r);
        let mut m = InputMapping::new("SW", InputAction::Set, to("sim/gear"));
        m.targets[0].value_off = -1.0;
        p.add_mapping(m);
        p.process_input("COM1", "SW", 1.0);
        p.process_input("COM1", "SW", 0.0);
        assert_eq!(
            r.sim.writes(),
            vec![("sim/gear".to_string(), 1.0), ("sim/gear".to_string(), -1.0)]
        );
    }

    #[test]
    fn port_specific_mappings_replace_by_identity() {
        let r = rig();
        let p = processor(&r);
        assert!(p
            .add_mapping(InputMapping::new("B", InputAction::Set, to("sim/a")).on_port("COM1"))
            .is_none());
        assert!(p
            .add_mapping(InputMapping::new("B", InputAction::Set, to("sim/b")).on_port("COM1"))
            .is_some());
        assert!(p
            .add_mapping(InputMapping::new("B", InputAction::Set, to("sim/c")))
            .is_none());
        assert_eq!(p.mappings().len(), 2);

        assert_eq!(p.process_input("COM2", "B", 1.0), 1);
        assert_eq!(p.process_input("COM1", "B", 1.0), 2);
        let names: Vec<String> = r.sim.writes().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["sim/c", "sim/b", "sim/c"]);
        assert!(p.remove_mapping("B", Some("COM1")).is_some());
    }

    #[test]
    fn port_specific_mapping_runs_before_the_wildcard() {
        let r = rig();
        let p = processor(&r);
        p.add_mapping(InputMapping::new("SW", InputAction::Set, to("VAR:mode")));
        let mut specific = InputMapping::new("SW", InputAction::Set, to("VAR:mode")).on_port("COM1");
        specific.targets[0].value_on = 2.0;
        p.add_mapping(specific);
        r.values.declare("mode", Some(0.0));

        assert_eq!(p.process_input("COM1", "SW", 1.0), 2);
        assert_eq!(r.values.get("mode"), Some(1.0));
        assert_eq!(p.process_input("COM2", "SW", 1.0), 1);
        assert_eq!(r.values.get("mode"), Some(1.0));
    }

    #[test]
    fn legacy_target_is_folded_in() {
        let r = rig();
        let p = processor(&r);
        let mut m = InputMapping::new("B", InputAction::Set, Vec::new());
        m.target = Some(Target::parse("sim/x").unwrap());
        p.add_mapping(m);
        let stored = &p.mappings()[0];
        assert_eq!(stored.targets.len(), 1);
        assert!(stored.target.is_none());
    }

    #[test]
    fn conditions_gate_everything_but_axes() {
        let r = rig();
        let p = processor(&r);
        let mut gated = InputMapping::new("B", InputAction::Set, to("sim/a"));
        gated.conditions = vec![Condition::new("sim/battery", Operator::Equal, 1.0)];
        p.add_mapping(gated);
        let mut axis = InputMapping::new("X", InputAction::Axis, to("sim/yoke"));
        axis.conditions = vec![Condition::new("sim/battery", Operator::Equal, 1.0)];
        p.add_mapping(axis);

        assert_eq!(p.process_input("COM1", "B", 1.0), 0);
        assert_eq!(p.process_input("COM1", "X", 0.5), 1);
        r.values.set("sim/battery", 1.0, VariableOrigin::Simulator);
        assert_eq!(p.process_input("COM1", "B", 1.0), 1);
    }

    #[test]
    fn increments_clamp_and_wrap() {
        let r = rig();
        let p = processor(&r);
        let mut hdg = InputMapping::new("ENC", InputAction::Increment, to("sim/hdg"));
        hdg.min = Some(0.0);
        hdg.max = Some(360.0);
        hdg.wrap = true;
        hdg.multiplier = 5.0;
        p.add_mapping(hdg);
        let mut alt = InputMapping::new("ALT", InputAction::Decrement, to("sim/alt"));
        alt.increment = 100.0;
        alt.min = Some(0.0);
        alt.max = Some(1000.0);
        p.add_mapping(alt);

        r.values.set("sim/hdg", 358.0, VariableOrigin::Simulator);
        p.process_input("COM1", "ENC", 1.0);
        assert_eq!(r.sim.writes().last().map(|w| w.1), Some(3.0));

        r.values.set("sim/alt", 50.0, VariableOrigin::Simulator);
        p.process_input("COM1", "ALT", 1.0);
        assert_eq!(r.sim.writes().last().map(|w| w.1), Some(0.0));
        r.values.set("sim/alt", 900.0, VariableOrigin::Simulator);
        p.process_input("COM1", "ALT", -1.0);
        assert_eq!(r.sim.writes().last().map(|w| w.1), Some(1000.0));
    }

    #[tokio::test]
    async fn command_increments_fire_repeatedly() {
        let r = rig();
        r.catalog
            .insert("sim/autopilot/heading_up", DatarefKind::Command);
        let p = processor(&r);
        let mut m = InputMapping::new("ENC", InputAction::Increment, to("sim/autopilot/heading_up"));
        m.multiplier = 2.5;
        m.repeat_delay_ms = 5;
        p.add_mapping(m);
        p.process_input("COM1", "ENC", 1.0);

        let deadline = Instant::now() + Duration::from_secs(2);
        while p.active_sequences() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(r.sim.commands().len(), 3);
    }

    #[test]
    fn axis_writes_only_on_real_change() {
        let r = rig();
        let p = processor(&r);
        let mut m = InputMapping::new("THR", InputAction::Axis, to("sim/throttle"));
        m.axis = AxisConfig {
            input_min: 0.0,
            input_max: 1000.0,
            output_min: 0.0,
            output_max: 1.0,
            ..AxisConfig::default()
        };
        p.add_mapping(m);
        p.process_input("COM1", "THR", 500.0);
        p.process_input("COM1", "THR", 500.5);
        p.process_input("COM1", "THR", 510.0);
        let values: Vec<f32> = r.sim.writes().into_iter().map(|(_, v)| v).collect();
        assert_eq!(values.len(), 2);
        assert!((values[0] - 0.5).abs() < 1e-5);
        assert!((values[1] - 0.51).abs() < 1e-5);
    }

    #[tokio::test]
    async fn sequence_writes_each_step_once() {
        let r = rig();
        let p = processor(&r);
        let mut m = InputMapping::new("SEQ", InputAction::Sequence, Vec::new());
        m.sequence.steps = vec![
            SequenceStep {
                kind: StepKind::Value,
                target: Target::parse("sim/a").unwrap(),
                value: 1.0,
                delay_ms: 0,
            },
            SequenceStep {
                kind: StepKind::Value,
                target: Target::parse("sim/b").unwrap(),
                value: 1.0,
                delay_ms: 0,
            },
        ];
        p.add_mapping(m);
        p.process_input("COM1", "SEQ", 1.0);

        let deadline = Instant::now() + Duration::from_secs(2);
        while p.active_sequences() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            r.sim.writes(),
            vec![("sim/a".to_string(), 1.0), ("sim/b".to_string(), 1.0)]
        );
    }

    #[tokio::test]
    async fn release_runs_the_sequence_backwards() {
        let r = rig();
        let p = processor(&r);
        let mut m = InputMapping::new("START", InputAction::Sequence, Vec::new());
        m.sequence.reverse_on_release = true;
        m.sequence.steps = ["sim/fuel_pump", "sim/starter"]
            .into_iter()
            .map(|name| SequenceStep {
                kind: StepKind::Value,
                target: Target::parse(name).unwrap(),
                value: 1.0,
                delay_ms: 0,
            })
            .collect();
        p.add_mapping(m);

        async fn idle(p: &InputProcessor) {
            let deadline = Instant::now() + Duration::from_secs(2);
            while p.active_sequences() > 0 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        p.process_input("COM1", "START", 1.0);
        idle(&p).await;
        p.process_input("COM1", "START", 0.0);
        idle(&p).await;
        assert_eq!(
            r.sim.writes(),
            vec![
                ("sim/fuel_pump".to_string(), 1.0),
                ("sim/starter".to_string(), 1.0),
                ("sim/starter".to_string(), 0.0),
                ("sim/fuel_pump".to_string(), 0.0),
            ]
        );
    }

    #[test]
    fn init_values_apply_to_matching_ports() {
        let r = rig();
        let p = processor(&r);
        let mut a = InputMapping::new("A", InputAction::Set, to("sim/a")).on_port("COM1");
        a.init_value = Some(1.0);
        let mut b = InputMapping::new("B", InputAction::Set, to("sim/b")).on_port("COM2");
        b.init_value = Some(1.0);
        let mut c = InputMapping::new("C", InputAction::Set, to("sim/c"));
        c.init_value = Some(0.0);
        p.add_mapping(a);
        p.add_mapping(b);
        p.add_mapping(c);
        assert_eq!(p.apply_init_values("COM1"), 2);
        let names: Vec<String> = r.sim.writes().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["sim/a", "sim/c"]);
    }
}

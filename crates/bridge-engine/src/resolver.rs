//! One name, wherever it lives.
//!
//! Reads go through the value store. Writes to a bare simulator name try, in
//! order, a logic block of that name, a declared variable, a hardware key and
//! finally the simulator itself.

use crate::catalog::{DatarefCatalog, DatarefKind};
use crate::logic::LogicEngine;
use crate::router::BroadcastRouter;
use crate::sinks::SimOutput;
use crate::target::Target;
use crate::values::{ValueStore, VariableOrigin};
use crate::Result;
use std::sync::Arc;
use tracing::debug;

/// Where a write ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    LogicBlock,
    Variable,
    HardwareKey,
    Command,
    Simulator,
}

pub struct ValueResolver {
    values: Arc<ValueStore>,
    router: Arc<BroadcastRouter>,
    logic: Arc<LogicEngine>,
    sim: Arc<dyn SimOutput>,
    catalog: Arc<dyn DatarefCatalog>,
}

impl ValueResolver {
    pub fn new(
        values: Arc<ValueStore>,
        router: Arc<BroadcastRouter>,
        logic: Arc<LogicEngine>,
        sim: Arc<dyn SimOutput>,
        catalog: Arc<dyn DatarefCatalog>,
    ) -> Self {
        Self {
            values,
            router,
            logic,
            sim,
            catalog,
        }
    }

    pub fn values(&self) -> &ValueStore {
        &self.values
    }

    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }

    pub fn logic(&self) -> &LogicEngine {
        &self.logic
    }

    /// Current value of a possibly prefixed name.
    pub fn value(&self, raw: &str) -> Option<f32> {
        Target::parse(raw).ok().and_then(|t| self.target_value(&t))
    }

    pub fn target_value(&self, target: &Target) -> Option<f32> {
        match target {
            Target::Simulator(name) | Target::Variable(name) => self.values.get(name),
            Target::HardwareKey(key) => self
                .router
                .mapping(key)
                .and_then(|m| self.values.get(&m.source))
                .or_else(|| self.values.get(key)),
        }
    }

    /// True when `target` names a simulator command.
    pub fn is_command(&self, target: &Target) -> bool {
        match target {
            Target::Simulator(name) => self.catalog.kind(name) == Some(DatarefKind::Command),
            Target::HardwareKey(key) => self
                .router
                .mapping(key)
                .is_some_and(|m| self.catalog.kind(&m.source) == Some(DatarefKind::Command)),
            Target::Variable(_) => false,
        }
    }

    pub fn apply(&self, target: &Target, value: f32) -> Result<Resolution> {
        match target {
            Target::Simulator(name) => {
                if self.logic.contains(name) {
                    self.logic.trigger(name, self)?;
                    return Ok(Resolution::LogicBlock);
                }
                if self.values.is_declared(name) {
                    self.set_variable(name, value);
                    return Ok(Resolution::Variable);
                }
                if self.router.mapping(name).is_some() {
                    self.router.broadcast_by_key(name, value)?;
                    return Ok(Resolution::HardwareKey);
                }
                if self.catalog.kind(name) == Some(DatarefKind::Command) {
                    if value > 0.0 {
                        self.sim.send_command(name)?;
                    }
                    return Ok(Resolution::Command);
                }
                self.values.set(name, value, VariableOrigin::Custom);
                self.sim.write_value(name, value)?;
                Ok(Resolution::Simulator)
            }
            Target::Variable(name) => {
                if self.logic.contains(name) {
                    self.logic.trigger(name, self)?;
                    return Ok(Resolution::LogicBlock);
                }
                self.set_variable(name, value);
                Ok(Resolution::Variable)
            }
            Target::HardwareKey(key) => {
                self.router.broadcast_by_key(key, value)?;
                Ok(Resolution::HardwareKey)
            }
        }
    }

    /// Fire `target` as a one-shot command.
    pub fn fire_command(&self, target: &Target) -> Result<Resolution> {
        match target {
            Target::Simulator(name) if !self.logic.contains(name) => {
                debug!(name = %name, "command");
                self.sim.send_command(name)?;
                Ok(Resolution::Command)
            }
            _ => self.apply(target, 1.0),
        }
    }

    fn set_variable(&self, name: &str, value: f32) {
        self.values.set(name, value, VariableOrigin::Custom);
        self.router.on_source_changed(name, value);
    }
}

//! bridge-engine: routing, input shaping and logic between the simulator and cockpit boards
//!
//! The engine sits between [`sim_link::SimLink`] and [`device_link::DeviceRegistry`]
//! and never touches a socket or port itself; both links are reached through the
//! [`SimOutput`] and [`DeviceOutput`] traits. [`Bridge`] wires the value store,
//! [`BroadcastRouter`], [`InputProcessor`] and [`LogicEngine`] together and runs
//! them from one async loop.

mod error;
pub use error::{BridgeError, Result};

pub mod target;
pub use target::Target;

mod values;
pub use values::{ValueStore, VariableEntry, VariableOrigin};

mod catalog;
pub use catalog::{DatarefCatalog, DatarefEntry, DatarefKind, StaticCatalog};

mod sinks;
pub use sinks::{DeviceOutput, SimOutput};

pub mod conditions;
pub use conditions::{Condition, ConditionLogic, LogicGate, Operator};

pub mod axis;
pub use axis::{AxisConfig, DeadzonePosition, ResponseCurve};

mod router;
pub use router::{BroadcastOutcome, BroadcastRouter, UniversalMapping, CHANGE_THRESHOLD};

mod resolver;
pub use resolver::{Resolution, ValueResolver};

mod logic;
pub use logic::{LogicBlock, LogicEngine, LogicOutput, OutputAction};

mod sequence;
pub use sequence::{SequenceConfig, SequenceRunner, SequenceStep, StepKind};

mod input;
pub use input::{InputAction, InputMapping, InputProcessor, TargetAction};

mod metrics;
pub use metrics::{EngineMetrics, LinkMetrics, MetricsHub};

mod profile;
pub use profile::{BridgeProfile, DeviceProfile, VariableDecl};

mod bridge;
pub use bridge::{Bridge, BridgeEvent, BridgeObserver, EngineConfig, EventChannel, EventForwarder};

#[cfg(test)]
mod testing;

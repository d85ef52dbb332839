//! Composition root and scheduler.
//!
//! Link workers push [`BridgeEvent`]s into an unbounded channel. [`Bridge::run_until`]
//! drains that channel and ticks the logic engine on a fixed interval, so input
//! processing, routing and logic all run on one task.

use crate::catalog::{DatarefCatalog, DatarefKind, StaticCatalog};
use crate::input::{InputMapping, InputProcessor};
use crate::logic::{LogicBlock, LogicEngine};
use crate::metrics::MetricsHub;
use crate::profile::{BridgeProfile, DeviceProfile, VariableDecl};
use crate::resolver::ValueResolver;
use crate::router::{BroadcastOutcome, BroadcastRouter, UniversalMapping};
use crate::sinks::{DeviceOutput, SimOutput};
use crate::target::Target;
use crate::values::{ValueStore, VariableOrigin};
use crate::{BridgeError, Result};
use device_link::{DeviceInfo, DeviceListener, DeviceState, LinkConfig};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sim_link::{DataRow, SimConfig, SimListener};
use std::collections::BTreeSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub logic_tick_ms: u64,
    /// Pause between repeats of a held sequence.
    pub repeat_pause_ms: u64,
    /// Rate requested for every monitored simulator value.
    pub subscription_hz: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            logic_tick_ms: 50,
            repeat_pause_ms: 50,
            subscription_hz: 10,
        }
    }
}

impl EngineConfig {
    fn logic_tick(&self) -> Duration {
        Duration::from_millis(self.logic_tick_ms.max(1))
    }
}

/// Everything the link workers report.
#[derive(Clone, Debug, PartialEq)]
pub enum BridgeEvent {
    SimValue { name: String, value: f32 },
    SimEndpoint(SocketAddr),
    DataRow(DataRow),
    DeviceState { port: String, state: DeviceState },
    DeviceLine { port: String, line: String },
    DeviceInput { port: String, key: String, value: f32 },
    DrefWrite { port: String, name: String, value: f32 },
    CommandRequest { port: String, name: String },
}

/// Both link listeners, forwarding into the bridge's queue.
pub struct EventForwarder {
    tx: UnboundedSender<BridgeEvent>,
}

impl EventForwarder {
    fn forward(&self, event: BridgeEvent) {
        // A closed queue means the bridge is gone; the event has nowhere to go.
        let _ = self.tx.send(event);
    }
}

impl SimListener for EventForwarder {
    fn on_value(&self, name: &str, value: f32) {
        self.forward(BridgeEvent::SimValue {
            name: name.to_string(),
            value,
        });
    }

    fn on_endpoint_changed(&self, endpoint: SocketAddr) {
        self.forward(BridgeEvent::SimEndpoint(endpoint));
    }

    fn on_data_row(&self, row: &DataRow) {
        self.forward(BridgeEvent::DataRow(row.clone()));
    }
}

impl DeviceListener for EventForwarder {
    fn on_state_changed(&self, port: &str, state: DeviceState) {
        self.forward(BridgeEvent::DeviceState {
            port: port.to_string(),
            state,
        });
    }

    fn on_line(&self, port: &str, line: &str) {
        self.forward(BridgeEvent::DeviceLine {
            port: port.to_string(),
            line: line.to_string(),
        });
    }

    fn on_input(&self, port: &str, key: &str, value: f32) {
        self.forward(BridgeEvent::DeviceInput {
            port: port.to_string(),
            key: key.to_string(),
            value,
        });
    }

    fn on_dref_write(&self, port: &str, name: &str, value: f32) {
        self.forward(BridgeEvent::DrefWrite {
            port: port.to_string(),
            name: name.to_string(),
            value,
        });
    }

    fn on_command(&self, port: &str, name: &str) {
        self.forward(BridgeEvent::CommandRequest {
            port: port.to_string(),
            name: name.to_string(),
        });
    }
}

/// The queue between link workers and the bridge. Create it first, hand
/// [`EventChannel::forwarder`] to the links, then give the channel to [`Bridge::new`].
pub struct EventChannel {
    tx: UnboundedSender<BridgeEvent>,
    rx: UnboundedReceiver<BridgeEvent>,
}

impl EventChannel {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self { tx, rx }
    }

    pub fn forwarder(&self) -> Arc<EventForwarder> {
        Arc::new(EventForwarder {
            tx: self.tx.clone(),
        })
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Notifications for a host UI. All methods default to no-ops.
pub trait BridgeObserver: Send + Sync {
    fn devices_changed(&self, _devices: &[DeviceInfo]) {}
    fn line_received(&self, _port: &str, _line: &str) {}
    fn input_received(&self, _port: &str, _key: &str, _value: f32) {}
    fn value_changed(&self, _name: &str, _value: f32) {}
}

/// Profile parts the engine carries but does not act on itself.
#[derive(Default)]
struct HostSettings {
    name: Option<String>,
    sim: SimConfig,
    link: LinkConfig,
    devices: Vec<DeviceProfile>,
}

pub struct Bridge {
    config: EngineConfig,
    sim: Arc<dyn SimOutput>,
    devices: Arc<dyn DeviceOutput>,
    catalog: Arc<StaticCatalog>,
    values: Arc<ValueStore>,
    resolver: Arc<ValueResolver>,
    input: InputProcessor,
    tx: UnboundedSender<BridgeEvent>,
    rx: Mutex<Option<UnboundedReceiver<BridgeEvent>>>,
    observers: RwLock<Vec<Arc<dyn BridgeObserver>>>,
    host: RwLock<HostSettings>,
    metrics: MetricsHub,
}

impl Bridge {
    pub fn new(
        config: EngineConfig,
        sim: Arc<dyn SimOutput>,
        devices: Arc<dyn DeviceOutput>,
        events: EventChannel,
    ) -> Result<Self> {
        let catalog = Arc::new(StaticCatalog::new());
        let values = Arc::new(ValueStore::new());
        let router = Arc::new(BroadcastRouter::new(
            Arc::clone(&sim),
            Arc::clone(&devices),
            catalog.clone(),
            Arc::clone(&values),
        ));
        let resolver = Arc::new(ValueResolver::new(
            Arc::clone(&values),
            router,
            Arc::new(LogicEngine::new()),
            Arc::clone(&sim),
            catalog.clone(),
        ));
        let input = InputProcessor::new(
            Arc::clone(&resolver),
            Duration::from_millis(config.repeat_pause_ms),
        );
        Ok(Self {
            config,
            sim,
            devices,
            catalog,
            values,
            resolver,
            input,
            tx: events.tx,
            rx: Mutex::new(Some(events.rx)),
            observers: RwLock::new(Vec::new()),
            host: RwLock::new(HostSettings::default()),
            metrics: MetricsHub::new()?,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn values(&self) -> &ValueStore {
        &self.values
    }

    pub fn catalog(&self) -> &StaticCatalog {
        &self.catalog
    }

    pub fn resolver(&self) -> &Arc<ValueResolver> {
        &self.resolver
    }

    pub fn router(&self) -> &BroadcastRouter {
        self.resolver.router()
    }

    pub fn logic(&self) -> &LogicEngine {
        self.resolver.logic()
    }

    pub fn input(&self) -> &InputProcessor {
        &self.input
    }

    pub fn metrics(&self) -> &MetricsHub {
        &self.metrics
    }

    pub fn add_observer(&self, observer: Arc<dyn BridgeObserver>) {
        self.observers.write().push(observer);
    }

    /// Queue an event as if a link worker had raised it.
    pub fn submit(&self, event: BridgeEvent) {
        let _ = self.tx.send(event);
    }

    /// Drive the bridge until `shutdown` resolves. Only one loop may run at a time.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut rx = self.rx.lock().take().ok_or(BridgeError::AlreadyRunning)?;
        let mut ticker = tokio::time::interval(self.config.logic_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        info!(tick_ms = self.config.logic_tick_ms, "bridge running");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = rx.recv() => self.handle_event(event),
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }

        self.input.cancel_all();
        *self.rx.lock() = Some(rx);
        info!("bridge stopped");
        Ok(())
    }

    /// Evaluate every logic block once.
    pub fn tick(&self) -> usize {
        let evaluated = self.logic().tick(&self.resolver);
        self.metrics.engine.logic_ticks.inc();
        let (sent, received) = self.sim.packet_counts();
        self.metrics.observe_sim(sent, received);
        evaluated
    }

    pub fn handle_event(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::SimValue { name, value } => {
                self.values.set(&name, value, VariableOrigin::Simulator);
                self.metrics.engine.sim_values_received.inc();
                let outcome = self.router().on_source_changed(&name, value);
                self.count(outcome);
                if let Some(base) = self.array_head(&name) {
                    self.values.set(base, value, VariableOrigin::Simulator);
                    let outcome = self.router().on_source_changed(base, value);
                    self.count(outcome);
                }
                self.notify(|o| o.value_changed(&name, value));
            }
            BridgeEvent::SimEndpoint(endpoint) => {
                info!(%endpoint, "simulator endpoint changed");
            }
            BridgeEvent::DataRow(row) => {
                debug!(row = row.index, values = ?row.values, "data row");
            }
            BridgeEvent::DeviceState { port, state } => self.on_device_state(&port, state),
            BridgeEvent::DeviceLine { port, line } => {
                self.metrics.link.device_lines_received.inc();
                self.notify(|o| o.line_received(&port, &line));
            }
            BridgeEvent::DeviceInput { port, key, value } => {
                self.values.set(&key, value, VariableOrigin::Hardware);
                let dispatched = self.input.process_input(&port, &key, value);
                self.metrics.engine.inputs_processed.inc();
                debug!(port = %port, key = %key, value, dispatched, "input");
                self.notify(|o| o.input_received(&port, &key, value));
            }
            BridgeEvent::DrefWrite { port, name, value } => {
                let result = Target::parse(&name).and_then(|t| self.resolver.apply(&t, value));
                if let Err(e) = result {
                    warn!(port = %port, name = %name, error = %e, "device write failed");
                }
            }
            BridgeEvent::CommandRequest { port, name } => {
                let result = Target::parse(&name).and_then(|t| self.resolver.fire_command(&t));
                if let Err(e) = result {
                    warn!(port = %port, name = %name, error = %e, "device command failed");
                }
            }
        }
    }

    fn on_device_state(&self, port: &str, state: DeviceState) {
        match state {
            DeviceState::Ready => {
                let outcome = self
                    .router()
                    .resync(port, |source| self.resolver.value(source));
                self.count(outcome);
                self.input.apply_init_values(port);
                info!(port, sent = outcome.sent, "device ready, values pushed");
            }
            DeviceState::Disconnected | DeviceState::Error => self.router().forget_port(port),
            DeviceState::Connecting | DeviceState::Handshake | DeviceState::Active => {}
        }
        self.metrics
            .link
            .devices_ready
            .set(self.devices.ready_ports().len() as i64);
        self.notify_devices();
    }

    fn count(&self, outcome: BroadcastOutcome) {
        self.metrics
            .engine
            .broadcasts_sent
            .inc_by(outcome.sent as u64);
        self.metrics
            .engine
            .broadcasts_suppressed
            .inc_by(outcome.suppressed as u64);
    }

    fn notify(&self, f: impl Fn(&dyn BridgeObserver)) {
        for observer in self.observers.read().iter() {
            f(observer.as_ref());
        }
    }

    fn notify_devices(&self) {
        if self.observers.read().is_empty() {
            return;
        }
        let devices = self.devices.snapshots();
        self.notify(|o| o.devices_changed(&devices));
    }

    /// `base` when `name` is `base[0]` of a declared array. The first element
    /// stands for the whole array on keys bound to the base name.
    fn array_head<'a>(&self, name: &'a str) -> Option<&'a str> {
        let base = name.strip_suffix("[0]")?;
        matches!(self.catalog.kind(base), Some(DatarefKind::Array { .. })).then_some(base)
    }

    fn subscribe_source(&self, source: &str) -> Result<()> {
        let count = match self.catalog.kind(source) {
            Some(DatarefKind::Command) => return Ok(()),
            Some(DatarefKind::Array { len }) => len,
            _ => 1,
        };
        self.sim
            .subscribe(source, self.config.subscription_hz, count)?;
        Ok(())
    }

    /// Bind a hardware key to a source and start watching the source.
    pub fn set_mapping(&self, source: &str, key: &str, is_variable: bool) -> Result<()> {
        if source.trim().is_empty() || key.trim().is_empty() {
            return Err(BridgeError::InvalidTarget(format!("{source} -> {key}")));
        }
        if self.router().set_mapping(source, key, is_variable) {
            self.subscribe_source(source)?;
        }
        if let Some(value) = self.resolver.value(source) {
            self.count(self.router().push_key(key, value));
        }
        Ok(())
    }

    /// Drop a key binding; the source is unsubscribed once nothing needs it.
    pub fn remove_mapping(&self, key: &str) -> Option<UniversalMapping> {
        let removed = self.router().remove_mapping(key)?;
        if !removed.is_variable && self.router().keys_for(&removed.source).is_empty() {
            self.router().remove_monitored(&removed.source);
            if let Err(e) = self.sim.unsubscribe(&removed.source) {
                debug!(source = %removed.source, error = %e, "unsubscribe failed");
            }
        }
        Some(removed)
    }

    /// Watch a simulator value without binding it to a key.
    pub fn monitor(&self, source: &str) -> Result<()> {
        if self.router().add_monitored(source) {
            self.subscribe_source(source)?;
        }
        Ok(())
    }

    pub fn add_input_mapping(&self, mapping: InputMapping) -> Option<InputMapping> {
        self.input.add_mapping(mapping)
    }

    pub fn remove_input_mapping(
        &self,
        input_key: &str,
        device_port: Option<&str>,
    ) -> Option<InputMapping> {
        self.input.remove_mapping(input_key, device_port)
    }

    pub fn input_mappings(&self) -> Vec<InputMapping> {
        self.input.mappings()
    }

    /// Add or replace a logic block. A named block with an output key gets the
    /// key bound to its own value.
    pub fn add_logic_block(&self, block: LogicBlock) -> Option<LogicBlock> {
        if !block.name.is_empty() {
            if let Some(key) = &block.output_key {
                self.router().set_mapping(&block.name, key, true);
            }
            if let Some(init) = block.initial_value {
                let value = if init > 0.5 { 1.0 } else { 0.0 };
                self.values.set(&block.name, value, VariableOrigin::Logic);
            }
        }
        let previous = self.logic().add_block(block);
        if let Some(prev) = &previous {
            self.release_output_key(prev);
        }
        previous
    }

    pub fn remove_logic_block(&self, name: &str) -> Option<LogicBlock> {
        let removed = self.logic().remove_block(name)?;
        self.values.remove(name, VariableOrigin::Logic);
        self.release_output_key(&removed);
        Some(removed)
    }

    pub fn logic_blocks(&self) -> Vec<LogicBlock> {
        self.logic().blocks()
    }

    /// Unbind a block's output key unless the current block of that name still uses it.
    fn release_output_key(&self, block: &LogicBlock) {
        let Some(key) = &block.output_key else {
            return;
        };
        let still_used = self
            .logic()
            .block(&block.name)
            .is_some_and(|b| b.output_key.as_deref() == Some(key.as_str()));
        let routed = self
            .router()
            .mapping(key)
            .is_some_and(|m| m.is_variable && m.source == block.name);
        if routed && !still_used {
            self.router().remove_mapping(key);
        }
    }

    pub fn declare_variable(&self, name: &str, initial: Option<f32>) {
        self.values.declare(name, initial);
        if let Some(value) = initial {
            self.count(self.router().on_source_changed(name, value));
        }
    }

    pub fn set_variable(&self, name: &str, value: f32) -> Result<()> {
        self.resolver
            .apply(&Target::Variable(name.to_string()), value)?;
        Ok(())
    }

    pub fn connect_device(&self, port: &str, baud_rate: Option<u32>) -> Result<()> {
        self.devices.connect(port, baud_rate)?;
        self.notify_devices();
        Ok(())
    }

    pub fn disconnect_device(&self, port: &str) -> bool {
        let removed = self.devices.disconnect(port);
        if removed {
            self.router().forget_port(port);
            self.metrics
                .link
                .devices_ready
                .set(self.devices.ready_ports().len() as i64);
            self.notify_devices();
        }
        removed
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.snapshots()
    }

    /// Legacy direct mode: send `source` to `key` on one device only.
    pub fn device_subscribe(&self, port: &str, source: &str, key: &str) -> Result<()> {
        self.devices.set_subscription(port, source, key)?;
        self.monitor(source)
    }

    /// Connect every device listed in the loaded profile. Returns how many started.
    pub fn connect_profile_devices(&self) -> usize {
        let devices = self.host.read().devices.clone();
        let mut started = 0;
        for device in &devices {
            if let Err(e) = self.devices.connect(&device.port, device.baud_rate) {
                warn!(port = %device.port, error = %e, "device not started");
                continue;
            }
            started += 1;
            for (source, key) in &device.subscriptions {
                if let Err(e) = self.device_subscribe(&device.port, source, key) {
                    warn!(port = %device.port, source = %source, error = %e, "subscription failed");
                }
            }
        }
        self.notify_devices();
        started
    }

    /// Disconnect every device and stop running sequences.
    pub fn shutdown(&self) {
        self.input.cancel_all();
        for device in self.devices.snapshots() {
            self.devices.disconnect(&device.port);
        }
        self.metrics.link.devices_ready.set(0);
    }

    /// Replace every table with the profile's contents. Live simulator and
    /// hardware values are kept; devices are not touched.
    pub fn load_profile(&self, profile: &BridgeProfile) -> Result<()> {
        profile.validate()?;

        self.input.clear();
        self.logic().clear();
        self.router().clear();
        self.values.reset_local();
        self.catalog.replace(&profile.datarefs);

        for var in &profile.variables {
            self.values.declare(&var.name, Some(var.value));
        }
        for mapping in &profile.mappings {
            self.set_mapping(&mapping.source, &mapping.key, mapping.is_variable)?;
        }
        for source in &profile.monitored {
            self.monitor(source)?;
        }
        for block in &profile.logic {
            self.add_logic_block(block.clone());
        }
        for mapping in &profile.inputs {
            self.input.add_mapping(mapping.clone());
        }

        *self.host.write() = HostSettings {
            name: profile.name.clone(),
            sim: profile.sim.clone(),
            link: profile.link.clone(),
            devices: profile.devices.clone(),
        };
        info!(
            profile = profile.name.as_deref().unwrap_or("unnamed"),
            mappings = profile.mappings.len(),
            inputs = profile.inputs.len(),
            logic = profile.logic.len(),
            "profile loaded"
        );
        Ok(())
    }

    /// Current tables as a profile that [`Bridge::load_profile`] accepts back.
    pub fn export_profile(&self) -> BridgeProfile {
        let host = self.host.read();
        let blocks = self.logic().blocks();

        let block_keys: BTreeSet<(String, String)> = blocks
            .iter()
            .filter(|b| !b.name.is_empty())
            .filter_map(|b| {
                b.output_key
                    .as_ref()
                    .map(|k| (b.name.clone(), k.trim().to_ascii_uppercase()))
            })
            .collect();
        let mappings: Vec<UniversalMapping> = self
            .router()
            .mappings()
            .into_iter()
            .filter(|m| !(m.is_variable && block_keys.contains(&(m.source.clone(), m.key.clone()))))
            .collect();

        let mut devices: Vec<DeviceProfile> = self
            .devices
            .snapshots()
            .into_iter()
            .map(|info| DeviceProfile {
                port: info.port,
                baud_rate: Some(info.baud_rate),
                subscriptions: info.subscriptions,
            })
            .collect();
        for listed in &host.devices {
            if !devices.iter().any(|d| d.port == listed.port) {
                devices.push(listed.clone());
            }
        }
        let subscribed: BTreeSet<&String> = devices
            .iter()
            .flat_map(|d| d.subscriptions.keys())
            .collect();
        let monitored = self
            .router()
            .monitored()
            .into_iter()
            .filter(|s| self.router().keys_for(s).is_empty() && !subscribed.contains(s))
            .collect();

        let variables = self
            .values
            .declared()
            .into_iter()
            .map(|name| VariableDecl {
                value: self
                    .values
                    .get_from(&name, VariableOrigin::Custom)
                    .unwrap_or_default(),
                name,
            })
            .collect();

        BridgeProfile {
            name: host.name.clone(),
            sim: host.sim.clone(),
            link: host.link.clone(),
            engine: self.config.clone(),
            devices,
            mappings,
            monitored,
            inputs: self.input.mappings(),
            logic: blocks,
            variables,
            datarefs: self.catalog.entries(),
        }
    }
}

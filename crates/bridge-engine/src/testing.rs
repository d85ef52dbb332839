//! Recording doubles for the I/O seams and a ready-wired resolver.

use crate::catalog::StaticCatalog;
use crate::logic::LogicEngine;
use crate::resolver::ValueResolver;
use crate::router::BroadcastRouter;
use crate::sinks::{DeviceOutput, SimOutput};
use crate::values::ValueStore;
use device_link::{DeviceError, DeviceInfo};
use parking_lot::Mutex;
use sim_link::SimLinkError;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
pub enum SimCall {
    Write(String, f32),
    Text(String, String, usize),
    Command(String),
    Subscribe(String, i32, usize),
    Unsubscribe(String),
}

#[derive(Default)]
pub struct RecordingSim {
    pub calls: Mutex<Vec<SimCall>>,
}

impl RecordingSim {
    pub fn writes(&self) -> Vec<(String, f32)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                SimCall::Write(n, v) => Some((n.clone(), *v)),
                _ => None,
            })
            .collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                SimCall::Command(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl SimOutput for RecordingSim {
    fn write_value(&self, name: &str, value: f32) -> Result<(), SimLinkError> {
        self.calls.lock().push(SimCall::Write(name.into(), value));
        Ok(())
    }

    fn write_string(&self, name: &str, text: &str, max_len: usize) -> Result<(), SimLinkError> {
        self.calls
            .lock()
            .push(SimCall::Text(name.into(), text.into(), max_len));
        Ok(())
    }

    fn send_command(&self, name: &str) -> Result<(), SimLinkError> {
        self.calls.lock().push(SimCall::Command(name.into()));
        Ok(())
    }

    fn subscribe(
        &self,
        name: &str,
        frequency: i32,
        element_count: usize,
    ) -> Result<Vec<i32>, SimLinkError> {
        self.calls
            .lock()
            .push(SimCall::Subscribe(name.into(), frequency, element_count));
        Ok((0..element_count.max(1) as i32).collect())
    }

    fn unsubscribe(&self, name: &str) -> Result<usize, SimLinkError> {
        self.calls.lock().push(SimCall::Unsubscribe(name.into()));
        Ok(1)
    }
}

/// Boards that are always ready and record every frame.
#[derive(Default)]
pub struct RecordingDevices {
    pub ready: Mutex<Vec<String>>,
    pub sent: Mutex<Vec<(String, String, f32)>>,
    pub legacy: Mutex<BTreeMap<(String, String), String>>,
}

impl RecordingDevices {
    pub fn with_ports(ports: &[&str]) -> Self {
        let devices = Self::default();
        *devices.ready.lock() = ports.iter().map(|p| p.to_string()).collect();
        devices
    }

    pub fn sent(&self) -> Vec<(String, String, f32)> {
        self.sent.lock().clone()
    }
}

impl DeviceOutput for RecordingDevices {
    fn connect(&self, port: &str, _baud_rate: Option<u32>) -> Result<(), DeviceError> {
        self.ready.lock().push(port.to_string());
        Ok(())
    }

    fn disconnect(&self, port: &str) -> bool {
        let mut ready = self.ready.lock();
        let before = ready.len();
        ready.retain(|p| p != port);
        before != ready.len()
    }

    fn snapshots(&self) -> Vec<DeviceInfo> {
        Vec::new()
    }

    fn ready_ports(&self) -> Vec<String> {
        self.ready.lock().clone()
    }

    fn send_value(&self, port: &str, key: &str, value: f32) -> Result<(), DeviceError> {
        self.sent.lock().push((port.into(), key.into(), value));
        Ok(())
    }

    fn set_subscription(&self, port: &str, source: &str, key: &str) -> Result<(), DeviceError> {
        self.legacy
            .lock()
            .insert((port.into(), source.into()), key.to_ascii_uppercase());
        Ok(())
    }

    fn subscribers_of(&self, source: &str) -> Vec<(String, String)> {
        self.legacy
            .lock()
            .iter()
            .filter(|((_, s), _)| s == source)
            .map(|((port, _), key)| (port.clone(), key.clone()))
            .collect()
    }
}

pub struct Rig {
    pub sim: Arc<RecordingSim>,
    pub devices: Arc<RecordingDevices>,
    pub catalog: Arc<StaticCatalog>,
    pub values: Arc<ValueStore>,
    pub resolver: Arc<ValueResolver>,
}

/// Store, router, logic and resolver over recording doubles, with `COM1` ready.
pub fn rig() -> Rig {
    let sim = Arc::new(RecordingSim::default());
    let devices = Arc::new(RecordingDevices::with_ports(&["COM1"]));
    let catalog = Arc::new(StaticCatalog::new());
    let values = Arc::new(ValueStore::new());
    let router = Arc::new(BroadcastRouter::new(
        sim.clone(),
        devices.clone(),
        catalog.clone(),
        values.clone(),
    ));
    let resolver = Arc::new(ValueResolver::new(
        values.clone(),
        router,
        Arc::new(LogicEngine::new()),
        sim.clone(),
        catalog.clone(),
    ));
    Rig {
        sim,
        devices,
        catalog,
        values,
        resolver,
    }
}

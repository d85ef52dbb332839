//! The two I/O seams of the engine.
//!
//! Everything above this module talks to the simulator through [`SimOutput`]
//! and to boards through [`DeviceOutput`]. The real links implement them here.

use device_link::{DeviceError, DeviceInfo, DeviceRegistry};
use sim_link::{SimLink, SimLinkError};

pub trait SimOutput: Send + Sync {
    fn write_value(&self, name: &str, value: f32) -> Result<(), SimLinkError>;
    fn write_string(&self, name: &str, text: &str, max_len: usize) -> Result<(), SimLinkError>;
    fn send_command(&self, name: &str) -> Result<(), SimLinkError>;
    fn subscribe(&self, name: &str, frequency: i32, element_count: usize)
        -> Result<Vec<i32>, SimLinkError>;
    fn unsubscribe(&self, name: &str) -> Result<usize, SimLinkError>;

    /// `(sent, received)` packet totals, when the output counts them.
    fn packet_counts(&self) -> (u64, u64) {
        (0, 0)
    }
}

impl SimOutput for SimLink {
    fn write_value(&self, name: &str, value: f32) -> Result<(), SimLinkError> {
        SimLink::write_value(self, name, value)
    }

    fn write_string(&self, name: &str, text: &str, max_len: usize) -> Result<(), SimLinkError> {
        SimLink::write_string(self, name, text, max_len)
    }

    fn send_command(&self, name: &str) -> Result<(), SimLinkError> {
        SimLink::send_command(self, name)
    }

    fn subscribe(
        &self,
        name: &str,
        frequency: i32,
        element_count: usize,
    ) -> Result<Vec<i32>, SimLinkError> {
        self.subscribe_value(name, frequency, element_count)
    }

    fn unsubscribe(&self, name: &str) -> Result<usize, SimLinkError> {
        self.unsubscribe_value(name)
    }

    fn packet_counts(&self) -> (u64, u64) {
        let stats = self.stats();
        (stats.packets_sent, stats.packets_received)
    }
}

pub trait DeviceOutput: Send + Sync {
    fn connect(&self, port: &str, baud_rate: Option<u32>) -> Result<(), DeviceError>;
    fn disconnect(&self, port: &str) -> bool;
    fn snapshots(&self) -> Vec<DeviceInfo>;
    fn ready_ports(&self) -> Vec<String>;
    fn send_value(&self, port: &str, key: &str, value: f32) -> Result<(), DeviceError>;
    fn set_subscription(&self, port: &str, source: &str, key: &str) -> Result<(), DeviceError>;
    /// `(port, key)` pairs of legacy per-device subscriptions to `source`.
    fn subscribers_of(&self, source: &str) -> Vec<(String, String)>;
}

impl DeviceOutput for DeviceRegistry {
    fn connect(&self, port: &str, baud_rate: Option<u32>) -> Result<(), DeviceError> {
        DeviceRegistry::connect(self, port, baud_rate)
    }

    fn disconnect(&self, port: &str) -> bool {
        DeviceRegistry::disconnect(self, port)
    }

    fn snapshots(&self) -> Vec<DeviceInfo> {
        DeviceRegistry::snapshots(self)
    }

    fn ready_ports(&self) -> Vec<String> {
        DeviceRegistry::ready_ports(self)
    }

    fn send_value(&self, port: &str, key: &str, value: f32) -> Result<(), DeviceError> {
        DeviceRegistry::send_value(self, port, key, value)
    }

    fn set_subscription(&self, port: &str, source: &str, key: &str) -> Result<(), DeviceError> {
        DeviceRegistry::set_subscription(self, port, source, key)
    }

    fn subscribers_of(&self, source: &str) -> Vec<(String, String)> {
        DeviceRegistry::subscribers_of(self, source)
    }
}

use crate::{BridgeError, Result};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct LinkMetrics {
    pub sim_packets_sent: IntCounter,
    pub sim_packets_received: IntCounter,
    pub device_lines_received: IntCounter,
    pub devices_ready: IntGauge,
}

#[derive(Clone)]
pub struct EngineMetrics {
    pub broadcasts_sent: IntCounter,
    pub broadcasts_suppressed: IntCounter,
    pub inputs_processed: IntCounter,
    pub sim_values_received: IntCounter,
    pub logic_ticks: IntCounter,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub link: LinkMetrics,
    pub engine: EngineMetrics,
}

fn counter(name: &str, help: &str) -> Result<IntCounter> {
    IntCounter::new(name, help).map_err(|e| BridgeError::Metrics(e.to_string()))
}

impl MetricsHub {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let link = LinkMetrics {
            sim_packets_sent: counter("xpb_sim_packets_sent", "UDP packets sent to the simulator")?,
            sim_packets_received: counter(
                "xpb_sim_packets_received",
                "UDP packets received from the simulator",
            )?,
            device_lines_received: counter(
                "xpb_device_lines_received",
                "Lines received from all devices",
            )?,
            devices_ready: IntGauge::new("xpb_devices_ready", "Devices accepting frames")
                .map_err(|e| BridgeError::Metrics(e.to_string()))?,
        };
        let engine = EngineMetrics {
            broadcasts_sent: counter("xpb_broadcasts_sent", "Values sent to devices")?,
            broadcasts_suppressed: counter(
                "xpb_broadcasts_suppressed",
                "Device sends skipped below the change threshold",
            )?,
            inputs_processed: counter("xpb_inputs_processed", "Hardware input events handled")?,
            sim_values_received: counter("xpb_sim_values", "Simulator value updates applied")?,
            logic_ticks: counter("xpb_logic_ticks", "Logic engine evaluation passes")?,
        };
        let _ = registry.register(Box::new(link.sim_packets_sent.clone()));
        let _ = registry.register(Box::new(link.sim_packets_received.clone()));
        let _ = registry.register(Box::new(link.device_lines_received.clone()));
        let _ = registry.register(Box::new(link.devices_ready.clone()));
        let _ = registry.register(Box::new(engine.broadcasts_sent.clone()));
        let _ = registry.register(Box::new(engine.broadcasts_suppressed.clone()));
        let _ = registry.register(Box::new(engine.inputs_processed.clone()));
        let _ = registry.register(Box::new(engine.sim_values_received.clone()));
        let _ = registry.register(Box::new(engine.logic_ticks.clone()));
        Ok(Self {
            registry,
            link,
            engine,
        })
    }

    /// Bring the simulator packet counters up to the link's own totals.
    pub fn observe_sim(&self, sent: u64, received: u64) {
        catch_up(&self.link.sim_packets_sent, sent);
        catch_up(&self.link.sim_packets_received, received);
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

fn catch_up(counter: &IntCounter, total: u64) {
    let seen = counter.get();
    if total > seen {
        counter.inc_by(total - seen);
    }
}

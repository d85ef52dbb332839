use crate::{
    ChannelOpener, DeviceError, DeviceInfo, DeviceLink, DeviceListener, DeviceState, LinkConfig,
    PortInfo, Result,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// The live device table, keyed by port.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceLink>>,
    opener: Arc<dyn ChannelOpener>,
    listener: Arc<dyn DeviceListener>,
    config: LinkConfig,
}

impl DeviceRegistry {
    pub fn new(
        opener: Arc<dyn ChannelOpener>,
        listener: Arc<dyn DeviceListener>,
        config: LinkConfig,
    ) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            opener,
            listener,
            config,
        }
    }

    /// Start connecting `port`. A previous link on the same port is replaced
    /// only if it already failed or dropped.
    pub fn connect(&self, port: &str, baud_rate: Option<u32>) -> Result<()> {
        let stale = {
            let mut devices = self.devices.write();
            if let Some(existing) = devices.get(port) {
                if !matches!(
                    existing.state(),
                    DeviceState::Error | DeviceState::Disconnected
                ) {
                    return Err(DeviceError::AlreadyConnected(port.to_string()));
                }
            }
            devices.remove(port)
        };
        if let Some(old) = stale {
            old.disconnect();
        }

        let mut config = self.config.clone();
        if let Some(baud) = baud_rate {
            config.baud_rate = baud;
        }
        info!(port, baud = config.baud_rate, "connecting device");
        let link = DeviceLink::spawn(
            port,
            config,
            Arc::clone(&self.opener),
            Arc::clone(&self.listener),
        );
        self.devices.write().insert(port.to_string(), link);
        Ok(())
    }

    /// Stop and remove a device. Returns false if the port was unknown.
    pub fn disconnect(&self, port: &str) -> bool {
        let removed = self.devices.write().remove(port);
        match removed {
            Some(link) => {
                link.disconnect();
                info!(port, "device disconnected");
                true
            }
            None => false,
        }
    }

    pub fn disconnect_all(&self) {
        let links: Vec<DeviceLink> = self.devices.write().drain().map(|(_, l)| l).collect();
        for link in links {
            link.disconnect();
        }
    }

    pub fn state(&self, port: &str) -> Option<DeviceState> {
        self.devices.read().get(port).map(DeviceLink::state)
    }

    pub fn info(&self, port: &str) -> Option<DeviceInfo> {
        self.devices.read().get(port).map(DeviceLink::info)
    }

    /// Snapshots of every device, sorted by port.
    pub fn snapshots(&self) -> Vec<DeviceInfo> {
        let mut out: Vec<DeviceInfo> = self.devices.read().values().map(DeviceLink::info).collect();
        out.sort_by(|a, b| a.port.cmp(&b.port));
        out
    }

    /// Ports currently accepting frames.
    pub fn ready_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self
            .devices
            .read()
            .values()
            .filter(|l| l.state().is_ready())
            .map(|l| l.port().to_string())
            .collect();
        ports.sort();
        ports
    }

    pub fn send_value(&self, port: &str, key: &str, value: f32) -> Result<()> {
        self.with_link(port, |link| link.send_value(key, value))
    }

    pub fn send_command(&self, port: &str, raw: &str) -> Result<()> {
        self.with_link(port, |link| link.send_command(raw))
    }

    pub fn send_dref_command(&self, port: &str, name: &str, value: f32) -> Result<()> {
        self.with_link(port, |link| link.send_dref_command(name, value))
    }

    pub fn send_cmd_command(&self, port: &str, name: &str) -> Result<()> {
        self.with_link(port, |link| link.send_cmd_command(name))
    }

    pub fn set_subscription(&self, port: &str, source: &str, key: &str) -> Result<()> {
        self.with_link(port, |link| {
            link.set_subscription(source, key);
            Ok(())
        })
    }

    pub fn remove_subscription(&self, port: &str, source: &str) -> bool {
        self.devices
            .read()
            .get(port)
            .map(|link| link.remove_subscription(source))
            .unwrap_or(false)
    }

    /// Ports and keys subscribed to `source` in legacy direct mode.
    pub fn subscribers_of(&self, source: &str) -> Vec<(String, String)> {
        self.devices
            .read()
            .values()
            .filter_map(|link| {
                let info = link.info();
                info.subscriptions
                    .get(source)
                    .map(|key| (info.port.clone(), key.clone()))
            })
            .collect()
    }

    pub fn list_ports(&self) -> Result<Vec<PortInfo>> {
        self.opener.list()
    }

    fn with_link<T>(&self, port: &str, f: impl FnOnce(&DeviceLink) -> Result<T>) -> Result<T> {
        let devices = self.devices.read();
        let link = devices
            .get(port)
            .ok_or_else(|| DeviceError::PortNotFound(port.to_string()))?;
        f(link).map_err(|e| {
            if !matches!(e, DeviceError::NotReady { .. }) {
                warn!(port, error = %e, "device send failed");
            }
            e
        })
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::{MockHandle, MockOpener, NullListener};
    use std::thread;
    use std::time::{Duration, Instant};

    fn registry(opener: MockOpener) -> DeviceRegistry {
        let config = LinkConfig {
            settle_delay_ms: 0,
            handshake_timeout_ms: 200,
            poll_interval_ms: 5,
            ..LinkConfig::default()
        };
        DeviceRegistry::new(Arc::new(opener), Arc::new(NullListener), config)
    }

    fn wait_ready(reg: &DeviceRegistry, port: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if reg.state(port).map(DeviceState::is_ready).unwrap_or(false) {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn connect_send_disconnect() {
        let opener = MockOpener::new();
        let board = MockHandle::with_handshake_reply("XPDR;fw=3;board=mega;name=MCP");
        opener.attach("COM3", board.clone());
        let reg = registry(opener);

        reg.connect("COM3", Some(57_600)).unwrap();
        assert!(matches!(
            reg.connect("COM3", None),
            Err(DeviceError::AlreadyConnected(_))
        ));
        assert!(wait_ready(&reg, "COM3"));
        assert_eq!(reg.ready_ports(), vec!["COM3".to_string()]);
        assert_eq!(reg.info("COM3").map(|i| i.baud_rate), Some(57_600));

        reg.send_value("COM3", "HDG", 270.0).unwrap();
        assert!(board.written().contains(&"SET HDG 270.0000".to_string()));

        assert!(reg.disconnect("COM3"));
        assert!(!reg.disconnect("COM3"));
        assert!(matches!(
            reg.send_value("COM3", "HDG", 1.0),
            Err(DeviceError::PortNotFound(_))
        ));
    }

    #[test]
    fn legacy_subscriptions_are_uppercased() {
        let opener = MockOpener::new();
        opener.attach("ttyUSB0", MockHandle::with_handshake_reply("XPDR;board=esp32"));
        let reg = registry(opener);
        reg.connect("ttyUSB0", None).unwrap();
        reg.set_subscription("ttyUSB0", "sim/cockpit/gear", "gear").unwrap();
        assert_eq!(
            reg.subscribers_of("sim/cockpit/gear"),
            vec![("ttyUSB0".to_string(), "GEAR".to_string())]
        );
        assert!(reg.remove_subscription("ttyUSB0", "sim/cockpit/gear"));
        assert!(reg.subscribers_of("sim/cockpit/gear").is_empty());
    }
}

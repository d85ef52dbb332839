use crate::packet::{
    decode, decode_beacon, encode_command, encode_data_select, encode_output_target,
    encode_subscribe, encode_write, Beacon, DataRow, InboundPacket,
};
use crate::{Result, SimLinkError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Network settings for the simulator link.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Simulator host; replaced at runtime when discovery adopts a beacon.
    pub host: String,
    pub send_port: u16,
    pub bind_address: String,
    /// Fixed local port the simulator replies to. 0 picks an ephemeral port.
    pub local_port: u16,
    pub poll_interval_ms: u64,
    /// Listen for discovery beacons and follow the simulator they announce.
    pub discovery: bool,
    pub beacon_group: Ipv4Addr,
    pub beacon_port: u16,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            send_port: 49_000,
            bind_address: "0.0.0.0".to_string(),
            local_port: 49_010,
            poll_interval_ms: 10,
            discovery: false,
            beacon_group: Ipv4Addr::new(239, 255, 1, 1),
            beacon_port: 49_707,
        }
    }
}

/// Callbacks raised from the receive worker. All methods default to no-ops.
pub trait SimListener: Send + Sync {
    fn on_value(&self, _name: &str, _value: f32) {}
    fn on_endpoint_changed(&self, _endpoint: SocketAddr) {}
    fn on_data_row(&self, _row: &DataRow) {}
}

pub struct NullSimListener;

impl SimListener for NullSimListener {}

/// One subscribed value (or one element of a subscribed array).
#[derive(Clone, Debug, PartialEq)]
pub struct Subscription {
    pub index: i32,
    pub name: String,
    pub frequency: i32,
    pub last_value: Option<f32>,
    pub is_array: bool,
    pub array_index: Option<usize>,
    pub base_name: String,
}

/// Counters exposed for metrics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub send_errors: u64,
    pub decode_errors: u64,
}

#[derive(Default)]
struct SubscriptionTable {
    /// Name → index, never forgotten so a name keeps its index across re-subscribes.
    indices: HashMap<String, i32>,
    active: BTreeMap<i32, Subscription>,
    next_index: i32,
}

impl SubscriptionTable {
    fn index_for(&mut self, name: &str) -> i32 {
        if let Some(&idx) = self.indices.get(name) {
            return idx;
        }
        let idx = self.next_index;
        self.next_index += 1;
        self.indices.insert(name.to_string(), idx);
        idx
    }

    fn activate(&mut self, sub: Subscription) {
        let frequency = sub.frequency;
        self.active
            .entry(sub.index)
            .and_modify(|s| s.frequency = frequency)
            .or_insert(sub);
    }
}

struct SimShared {
    config: SimConfig,
    endpoint: RwLock<SocketAddr>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    connected: AtomicBool,
    stop: AtomicBool,
    subs: Mutex<SubscriptionTable>,
    virtual_values: RwLock<HashMap<String, f32>>,
    listener: Arc<dyn SimListener>,
    sent: AtomicU64,
    received: AtomicU64,
    send_errors: AtomicU64,
    decode_errors: AtomicU64,
}

impl SimShared {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    fn send(&self, packet: &[u8]) -> Result<()> {
        let socket = self.socket.read().clone();
        let Some(socket) = socket else {
            return Err(SimLinkError::NotConnected);
        };
        let endpoint = *self.endpoint.read();
        match socket.send_to(packet, endpoint) {
            Ok(_) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!(%endpoint, error = %e, "UDP send failed");
                Err(SimLinkError::Io(e.to_string()))
            }
        }
    }

    fn resend_subscriptions(&self) {
        let packets: Vec<(String, Result<Vec<u8>>)> = self
            .subs
            .lock()
            .active
            .values()
            .map(|s| (s.name.clone(), encode_subscribe(s.frequency, s.index, &s.name)))
            .collect();
        let count = packets.len();
        for (name, packet) in packets {
            match packet.and_then(|p| self.send(&p)) {
                Ok(()) => {}
                Err(e) => debug!(%name, error = %e, "could not re-send subscription"),
            }
        }
        if count > 0 {
            info!(count, "re-sent subscriptions");
        }
    }

    fn dispatch(&self, from: SocketAddr, datagram: &[u8]) {
        let packet = match decode(datagram) {
            Ok(p) => p,
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!(%from, error = %e, "dropping datagram");
                return;
            }
        };
        match packet {
            InboundPacket::Values(records) => {
                let updates: Vec<(String, f32)> = {
                    let mut subs = self.subs.lock();
                    records
                        .into_iter()
                        .filter_map(|(idx, value)| match subs.active.get_mut(&idx) {
                            Some(sub) => {
                                sub.last_value = Some(value);
                                Some((sub.name.clone(), value))
                            }
                            None => {
                                debug!(index = idx, "value for unknown subscription");
                                None
                            }
                        })
                        .collect()
                };
                for (name, value) in updates {
                    self.listener.on_value(&name, value);
                }
            }
            InboundPacket::Named { name, value } => self.listener.on_value(&name, value),
            InboundPacket::Beacon(beacon) => self.adopt_beacon(from.ip(), &beacon),
            InboundPacket::Data(rows) => {
                for row in &rows {
                    self.listener.on_data_row(row);
                }
            }
        }
    }

    fn adopt_beacon(&self, source: IpAddr, beacon: &Beacon) {
        let announced = SocketAddr::new(source, beacon.port);
        if *self.endpoint.read() == announced {
            return;
        }
        info!(
            endpoint = %announced,
            host = %beacon.computer_name,
            version = beacon.version,
            "adopting simulator endpoint from beacon"
        );
        *self.endpoint.write() = announced;
        self.listener.on_endpoint_changed(announced);
        if self.connected.load(Ordering::Relaxed) {
            self.resend_subscriptions();
        }
    }
}

/// UDP link to the simulator.
pub struct SimLink {
    shared: Arc<SimShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SimLink {
    pub fn new(config: SimConfig, listener: Arc<dyn SimListener>) -> Result<Self> {
        let endpoint = resolve(&config.host, config.send_port)?;
        Ok(Self {
            shared: Arc::new(SimShared {
                config,
                endpoint: RwLock::new(endpoint),
                socket: RwLock::new(None),
                connected: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                subs: Mutex::new(SubscriptionTable::default()),
                virtual_values: RwLock::new(HashMap::new()),
                listener,
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
                send_errors: AtomicU64::new(0),
                decode_errors: AtomicU64::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Bind the local port and start receiving. Every held subscription is sent again.
    pub fn connect(&self) -> Result<()> {
        if self
            .shared
            .connected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let cfg = &self.shared.config;
        let socket = UdpSocket::bind((cfg.bind_address.as_str(), cfg.local_port))
            .map_err(|e| {
                error!(port = cfg.local_port, error = %e, "failed to bind simulator receive port");
                SimLinkError::Bind {
                    port: cfg.local_port,
                    source: e,
                }
            })
            .and_then(|socket| {
                socket
                    .set_read_timeout(Some(self.shared.poll_interval()))
                    .map_err(|e| SimLinkError::Io(e.to_string()))?;
                Ok(socket)
            });
        let socket = match socket {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.shared.connected.store(false, Ordering::Release);
                return Err(e);
            }
        };

        self.shared.stop.store(false, Ordering::Relaxed);
        *self.shared.socket.write() = Some(Arc::clone(&socket));

        let mut workers = self.workers.lock();
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("sim-recv".into())
            .spawn(move || recv_loop(shared, socket))
        {
            Ok(handle) => workers.push(handle),
            Err(e) => warn!(error = %e, "failed to spawn simulator receive worker"),
        }
        if cfg.discovery {
            let shared = Arc::clone(&self.shared);
            match thread::Builder::new()
                .name("sim-beacon".into())
                .spawn(move || beacon_loop(shared))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!(error = %e, "failed to spawn beacon listener"),
            }
        }
        drop(workers);

        info!(endpoint = %self.endpoint(), local = ?self.local_addr(), "simulator link up");
        self.shared.resend_subscriptions();
        Ok(())
    }

    pub fn disconnect(&self) {
        if !self.shared.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.stop.store(true, Ordering::Relaxed);
        for handle in self.workers.lock().drain(..) {
            let name = handle.thread().name().unwrap_or("sim worker").to_string();
            if handle.join().is_err() {
                warn!(worker = %name, "simulator worker panicked");
            }
        }
        self.shared.socket.write().take();
        info!("simulator link down");
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .socket
            .read()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    pub fn endpoint(&self) -> SocketAddr {
        *self.shared.endpoint.read()
    }

    /// Point the link at a different simulator. Subscriptions follow.
    pub fn set_endpoint(&self, endpoint: SocketAddr) {
        *self.shared.endpoint.write() = endpoint;
        if self.is_connected() {
            self.shared.resend_subscriptions();
        }
    }

    /// Subscribe `name` at `frequency` Hz. With `element_count > 1` each
    /// element `name[i]` gets its own index. Returns the indices in element order.
    pub fn subscribe_value(&self, name: &str, frequency: i32, element_count: usize) -> Result<Vec<i32>> {
        let names: Vec<(String, Option<usize>)> = if element_count > 1 {
            (0..element_count)
                .map(|i| (format!("{name}[{i}]"), Some(i)))
                .collect()
        } else {
            vec![(name.to_string(), None)]
        };

        let mut packets = Vec::with_capacity(names.len());
        let mut indices = Vec::with_capacity(names.len());
        {
            let mut subs = self.shared.subs.lock();
            for (elem, array_index) in names {
                // Validate before the name claims an index.
                encode_subscribe(frequency, 0, &elem)?;
                let index = subs.index_for(&elem);
                packets.push(encode_subscribe(frequency, index, &elem)?);
                subs.activate(Subscription {
                    index,
                    name: elem,
                    frequency,
                    last_value: None,
                    is_array: array_index.is_some(),
                    array_index,
                    base_name: name.to_string(),
                });
                indices.push(index);
            }
        }

        if self.is_connected() {
            for packet in &packets {
                self.shared.send(packet)?;
            }
        }
        debug!(name, frequency, count = indices.len(), "subscribed");
        Ok(indices)
    }

    /// Cancel `name`: a scalar, a whole array by base name, or one `name[i]`
    /// element. Returns how many indices were released.
    pub fn unsubscribe_value(&self, name: &str) -> Result<usize> {
        let removed: Vec<Subscription> = {
            let mut subs = self.shared.subs.lock();
            let doomed: Vec<i32> = subs
                .active
                .values()
                .filter(|s| s.name == name || (s.is_array && s.base_name == name))
                .map(|s| s.index)
                .collect();
            doomed
                .into_iter()
                .filter_map(|idx| subs.active.remove(&idx))
                .collect()
        };
        if self.is_connected() {
            for sub in &removed {
                let packet = encode_subscribe(0, sub.index, &sub.name)?;
                if let Err(e) = self.shared.send(&packet) {
                    warn!(name = %sub.name, error = %e, "unsubscribe not delivered");
                }
            }
        }
        Ok(removed.len())
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.subs.lock().active.values().cloned().collect()
    }

    pub fn is_subscribed(&self, name: &str) -> bool {
        self.shared
            .subs
            .lock()
            .active
            .values()
            .any(|s| s.name == name || s.base_name == name)
    }

    /// Last value the simulator reported for `name`.
    pub fn live_value(&self, name: &str) -> Option<f32> {
        self.shared
            .subs
            .lock()
            .active
            .values()
            .find(|s| s.name == name)
            .and_then(|s| s.last_value)
    }

    /// Last value written locally to `name`, whether or not it reached the simulator.
    pub fn virtual_value(&self, name: &str) -> Option<f32> {
        self.shared.virtual_values.read().get(name).copied()
    }

    pub fn value(&self, name: &str) -> Option<f32> {
        self.live_value(name).or_else(|| self.virtual_value(name))
    }

    /// Write a value. The local cache is updated even when offline.
    pub fn write_value(&self, name: &str, value: f32) -> Result<()> {
        self.shared
            .virtual_values
            .write()
            .insert(name.to_string(), value);
        let packet = encode_write(name, value)?;
        self.shared.send(&packet).map_err(|e| {
            debug!(name, value, error = %e, "write not sent");
            e
        })
    }

    /// Write `text` one byte per element of `name`, then a terminator and
    /// up to three trailing clears, never past `max_len` elements. A character
    /// that does not fit whole is dropped.
    pub fn write_string(&self, name: &str, text: &str, max_len: usize) -> Result<()> {
        let bytes = text.as_bytes();
        let mut used = bytes.len().min(max_len);
        while !text.is_char_boundary(used) {
            used -= 1;
        }
        let clears = (max_len - used).min(4);
        let mut result = Ok(());
        let values = bytes[..used]
            .iter()
            .map(|&b| f32::from(b))
            .chain(std::iter::repeat(0.0).take(clears));
        for (i, value) in values.enumerate() {
            if let Err(e) = self.write_value(&format!("{name}[{i}]"), value) {
                result = Err(e);
            }
        }
        result
    }

    pub fn send_command(&self, name: &str) -> Result<()> {
        let packet = encode_command(name)?;
        debug!(name, "command");
        self.shared.send(&packet)
    }

    /// Choose the rows of the simulator's periodic data output.
    pub fn select_output_rows(&self, rows: &[i32]) -> Result<()> {
        self.shared.send(&encode_data_select(rows))
    }

    /// Ask the simulator to stream data output to `ip:port`.
    pub fn set_output_target(&self, ip: Ipv4Addr, port: u16) -> Result<()> {
        self.shared.send(&encode_output_target(ip, port))
    }

    pub fn stats(&self) -> SimStats {
        SimStats {
            packets_sent: self.shared.sent.load(Ordering::Relaxed),
            packets_received: self.shared.received.load(Ordering::Relaxed),
            send_errors: self.shared.send_errors.load(Ordering::Relaxed),
            decode_errors: self.shared.decode_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SimLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| SimLinkError::InvalidAddress(format!("{host}:{port}: {e}")))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| SimLinkError::InvalidAddress(format!("{host}:{port}")))
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn recv_loop(shared: Arc<SimShared>, socket: Arc<UdpSocket>) {
    let mut buf = [0u8; 4096];
    while !shared.stop.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                shared.received.fetch_add(1, Ordering::Relaxed);
                shared.dispatch(from, &buf[..n]);
            }
            Err(e) if is_timeout(e.kind()) => continue,
            Err(e) => {
                // ICMP unreachable from a closed simulator port surfaces here on some platforms.
                debug!(error = %e, "UDP receive error");
                thread::sleep(shared.poll_interval());
            }
        }
    }
}

fn beacon_loop(shared: Arc<SimShared>) {
    let cfg = &shared.config;
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, cfg.beacon_port)) {
        Ok(s) => s,
        Err(e) => {
            warn!(port = cfg.beacon_port, error = %e, "beacon listener unavailable");
            return;
        }
    };
    if let Err(e) = socket.join_multicast_v4(&cfg.beacon_group, &Ipv4Addr::UNSPECIFIED) {
        warn!(group = %cfg.beacon_group, error = %e, "could not join beacon group");
        return;
    }
    if socket.set_read_timeout(Some(Duration::from_millis(200))).is_err() {
        return;
    }
    let mut buf = [0u8; 1024];
    while !shared.stop.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => match decode_beacon(&buf[..n]) {
                Ok(beacon) => shared.adopt_beacon(from.ip(), &beacon),
                Err(e) => debug!(%from, error = %e, "ignoring non-beacon datagram"),
            },
            Err(e) if is_timeout(e.kind()) => continue,
            Err(e) => {
                debug!(error = %e, "beacon receive error");
                thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

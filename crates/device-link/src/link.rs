//! One board, one worker thread.
//!
//! The worker owns the connect → handshake → ready → active progression and
//! then loops reading lines until asked to stop or the channel fails. The
//! worker owns the read half; writes from other threads go through a separate
//! write half behind its own lock.

use crate::protocol::{
    parse_handshake, parse_line, DeviceMessage, HostCommand, GREETING, HANDSHAKE_MARKER,
};
use crate::{BoardFamily, ChannelOpener, DeviceError, LineChannel, LineWriter, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    #[default]
    Disconnected,
    Connecting,
    Handshake,
    Ready,
    Active,
    Error,
}

impl DeviceState {
    /// Ready and Active devices accept outbound frames.
    pub fn is_ready(self) -> bool {
        matches!(self, DeviceState::Ready | DeviceState::Active)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Connecting => "connecting",
            DeviceState::Handshake => "handshake",
            DeviceState::Ready => "ready",
            DeviceState::Active => "active",
            DeviceState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Timing and line parameters for a device link.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub baud_rate: u32,
    /// Boards reset when the port opens; wait this long before greeting.
    pub settle_delay_ms: u64,
    pub handshake_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Upper bound on waiting for the worker during disconnect.
    pub join_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            settle_delay_ms: 2_000,
            handshake_timeout_ms: 3_000,
            poll_interval_ms: 20,
            join_timeout_ms: 1_000,
        }
    }
}

impl LinkConfig {
    fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
    fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
    fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Read-only snapshot of one device.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub port: String,
    pub baud_rate: u32,
    pub state: DeviceState,
    pub board_type: Option<String>,
    pub board_family: BoardFamily,
    pub firmware_version: Option<String>,
    pub device_name: Option<String>,
    /// Legacy direct mode: simulator value name → key on this board.
    pub subscriptions: BTreeMap<String, String>,
    pub inputs: BTreeMap<String, f32>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

/// Callbacks raised from the device worker. All methods default to no-ops.
pub trait DeviceListener: Send + Sync {
    fn on_state_changed(&self, _port: &str, _state: DeviceState) {}
    fn on_line(&self, _port: &str, _line: &str) {}
    fn on_input(&self, _port: &str, _key: &str, _value: f32) {}
    fn on_dref_write(&self, _port: &str, _name: &str, _value: f32) {}
    fn on_command(&self, _port: &str, _name: &str) {}
}

/// Listener that ignores everything.
pub struct NullListener;

impl DeviceListener for NullListener {}

struct LinkShared {
    port: String,
    config: LinkConfig,
    info: RwLock<DeviceInfo>,
    writer: Mutex<Option<Box<dyn LineWriter>>>,
    stop: AtomicBool,
    listener: Arc<dyn DeviceListener>,
}

impl LinkShared {
    fn state(&self) -> DeviceState {
        self.info.read().state
    }

    fn set_state(&self, state: DeviceState) {
        {
            let mut info = self.info.write();
            if info.state == state {
                return;
            }
            info.state = state;
            if state != DeviceState::Error {
                info.error_message = None;
            }
        }
        debug!(port = %self.port, %state, "device state changed");
        self.listener.on_state_changed(&self.port, state);
    }

    fn fail(&self, message: String) {
        warn!(port = %self.port, error = %message, "device link failed");
        self.info.write().error_message = Some(message);
        self.set_state(DeviceState::Error);
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock();
        match guard.as_mut() {
            Some(writer) => writer.write_line(line),
            None => Err(DeviceError::Io("channel closed".to_string())),
        }
    }
}

/// A live connection to one board.
pub struct DeviceLink {
    shared: Arc<LinkShared>,
    worker: Option<JoinHandle<()>>,
}

impl DeviceLink {
    /// Start the worker for `port`. The returned link is in `Connecting`; watch
    /// the listener or [`DeviceLink::state`] for progress.
    pub fn spawn(
        port: &str,
        config: LinkConfig,
        opener: Arc<dyn ChannelOpener>,
        listener: Arc<dyn DeviceListener>,
    ) -> Self {
        let info = DeviceInfo {
            port: port.to_string(),
            baud_rate: config.baud_rate,
            ..DeviceInfo::default()
        };
        let shared = Arc::new(LinkShared {
            port: port.to_string(),
            config,
            info: RwLock::new(info),
            writer: Mutex::new(None),
            stop: AtomicBool::new(false),
            listener,
        });
        shared.set_state(DeviceState::Connecting);
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("device-{port}"))
            .spawn(move || run_worker(worker_shared, opener));
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                shared.fail(format!("failed to spawn worker: {e}"));
                None
            }
        };
        Self { shared, worker }
    }

    pub fn port(&self) -> &str {
        &self.shared.port
    }

    pub fn state(&self) -> DeviceState {
        self.shared.state()
    }

    pub fn info(&self) -> DeviceInfo {
        self.shared.info.read().clone()
    }

    /// Map a simulator value directly to a key on this board (legacy mode).
    pub fn set_subscription(&self, source: &str, key: &str) {
        self.shared
            .info
            .write()
            .subscriptions
            .insert(source.to_string(), key.to_ascii_uppercase());
    }

    pub fn remove_subscription(&self, source: &str) -> bool {
        self.shared.info.write().subscriptions.remove(source).is_some()
    }

    /// `SET <key> <value>` with four decimals.
    pub fn send_value(&self, key: &str, value: f32) -> Result<()> {
        self.send(HostCommand::Set {
            key: key.to_string(),
            value,
        })
    }

    /// Write a raw line.
    pub fn send_command(&self, raw: &str) -> Result<()> {
        self.send(HostCommand::Raw(raw.to_string()))
    }

    pub fn send_dref_command(&self, name: &str, value: f32) -> Result<()> {
        self.send(HostCommand::Dref {
            name: name.to_string(),
            value,
        })
    }

    pub fn send_cmd_command(&self, name: &str) -> Result<()> {
        self.send(HostCommand::Cmd {
            name: name.to_string(),
        })
    }

    fn send(&self, cmd: HostCommand) -> Result<()> {
        let state = self.state();
        if !state.is_ready() {
            return Err(DeviceError::NotReady {
                port: self.shared.port.clone(),
                state,
            });
        }
        let line = cmd.encode();
        self.shared.write_line(&line).map_err(|e| {
            warn!(port = %self.shared.port, error = %e, "write failed");
            e
        })
    }

    /// Stop the worker, wait for it up to the join timeout, then close the channel.
    pub fn disconnect(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            let deadline = Instant::now() + self.shared.config.join_timeout();
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!(port = %self.shared.port, "device worker panicked");
                }
            } else {
                warn!(port = %self.shared.port, "device worker did not exit in time; detaching");
            }
        }
        self.shared.writer.lock().take();
        if self.shared.state() != DeviceState::Error {
            self.shared.set_state(DeviceState::Disconnected);
        }
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}

fn run_worker(shared: Arc<LinkShared>, opener: Arc<dyn ChannelOpener>) {
    let mut channel = match opener
        .open(&shared.port, shared.config.baud_rate)
        .and_then(|mut channel| Ok((channel.writer()?, channel)))
    {
        Ok((writer, channel)) => {
            *shared.writer.lock() = Some(writer);
            channel
        }
        Err(e) => {
            shared.fail(format!("failed to open {}: {e}", shared.port));
            return;
        }
    };

    if !settle(&shared) {
        return;
    }
    if let Err(e) = channel.clear_buffers() {
        debug!(port = %shared.port, error = %e, "could not clear buffers");
    }

    shared.set_state(DeviceState::Handshake);
    match handshake(&shared, channel.as_mut()) {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            shared.fail(e.to_string());
            return;
        }
    }
    shared.set_state(DeviceState::Ready);

    while !shared.stopping() {
        match channel.read_line(shared.config.poll_interval()) {
            Ok(Some(line)) => handle_line(&shared, &line),
            Ok(None) => continue,
            Err(e) => {
                if shared.stopping() {
                    break;
                }
                warn!(port = %shared.port, error = %e, "serial read failed");
                if shared.state() != DeviceState::Error {
                    shared.set_state(DeviceState::Disconnected);
                }
                return;
            }
        }
    }
}

/// Sleep through the board's reset time. Returns false if stopped meanwhile.
fn settle(shared: &LinkShared) -> bool {
    let deadline = Instant::now() + shared.config.settle_delay();
    while Instant::now() < deadline {
        if shared.stopping() {
            return false;
        }
        thread::sleep(
            shared
                .config
                .poll_interval()
                .min(deadline.saturating_duration_since(Instant::now())),
        );
    }
    !shared.stopping()
}

/// Greet and wait for the reply. `Ok(false)` means the link was stopped.
fn handshake(shared: &LinkShared, channel: &mut dyn LineChannel) -> Result<bool> {
    shared.write_line(GREETING)?;
    let deadline = Instant::now() + shared.config.handshake_timeout();
    while Instant::now() < deadline {
        if shared.stopping() {
            return Ok(false);
        }
        let Some(line) = channel.read_line(shared.config.poll_interval())? else {
            continue;
        };
        if !line.trim_start().starts_with(HANDSHAKE_MARKER) {
            debug!(port = %shared.port, line = %line, "ignoring pre-handshake line");
            continue;
        }
        let hs = parse_handshake(&line)?;
        info!(
            port = %shared.port,
            fw = hs.firmware_version.as_deref().unwrap_or("?"),
            board = %hs.board_family,
            name = hs.device_name.as_deref().unwrap_or("?"),
            "handshake complete"
        );
        let mut info = shared.info.write();
        info.firmware_version = hs.firmware_version;
        info.board_type = hs.board;
        info.board_family = hs.board_family;
        info.device_name = hs.device_name;
        info.last_seen = Some(OffsetDateTime::now_utc());
        return Ok(true);
    }
    Err(DeviceError::Handshake(format!(
        "no {HANDSHAKE_MARKER} reply within {} ms",
        shared.config.handshake_timeout_ms
    )))
}

fn handle_line(shared: &LinkShared, line: &str) {
    shared.info.write().last_seen = Some(OffsetDateTime::now_utc());
    if shared.state() == DeviceState::Ready {
        shared.set_state(DeviceState::Active);
    }
    shared.listener.on_line(&shared.port, line);

    let msg = match parse_line(line) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(port = %shared.port, error = %e, "skipping line");
            return;
        }
    };
    match msg {
        DeviceMessage::Input { key, value } => {
            shared.info.write().inputs.insert(key.clone(), value);
            shared.listener.on_input(&shared.port, &key, value);
        }
        DeviceMessage::Dref { name, value } => {
            shared.listener.on_dref_write(&shared.port, &name, value);
        }
        DeviceMessage::Cmd { name } => shared.listener.on_command(&shared.port, &name),
        DeviceMessage::Ack(text) => debug!(port = %shared.port, %text, "ack"),
        DeviceMessage::Status(text) => info!(port = %shared.port, %text, "device status"),
        DeviceMessage::Handshake(_) => debug!(port = %shared.port, "late handshake reply"),
        DeviceMessage::Unknown(text) => debug!(port = %shared.port, %text, "unknown line"),
    }
}

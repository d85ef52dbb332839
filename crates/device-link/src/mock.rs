use crate::protocol::GREETING;
use crate::{ChannelOpener, DeviceError, LineChannel, LineWriter, PortInfo, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MockState {
    inbound: VecDeque<String>,
    outbound: Vec<String>,
    handshake_reply: Option<String>,
    fail_reads: bool,
}

#[derive(Default)]
struct MockInner {
    state: Mutex<MockState>,
    ready: Condvar,
}

/// Test-side handle to an in-process board. Clones share the same board.
#[derive(Clone, Default)]
pub struct MockHandle {
    inner: Arc<MockInner>,
}

impl MockHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A board that answers the greeting with `reply`.
    pub fn with_handshake_reply(reply: &str) -> Self {
        let handle = Self::new();
        handle.inner.state.lock().handshake_reply = Some(reply.to_string());
        handle
    }

    /// Queue a line as if the board had printed it.
    pub fn push_line(&self, line: &str) {
        self.inner.state.lock().inbound.push_back(line.to_string());
        self.inner.ready.notify_all();
    }

    /// Every line the host wrote so far, oldest first.
    pub fn written(&self) -> Vec<String> {
        self.inner.state.lock().outbound.clone()
    }

    pub fn take_written(&self) -> Vec<String> {
        std::mem::take(&mut self.inner.state.lock().outbound)
    }

    /// Make the next read fail as if the cable was pulled.
    pub fn fail_reads(&self) {
        self.inner.state.lock().fail_reads = true;
        self.inner.ready.notify_all();
    }

    pub fn channel(&self) -> MockChannel {
        MockChannel {
            handle: self.clone(),
        }
    }
}

/// Channel end owned by the device worker.
pub struct MockChannel {
    handle: MockHandle,
}

impl LineChannel for MockChannel {
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        let inner = &self.handle.inner;
        let mut state = inner.state.lock();
        if state.inbound.is_empty() && !state.fail_reads {
            let _ = inner.ready.wait_for(&mut state, timeout);
        }
        if state.fail_reads {
            return Err(DeviceError::Io("mock link lost".to_string()));
        }
        Ok(state.inbound.pop_front())
    }

    fn writer(&mut self) -> Result<Box<dyn LineWriter>> {
        Ok(Box::new(MockWriter {
            handle: self.handle.clone(),
        }))
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.handle.inner.state.lock().inbound.clear();
        Ok(())
    }
}

/// Write end handed to other threads. A greeting triggers the board's reply.
pub struct MockWriter {
    handle: MockHandle,
}

impl LineWriter for MockWriter {
    fn write_line(&mut self, line: &str) -> Result<()> {
        let inner = &self.handle.inner;
        let mut state = inner.state.lock();
        state.outbound.push(line.to_string());
        if line == GREETING {
            if let Some(reply) = state.handshake_reply.clone() {
                state.inbound.push_back(reply);
                inner.ready.notify_all();
            }
        }
        Ok(())
    }
}

/// Opens mock channels for ports registered with [`MockOpener::attach`].
#[derive(Clone, Default)]
pub struct MockOpener {
    boards: Arc<Mutex<HashMap<String, MockHandle>>>,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, port: &str, board: MockHandle) {
        self.boards.lock().insert(port.to_string(), board);
    }
}

impl ChannelOpener for MockOpener {
    fn open(&self, port: &str, _baud_rate: u32) -> Result<Box<dyn LineChannel>> {
        let boards = self.boards.lock();
        let board = boards
            .get(port)
            .ok_or_else(|| DeviceError::PortNotFound(port.to_string()))?;
        Ok(Box::new(board.channel()))
    }

    fn list(&self) -> Result<Vec<PortInfo>> {
        let mut out: Vec<PortInfo> = self
            .boards
            .lock()
            .keys()
            .map(|name| PortInfo {
                name: name.clone(),
                driver: "mock".to_string(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

use crate::{DeviceError, Result};
use std::time::Duration;

/// A minimal blocking line channel to one board.
pub trait LineChannel: Send {
    /// Read one line without its terminator. Returns `Ok(None)` when nothing
    /// complete arrived before `timeout`.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>>;

    /// A handle that writes to the same board. Reads and writes go through
    /// separate handles so a write never waits behind a blocked read.
    fn writer(&mut self) -> Result<Box<dyn LineWriter>>;

    /// Discard anything pending in both directions.
    fn clear_buffers(&mut self) -> Result<()> {
        Err(DeviceError::Unsupported("buffer clearing not supported"))
    }
}

/// Write half of a [`LineChannel`].
pub trait LineWriter: Send {
    /// Write one line; the terminator is appended by the writer.
    fn write_line(&mut self, line: &str) -> Result<()>;
}

/// Opens channels by port name. One opener serves every device of a backend.
pub trait ChannelOpener: Send + Sync {
    fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn LineChannel>>;

    /// Attempt to list ports reachable through this backend.
    fn list(&self) -> Result<Vec<PortInfo>>;
}

#[derive(Clone, Debug)]
pub struct PortInfo {
    pub name: String,
    pub driver: String,
}

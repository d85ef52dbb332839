use crate::protocol::take_line;
use crate::{ChannelOpener, DeviceError, LineChannel, LineWriter, PortInfo, Result};
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

/// A board attached through an OS serial port.
pub struct SerialChannel {
    _port_path: String,
    port: Box<dyn SerialPort>,
    acc: Vec<u8>,
}

impl SerialChannel {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| DeviceError::Io(e.to_string()))?;
        Ok(SerialChannel {
            _port_path: path.to_string(),
            port,
            acc: Vec::with_capacity(128),
        })
    }
}

impl LineChannel for SerialChannel {
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];
        loop {
            if let Some(line) = take_line(&mut self.acc) {
                if line.trim().is_empty() {
                    continue;
                }
                return Ok(Some(line));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.port.set_timeout(deadline - now).ok();
            match self.port.read(&mut buf) {
                Ok(n) if n > 0 => self.acc.extend_from_slice(&buf[..n]),
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(None),
                Err(e) => return Err(DeviceError::Io(e.to_string())),
            }
        }
    }

    fn writer(&mut self) -> Result<Box<dyn LineWriter>> {
        let port = self
            .port
            .try_clone()
            .map_err(|e| DeviceError::Io(e.to_string()))?;
        Ok(Box::new(SerialWriter { port }))
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.acc.clear();
        self.port
            .clear(ClearBuffer::All)
            .map_err(|e| DeviceError::Io(e.to_string()))
    }
}

/// Cloned OS handle used only for writing.
pub struct SerialWriter {
    port: Box<dyn SerialPort>,
}

impl LineWriter for SerialWriter {
    fn write_line(&mut self, line: &str) -> Result<()> {
        self.port
            .write_all(line.as_bytes())
            .and_then(|_| self.port.write_all(b"\n"))
            .and_then(|_| self.port.flush())
            .map_err(|e| DeviceError::Io(e.to_string()))
    }
}

/// Opens [`SerialChannel`]s through the `serialport` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialOpener;

impl ChannelOpener for SerialOpener {
    fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn LineChannel>> {
        Ok(Box::new(SerialChannel::open(port, baud_rate)?))
    }

    fn list(&self) -> Result<Vec<PortInfo>> {
        let mut out = Vec::new();
        for p in serialport::available_ports().map_err(|e| DeviceError::Io(e.to_string()))? {
            let driver = match p.port_type {
                SerialPortType::UsbPort(_) => "usb-serial",
                SerialPortType::BluetoothPort => "bluetooth",
                _ => "serial",
            };
            out.push(PortInfo {
                name: p.port_name,
                driver: driver.to_string(),
            });
        }
        Ok(out)
    }
}

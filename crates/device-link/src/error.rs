use crate::DeviceState;
use thiserror::Error;

pub type Result<T, E = DeviceError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("port not found: {0}")]
    PortNotFound(String),
    #[error("device {port} is not ready (state: {state})")]
    NotReady { port: String, state: DeviceState },
    #[error("device already connected: {0}")]
    AlreadyConnected(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("timeout")]
    Timeout,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("invalid line: {0}")]
    InvalidLine(String),
    #[error("operation not supported on this backend: {0}")]
    Unsupported(&'static str),
}

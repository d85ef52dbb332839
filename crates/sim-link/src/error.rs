use thiserror::Error;

pub type Result<T, E = SimLinkError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SimLinkError {
    #[error("failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("not connected to the simulator")]
    NotConnected,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("invalid name {name:?} (1..={max} bytes)")]
    InvalidName { name: String, max: usize },
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),
    #[error("unknown packet tag: {0}")]
    UnknownTag(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

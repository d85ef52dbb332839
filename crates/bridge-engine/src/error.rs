use device_link::DeviceError;
use sim_link::SimLinkError;
use thiserror::Error;

pub type Result<T, E = BridgeError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("simulator link: {0}")]
    Sim(#[from] SimLinkError),
    #[error("device link: {0}")]
    Device(#[from] DeviceError),
    #[error("invalid target: {0:?}")]
    InvalidTarget(String),
    #[error("unknown logic block: {0}")]
    UnknownBlock(String),
    #[error("logic block {0} re-entered while firing")]
    TriggerCycle(String),
    #[error("invalid profile: {0}")]
    Profile(String),
    #[error("metrics init error: {0}")]
    Metrics(String),
    #[error("bridge scheduler is already running")]
    AlreadyRunning,
}

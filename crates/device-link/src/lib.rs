//! device-link: line-oriented serial links to cockpit boards
//!
//! Each attached board runs its own worker thread that opens the port, waits for
//! the board to settle, performs the `HELLO`/`XPDR` handshake and then streams
//! `INPUT`/`DREF`/`CMD` lines to a [`DeviceListener`]. Outbound `SET`, `DREF`
//! and `CMD` frames are only accepted once a device is ready. The default build
//! enables a `mock` backend so tests run without hardware.

pub mod protocol;
pub use protocol::{BoardFamily, DeviceMessage, HandshakeInfo, HostCommand};

mod error;
pub use error::{DeviceError, Result};

mod channel;
pub use channel::{ChannelOpener, LineChannel, LineWriter, PortInfo};

mod link;
pub use link::{DeviceInfo, DeviceLink, DeviceListener, DeviceState, LinkConfig, NullListener};

mod registry;
pub use registry::DeviceRegistry;

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockChannel, MockHandle, MockOpener, MockWriter};

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::{SerialChannel, SerialOpener, SerialWriter};

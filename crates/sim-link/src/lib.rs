//! sim-link: UDP plumbing to the flight simulator
//!
//! [`packet`] holds the datagram codecs. [`SimLink`] owns the socket, keeps the
//! subscription table (one index per value, one per array element), re-sends
//! it after every (re)connect and reports incoming values to a [`SimListener`].
//! With discovery enabled a second worker follows the simulator's multicast
//! beacon.

pub mod packet;
pub use packet::{Beacon, DataRow, InboundPacket};

mod error;
pub use error::{Result, SimLinkError};

mod link;
pub use link::{NullSimListener, SimConfig, SimLink, SimListener, SimStats, Subscription};

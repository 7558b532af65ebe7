//! Network management and device communication module
//!
//! This module owns the UDP sockets, the per-device transports, the
//! request/response router and device discovery.

pub mod discovery;
pub mod router;
pub mod socket;
pub mod transport;

pub use self::discovery::{DeviceServer, DeviceServerHandle};
pub use self::router::{PendingTable, Router, RouterConfig};
pub use self::transport::{Datagram, OutboundSender, Subscription, Transport};

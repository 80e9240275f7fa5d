//! Networking: endpoint addressing, timestamping sockets, and datagram
//! receives with control-message parsing.

mod dgram;
mod endpoint;
mod socket;

pub use dgram::{Dgram, DgramReader};
pub use endpoint::Endpoint;
pub use socket::UdpSocket;

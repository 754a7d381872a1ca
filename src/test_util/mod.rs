//! Utilities for testing code built on the messaging layer. They are used for testing
//!  this crate itself, but they are also exported for application testing.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::comm::peer::{PeerAddr, PeerHandle};

pub fn test_addr_from_number(n: u16) -> PeerAddr {
    PeerAddr::from(SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::LOCALHOST,
        10000 + n,
    )))
}

/// a connected peer with a deterministic address and boot id derived from the number
pub fn test_peer_from_number(n: u16) -> PeerHandle {
    PeerHandle::new(test_addr_from_number(n), n as u64)
}

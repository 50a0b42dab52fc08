//! Utilities for testing code built on the connection engine: stand-in transports and
//!  connectors, and helpers for deterministic addresses and GUIDs. They are part of the regular
//!  (non-#[cfg(test)]) code so applications can use them in their own tests.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::protocol::guid::ServerGuid;

pub mod transport;

/// convenience method for unit test code: create a server address based on a number, the same
///  number generating the same address and different numbers different addresses
pub fn test_addr(number: u8) -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, number), 5075).into()
}

/// a GUID derived from a number, see [test_addr]
pub fn test_guid(number: u8) -> ServerGuid {
    ServerGuid([number; ServerGuid::LEN])
}

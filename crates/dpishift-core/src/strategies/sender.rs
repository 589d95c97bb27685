//! Raw packet sender seam

use crate::error::Result;
use std::net::IpAddr;

/// Injects complete IP packets, bypassing the interception path.
///
/// Implementations must be usable from many strategy tasks at once.
#[cfg_attr(test, mockall::automock)]
pub trait PacketSender: Send + Sync {
    /// Send one IPv4 or IPv6 packet toward `dst`
    fn send(&self, packet: &[u8], dst: IpAddr) -> Result<()>;
}

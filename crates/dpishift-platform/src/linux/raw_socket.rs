//! Raw IP injection
//!
//! Packets leave through `IPPROTO_RAW` sockets, which imply a caller-built
//! IP header. Every socket carries `SO_MARK` so the firewall rule that
//! feeds the queues can skip our own traffic.

use crate::error::{PlatformError, Result};
use dpishift_core::PacketSender;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use tracing::{info, trace, warn};

const IPPROTO_RAW: i32 = 255;

/// Mark-tagged raw sockets for both address families
#[derive(Debug)]
pub struct RawSender {
    v4: Socket,
    v6: Option<Socket>,
    mark: u32,
}

impl RawSender {
    /// Open the sockets.
    ///
    /// IPv4 is required. IPv6 is optional so hosts with IPv6 disabled still
    /// work; IPv6 plans then fail at send time.
    ///
    /// # Errors
    /// Returns [`PlatformError::PermissionDenied`] without `CAP_NET_RAW`.
    pub fn open(mark: u32) -> Result<Self> {
        let v4 = open_socket(Domain::IPV4, mark).map_err(|e| PlatformError::raw_socket("IPv4", e))?;
        let v6 = match open_socket(Domain::IPV6, mark) {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!(error = %e, "IPv6 raw socket unavailable, IPv6 injection disabled");
                None
            }
        };
        info!(mark = format_args!("{mark:#x}"), ipv6 = v6.is_some(), "raw sender ready");
        Ok(Self { v4, v6, mark })
    }

    /// Firewall mark on injected packets
    pub fn mark(&self) -> u32 {
        self.mark
    }
}

fn open_socket(domain: Domain, mark: u32) -> std::io::Result<Socket> {
    let socket = Socket::new(domain, Type::RAW, Some(Protocol::from(IPPROTO_RAW)))?;
    socket.set_mark(mark)?;
    Ok(socket)
}

impl PacketSender for RawSender {
    fn send(&self, packet: &[u8], dst: IpAddr) -> dpishift_core::Result<()> {
        let socket = match dst {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => self.v6.as_ref().ok_or_else(|| dpishift_core::Error::Send {
                dst,
                source: std::io::Error::from(std::io::ErrorKind::Unsupported),
            })?,
        };
        let addr = SockAddr::from(SocketAddr::new(dst, 0));
        socket
            .send_to(packet, &addr)
            .map_err(|source| dpishift_core::Error::Send { dst, source })?;
        trace!(%dst, len = packet.len(), "injected");
        Ok(())
    }
}

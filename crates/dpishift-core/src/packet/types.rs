//! Packet type definitions

use bitflags::bitflags;

/// IP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

/// Transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP (protocol number 6)
    Tcp,
    /// UDP (protocol number 17)
    Udp,
    /// Anything else; carried only so the worker can pass it through
    Other(u8),
}

impl Protocol {
    /// Create from protocol number
    pub fn from_u8(proto: u8) -> Self {
        match proto {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            other => Protocol::Other(other),
        }
    }

    /// Get protocol number
    pub fn to_u8(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Other(n) => n,
        }
    }
}

bitflags! {
    /// TCP header flags (byte 13 of the TCP header)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        /// FIN flag
        const FIN = 0x01;
        /// SYN flag
        const SYN = 0x02;
        /// RST flag
        const RST = 0x04;
        /// PSH flag
        const PSH = 0x08;
        /// ACK flag
        const ACK = 0x10;
        /// URG flag
        const URG = 0x20;
        /// ECE flag
        const ECE = 0x40;
        /// CWR flag
        const CWR = 0x80;
    }
}

impl TcpFlags {
    /// A bare SYN (no ACK), i.e. the first packet of a handshake
    pub fn is_syn_only(self) -> bool {
        self.contains(Self::SYN) && !self.contains(Self::ACK)
    }
}

/// Common well-known ports
pub mod ports {
    /// HTTPS port
    pub const HTTPS: u16 = 443;
    /// DNS port
    pub const DNS: u16 = 53;
    /// QUIC port (same as HTTPS)
    pub const QUIC: u16 = 443;
}

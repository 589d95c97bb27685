//! Packet parsing and manipulation
//!
//! Low-level packet handling for TCP/IP traffic. Parsing is bounds-checked
//! throughout: every accessor either succeeds or returns
//! [`Error::PacketTooSmall`] / [`Error::PacketParse`], it never panics on
//! hostile input.

mod builder;
pub mod checksum;
mod types;

pub use builder::{fragment_ipv4, PacketBuilder, SegmentBuilder};
pub use checksum::{corrupt_l4_checksum, fix_checksums, internet_checksum, verify_checksums};
pub use types::*;

use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Maximum hostname length (DNS standard)
pub const MAX_HOSTNAME_LEN: usize = 253;

/// IPv6 extension headers we are willing to walk past
const IPV6_EXT_HOP_BY_HOP: u8 = 0;
const IPV6_EXT_ROUTING: u8 = 43;
const IPV6_EXT_FRAGMENT: u8 = 44;
const IPV6_EXT_DEST_OPTS: u8 = 60;

/// IP-level layout of a raw packet
#[derive(Debug, Clone, Copy)]
pub(crate) struct IpLayout {
    pub version: IpVersion,
    /// Offset of the transport header (includes IPv6 extension headers)
    pub ip_hdr_len: usize,
    /// Transport protocol number
    pub proto: u8,
    /// Declared datagram length, clamped to the buffer
    pub total_len: usize,
    /// Any kind of IP fragment
    pub fragmented: bool,
}

#[inline]
fn be16(data: &[u8], at: usize) -> Result<u16> {
    data.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| Error::too_small(at + 2, data.len()))
}

#[inline]
fn be32(data: &[u8], at: usize) -> Result<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::too_small(at + 4, data.len()))
}

pub(crate) fn ip_layout(data: &[u8]) -> Result<IpLayout> {
    let first = *data.first().ok_or_else(|| Error::too_small(1, 0))?;
    match first >> 4 {
        4 => ipv4_layout(data),
        6 => ipv6_layout(data),
        v => Err(Error::packet_parse(format!("Unknown IP version: {v}"))),
    }
}

fn ipv4_layout(data: &[u8]) -> Result<IpLayout> {
    if data.len() < 20 {
        return Err(Error::too_small(20, data.len()));
    }
    let ihl = usize::from(data[0] & 0x0F) * 4;
    if ihl < 20 {
        return Err(Error::packet_parse_at(format!("IHL too small: {ihl}"), 0));
    }
    let declared = usize::from(be16(data, 2)?);
    if declared < ihl {
        return Err(Error::packet_parse_at("total length below header length", 2));
    }
    if data.len() < ihl {
        return Err(Error::too_small(ihl, data.len()));
    }
    let frag = be16(data, 6)?;
    Ok(IpLayout {
        version: IpVersion::V4,
        ip_hdr_len: ihl,
        proto: data[9],
        total_len: declared.min(data.len()),
        fragmented: frag & 0x3FFF != 0,
    })
}

fn ipv6_layout(data: &[u8]) -> Result<IpLayout> {
    if data.len() < 40 {
        return Err(Error::too_small(40, data.len()));
    }
    let total_len = (40 + usize::from(be16(data, 4)?)).min(data.len());
    let mut next = data[6];
    let mut offset = 40;
    let mut fragmented = false;

    loop {
        match next {
            IPV6_EXT_HOP_BY_HOP | IPV6_EXT_ROUTING | IPV6_EXT_DEST_OPTS => {
                let hdr = data
                    .get(offset..offset + 2)
                    .ok_or_else(|| Error::too_small(offset + 2, data.len()))?;
                next = hdr[0];
                offset += (usize::from(hdr[1]) + 1) * 8;
            }
            IPV6_EXT_FRAGMENT => {
                let hdr = data
                    .get(offset..offset + 8)
                    .ok_or_else(|| Error::too_small(offset + 8, data.len()))?;
                next = hdr[0];
                fragmented = true;
                offset += 8;
            }
            _ => break,
        }
        if offset > total_len {
            return Err(Error::packet_parse_at("extension header overruns packet", offset));
        }
    }

    Ok(IpLayout {
        version: IpVersion::V6,
        ip_hdr_len: offset,
        proto: next,
        total_len,
        fragmented,
    })
}

/// 5-tuple identifying one direction of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Transport protocol
    pub protocol: Protocol,
    /// Source address and port
    pub src: SocketAddr,
    /// Destination address and port
    pub dst: SocketAddr,
}

impl FlowKey {
    /// Create a new flow key
    pub fn new(protocol: Protocol, src: SocketAddr, dst: SocketAddr) -> Self {
        Self { protocol, src, dst }
    }

    /// The same flow seen from the other direction
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            protocol: self.protocol,
            src: self.dst,
            dst: self.src,
        }
    }
}

/// Which address of a packet to rewrite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Source address
    Source,
    /// Destination address
    Destination,
}

/// Replace one address of a packet in place and recompute its checksums.
///
/// `addr` must be of the packet's IP version.
pub fn rewrite_address(pkt: &mut [u8], endpoint: Endpoint, addr: IpAddr) -> Result<()> {
    let layout = ip_layout(pkt)?;
    match (layout.version, addr) {
        (IpVersion::V4, IpAddr::V4(a)) => {
            let at = if endpoint == Endpoint::Source { 12 } else { 16 };
            pkt[at..at + 4].copy_from_slice(&a.octets());
        }
        (IpVersion::V6, IpAddr::V6(a)) => {
            let at = if endpoint == Endpoint::Source { 8 } else { 24 };
            pkt[at..at + 16].copy_from_slice(&a.octets());
        }
        _ => return Err(Error::packet_parse("address family mismatch")),
    }
    fix_checksums(pkt)
}

/// Overwrite the IPv4 identification of `pkt`. IPv6 packets are left as is.
///
/// Only the IP header checksum is refreshed; the transport checksum does
/// not cover the identification, so a deliberately corrupted one survives.
pub fn set_ipv4_id(pkt: &mut [u8], id: u16) -> Result<()> {
    let layout = ip_layout(pkt)?;
    if layout.version == IpVersion::V4 {
        pkt[4..6].copy_from_slice(&id.to_be_bytes());
        checksum::refresh_ipv4_header(pkt, layout.ip_hdr_len);
    }
    Ok(())
}

/// True for any IPv4 or IPv6 fragment
pub fn is_fragment(pkt: &[u8]) -> bool {
    ip_layout(pkt).is_ok_and(|layout| layout.fragmented)
}

/// Packet-scoped view over a raw IPv4/IPv6 TCP or UDP packet.
///
/// Borrows the original buffer; nothing is copied until a strategy builds a
/// new packet from it.
#[derive(Debug, Clone, Copy)]
pub struct PacketInfo<'a> {
    data: &'a [u8],
    /// IP version
    pub ip_version: IpVersion,
    /// Transport protocol
    pub protocol: Protocol,
    /// Length of all IP headers (including IPv6 extension headers)
    pub ip_hdr_len: usize,
    /// Length of the TCP (with options) or UDP header
    pub l4_hdr_len: usize,
    /// Offset of the transport payload
    pub payload_start: usize,
    /// Length of the transport payload
    pub payload_len: usize,
    /// Source address
    pub src: IpAddr,
    /// Destination address
    pub dst: IpAddr,
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// TCP sequence number of the original packet (0 for UDP)
    pub seq0: u32,
    /// TCP acknowledgment number (0 for UDP)
    pub ack: u32,
    /// TCP flags (empty for UDP)
    pub flags: TcpFlags,
    /// TCP window (0 for UDP)
    pub window: u16,
    /// IPv4 identification field (0 for IPv6)
    pub id0: u16,
    /// TTL / hop limit
    pub ttl: u8,
}

impl<'a> PacketInfo<'a> {
    /// Parse a raw IP packet.
    ///
    /// Only unfragmented TCP and UDP datagrams are accepted; everything
    /// else is an error the caller turns into "pass through".
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let layout = ip_layout(data)?;
        if layout.fragmented {
            return Err(Error::packet_parse("fragmented datagram"));
        }
        let data = &data[..layout.total_len];
        let l4 = layout.ip_hdr_len;

        let (src, dst, id0, ttl) = match layout.version {
            IpVersion::V4 => (
                IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15])),
                IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19])),
                be16(data, 4)?,
                data[8],
            ),
            IpVersion::V6 => {
                let mut s = [0u8; 16];
                let mut d = [0u8; 16];
                s.copy_from_slice(&data[8..24]);
                d.copy_from_slice(&data[24..40]);
                (
                    IpAddr::V6(Ipv6Addr::from(s)),
                    IpAddr::V6(Ipv6Addr::from(d)),
                    0,
                    data[7],
                )
            }
        };

        let protocol = Protocol::from_u8(layout.proto);
        let src_port = be16(data, l4)?;
        let dst_port = be16(data, l4 + 2)?;

        let (l4_hdr_len, seq0, ack, flags, window) = match protocol {
            Protocol::Tcp => {
                if data.len() < l4 + 20 {
                    return Err(Error::too_small(l4 + 20, data.len()));
                }
                let doff = usize::from(data[l4 + 12] >> 4) * 4;
                if doff < 20 {
                    return Err(Error::packet_parse_at(
                        format!("TCP data offset too small: {doff}"),
                        l4 + 12,
                    ));
                }
                if data.len() < l4 + doff {
                    return Err(Error::too_small(l4 + doff, data.len()));
                }
                (
                    doff,
                    be32(data, l4 + 4)?,
                    be32(data, l4 + 8)?,
                    TcpFlags::from_bits_truncate(data[l4 + 13]),
                    be16(data, l4 + 14)?,
                )
            }
            Protocol::Udp => {
                if data.len() < l4 + 8 {
                    return Err(Error::too_small(l4 + 8, data.len()));
                }
                (8, 0, 0, TcpFlags::empty(), 0)
            }
            Protocol::Other(p) => {
                return Err(Error::packet_parse(format!("unsupported protocol {p}")));
            }
        };

        let payload_start = l4 + l4_hdr_len;
        Ok(Self {
            data,
            ip_version: layout.version,
            protocol,
            ip_hdr_len: l4,
            l4_hdr_len,
            payload_start,
            payload_len: data.len() - payload_start,
            src,
            dst,
            src_port,
            dst_port,
            seq0,
            ack,
            flags,
            window,
            id0,
            ttl,
        })
    }

    /// Whole packet, trimmed to its declared length
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// IP + transport headers
    pub fn headers(&self) -> &'a [u8] {
        &self.data[..self.payload_start]
    }

    /// Transport payload
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.payload_start..]
    }

    /// Check if this is IPv6
    pub fn is_ipv6(&self) -> bool {
        self.ip_version == IpVersion::V6
    }

    /// Check if this is a TCP packet
    pub fn is_tcp(&self) -> bool {
        self.protocol == Protocol::Tcp
    }

    /// Check if this is a UDP packet
    pub fn is_udp(&self) -> bool {
        self.protocol == Protocol::Udp
    }

    /// Source socket address
    pub fn src_addr(&self) -> SocketAddr {
        SocketAddr::new(self.src, self.src_port)
    }

    /// Destination socket address
    pub fn dst_addr(&self) -> SocketAddr {
        SocketAddr::new(self.dst, self.dst_port)
    }

    /// Flow key in the packet's own direction
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.protocol, self.src_addr(), self.dst_addr())
    }
}

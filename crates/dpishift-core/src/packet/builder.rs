//! Packet builder utilities
//!
//! [`PacketBuilder`] constructs packets from scratch, [`SegmentBuilder`]
//! clones the headers of an intercepted packet and re-targets them at a new
//! payload / sequence number. Both produce packets with correct lengths and
//! checksums.

use super::checksum;
use super::{IpVersion, PacketInfo, Protocol, TcpFlags};
use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, SocketAddr};

/// TCP MD5 signature option (RFC 2385) padded to a 4-byte boundary
const MD5_OPTION_LEN: usize = 20;
/// Largest TCP header the data-offset nibble can describe
const MAX_TCP_HEADER: usize = 60;

/// Builder for constructing packets from scratch
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    protocol: Protocol,
    src: SocketAddr,
    dst: SocketAddr,
    ttl: u8,
    ip_id: u16,
    tcp_flags: TcpFlags,
    seq: u32,
    ack: u32,
    window: u16,
    payload: Vec<u8>,
}

impl PacketBuilder {
    fn new(protocol: Protocol, src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            protocol,
            src,
            dst,
            ttl: 64,
            ip_id: 0,
            tcp_flags: TcpFlags::ACK,
            seq: 0,
            ack: 0,
            window: 0xFFFF,
            payload: Vec::new(),
        }
    }

    /// Create a new TCP packet builder
    pub fn tcp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(Protocol::Tcp, src, dst)
    }

    /// Create a new UDP packet builder
    pub fn udp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(Protocol::Udp, src, dst)
    }

    /// Set TTL / hop limit
    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set IPv4 identification
    pub fn ip_id(mut self, id: u16) -> Self {
        self.ip_id = id;
        self
    }

    /// Set TCP flags
    pub fn flags(mut self, flags: TcpFlags) -> Self {
        self.tcp_flags = flags;
        self
    }

    /// Set sequence number
    pub fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    /// Set acknowledgment number
    pub fn ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    /// Set TCP window
    pub fn window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    /// Set payload
    pub fn payload(mut self, data: &[u8]) -> Self {
        self.payload = data.to_vec();
        self
    }

    /// Build the packet
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(self) -> Result<Vec<u8>> {
        let l4_len = match self.protocol {
            Protocol::Tcp => 20,
            _ => 8,
        };
        let mut packet = BytesMut::with_capacity(40 + l4_len + self.payload.len());

        let ip_hdr_len = match (self.src.ip(), self.dst.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                let total_len = 20 + l4_len + self.payload.len();
                packet.put_u8(0x45); // Version (4) + IHL (5)
                packet.put_u8(0x00); // DSCP + ECN
                packet.put_u16(total_len as u16);
                packet.put_u16(self.ip_id);
                packet.put_u16(0x4000); // DF
                packet.put_u8(self.ttl);
                packet.put_u8(self.protocol.to_u8());
                packet.put_u16(0); // Header Checksum (placeholder)
                packet.put_slice(&src.octets());
                packet.put_slice(&dst.octets());
                20
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                packet.put_u32(0x6000_0000);
                packet.put_u16((l4_len + self.payload.len()) as u16);
                packet.put_u8(self.protocol.to_u8());
                packet.put_u8(self.ttl);
                packet.put_slice(&src.octets());
                packet.put_slice(&dst.octets());
                40
            }
            _ => return Err(Error::packet_parse("address family mismatch")),
        };

        packet.put_u16(self.src.port());
        packet.put_u16(self.dst.port());
        match self.protocol {
            Protocol::Tcp => {
                packet.put_u32(self.seq);
                packet.put_u32(self.ack);
                packet.put_u8(0x50); // Data Offset (5 * 4 = 20 bytes)
                packet.put_u8(self.tcp_flags.bits());
                packet.put_u16(self.window);
                packet.put_u16(0); // Checksum (placeholder)
                packet.put_u16(0); // Urgent Pointer
            }
            _ => {
                packet.put_u16((8 + self.payload.len()) as u16);
                packet.put_u16(0);
            }
        }
        packet.put_slice(&self.payload);

        let version = if ip_hdr_len == 20 {
            IpVersion::V4
        } else {
            IpVersion::V6
        };
        let mut packet = packet.to_vec();
        checksum::fill(&mut packet, version, ip_hdr_len, self.protocol.to_u8());
        Ok(packet)
    }
}

/// Re-targets the headers of an intercepted packet at new payloads.
///
/// All setters edit the copied header bytes in place; [`SegmentBuilder::build`]
/// then fixes lengths and checksums, so one builder can stamp out many
/// segments.
#[derive(Debug, Clone)]
pub struct SegmentBuilder {
    headers: Vec<u8>,
    version: IpVersion,
    protocol: Protocol,
    ip_hdr_len: usize,
    l4_hdr_len: usize,
}

impl SegmentBuilder {
    /// Start from the headers of `info`
    pub fn from_packet(info: &PacketInfo<'_>) -> Self {
        Self {
            headers: info.headers().to_vec(),
            version: info.ip_version,
            protocol: info.protocol,
            ip_hdr_len: info.ip_hdr_len,
            l4_hdr_len: info.l4_hdr_len,
        }
    }

    fn is_tcp(&self) -> bool {
        self.protocol == Protocol::Tcp
    }

    fn tcp_field(&mut self, offset: usize, bytes: &[u8]) {
        if self.is_tcp() {
            let at = self.ip_hdr_len + offset;
            self.headers[at..at + bytes.len()].copy_from_slice(bytes);
        }
    }

    /// Set TCP sequence number
    pub fn seq(mut self, seq: u32) -> Self {
        self.tcp_field(4, &seq.to_be_bytes());
        self
    }

    /// Set TCP acknowledgment number
    pub fn ack(mut self, ack: u32) -> Self {
        self.tcp_field(8, &ack.to_be_bytes());
        self
    }

    /// Replace TCP flags
    pub fn flags(mut self, flags: TcpFlags) -> Self {
        self.tcp_field(13, &[flags.bits()]);
        self
    }

    /// Current TCP flags
    pub fn current_flags(&self) -> TcpFlags {
        if self.is_tcp() {
            TcpFlags::from_bits_truncate(self.headers[self.ip_hdr_len + 13])
        } else {
            TcpFlags::empty()
        }
    }

    /// Set or clear PSH, leaving other flags alone
    pub fn psh(self, on: bool) -> Self {
        let mut flags = self.current_flags();
        flags.set(TcpFlags::PSH, on);
        self.flags(flags)
    }

    /// Set TCP window
    pub fn window(mut self, window: u16) -> Self {
        self.tcp_field(14, &window.to_be_bytes());
        self
    }

    /// Set URG flag and urgent pointer
    pub fn urgent(mut self, pointer: u16) -> Self {
        let flags = self.current_flags() | TcpFlags::URG;
        self.tcp_field(18, &pointer.to_be_bytes());
        self.flags(flags)
    }

    /// Set TTL / hop limit
    pub fn ttl(mut self, ttl: u8) -> Self {
        match self.version {
            IpVersion::V4 => self.headers[8] = ttl,
            IpVersion::V6 => self.headers[7] = ttl,
        }
        self
    }

    /// Set IPv4 identification (no-op for IPv6)
    pub fn ip_id(mut self, id: u16) -> Self {
        if self.version == IpVersion::V4 {
            self.headers[4..6].copy_from_slice(&id.to_be_bytes());
        }
        self
    }

    /// Append a TCP MD5 signature option with a random digest.
    ///
    /// Skipped when the TCP header has no room left.
    pub fn md5_option(mut self) -> Self {
        if !self.is_tcp() || self.l4_hdr_len + MD5_OPTION_LEN > MAX_TCP_HEADER {
            return self;
        }
        let mut option = [0u8; MD5_OPTION_LEN];
        option[0] = 1; // NOP
        option[1] = 1; // NOP
        option[2] = 19; // kind: MD5 signature
        option[3] = 18; // length
        rand::Rng::fill(&mut rand::thread_rng(), &mut option[4..]);

        let end = self.ip_hdr_len + self.l4_hdr_len;
        let mut headers = Vec::with_capacity(self.headers.len() + MD5_OPTION_LEN);
        headers.extend_from_slice(&self.headers[..end]);
        headers.extend_from_slice(&option);
        headers.extend_from_slice(&self.headers[end..]);
        self.headers = headers;
        self.l4_hdr_len += MD5_OPTION_LEN;
        #[allow(clippy::cast_possible_truncation)]
        let doff = ((self.l4_hdr_len / 4) as u8) << 4;
        let at = self.ip_hdr_len + 12;
        self.headers[at] = doff | (self.headers[at] & 0x0F);
        self
    }

    /// Build a packet carrying `payload`
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(self.headers.len() + payload.len());
        packet.extend_from_slice(&self.headers);
        packet.extend_from_slice(payload);
        let total = packet.len();

        match self.version {
            IpVersion::V4 => packet[2..4].copy_from_slice(&(total as u16).to_be_bytes()),
            IpVersion::V6 => packet[4..6].copy_from_slice(&((total - 40) as u16).to_be_bytes()),
        }
        if self.protocol == Protocol::Udp {
            let at = self.ip_hdr_len + 4;
            let len = (total - self.ip_hdr_len) as u16;
            packet[at..at + 2].copy_from_slice(&len.to_be_bytes());
        }

        checksum::fill(
            &mut packet,
            self.version,
            self.ip_hdr_len,
            self.protocol.to_u8(),
        );
        packet
    }
}

/// Split a complete IPv4 packet into two IP fragments.
///
/// `offset` is measured from the start of the IP payload and must be a
/// positive multiple of 8 strictly inside it. Both fragments keep the
/// original identification; the first carries MF.
#[allow(clippy::cast_possible_truncation)]
pub fn fragment_ipv4(packet: &[u8], ip_hdr_len: usize, offset: usize) -> Option<[Vec<u8>; 2]> {
    if packet.first()? >> 4 != 4 || packet.len() <= ip_hdr_len {
        return None;
    }
    let body = &packet[ip_hdr_len..];
    if offset == 0 || offset % 8 != 0 || offset >= body.len() {
        return None;
    }
    let header = &packet[..ip_hdr_len];

    let make = |chunk: &[u8], frag_field: u16| {
        let mut frag = Vec::with_capacity(ip_hdr_len + chunk.len());
        frag.extend_from_slice(header);
        frag.extend_from_slice(chunk);
        let total = frag.len() as u16;
        frag[2..4].copy_from_slice(&total.to_be_bytes());
        frag[6..8].copy_from_slice(&frag_field.to_be_bytes());
        frag[10] = 0;
        frag[11] = 0;
        let csum = checksum::ipv4_header_checksum(&frag[..ip_hdr_len]);
        frag[10..12].copy_from_slice(&csum.to_be_bytes());
        frag
    };

    let first = make(&body[..offset], 0x2000);
    let second = make(&body[offset..], (offset / 8) as u16);
    Some([first, second])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::checksum::verify_checksums;

    fn template() -> Vec<u8> {
        PacketBuilder::tcp(
            "192.168.1.1:12345".parse().unwrap(),
            "192.168.1.2:443".parse().unwrap(),
        )
        .seq(5000)
        .flags(TcpFlags::ACK | TcpFlags::PSH)
        .payload(&[0x42; 100])
        .build()
        .unwrap()
    }

    #[test]
    fn test_build_tcp_packet() {
        let packet = PacketBuilder::tcp(
            "192.168.1.1:12345".parse().unwrap(),
            "192.168.1.2:80".parse().unwrap(),
        )
        .ttl(64)
        .flags(TcpFlags::ACK | TcpFlags::PSH)
        .payload(b"GET / HTTP/1.1\r\n")
        .build()
        .unwrap();

        assert_eq!(packet[0] >> 4, 4); // IPv4
        assert_eq!(packet[9], 6); // TCP
        assert_eq!(packet.len(), 20 + 20 + 16); // IP + TCP + payload
        assert!(verify_checksums(&packet));
    }

    #[test]
    fn test_build_family_mismatch() {
        let res = PacketBuilder::udp(
            "192.168.1.1:1".parse().unwrap(),
            "[::1]:2".parse().unwrap(),
        )
        .build();
        assert!(res.is_err());
    }

    #[test]
    fn test_segment_builder_retargets() {
        let raw = template();
        let info = PacketInfo::parse(&raw).unwrap();
        let seg = SegmentBuilder::from_packet(&info)
            .seq(info.seq0 + 10)
            .psh(false)
            .ttl(3)
            .build(&info.payload()[10..30]);

        let out = PacketInfo::parse(&seg).unwrap();
        assert_eq!(out.seq0, 5010);
        assert_eq!(out.payload_len, 20);
        assert_eq!(out.ttl, 3);
        assert!(!out.flags.contains(TcpFlags::PSH));
        assert!(out.flags.contains(TcpFlags::ACK));
        assert!(verify_checksums(&seg));
    }

    #[test]
    fn test_segment_builder_udp_length() {
        let raw = PacketBuilder::udp(
            "[2001:db8::1]:5000".parse().unwrap(),
            "[2001:db8::2]:443".parse().unwrap(),
        )
        .payload(&[9; 50])
        .build()
        .unwrap();
        let info = PacketInfo::parse(&raw).unwrap();
        let seg = SegmentBuilder::from_packet(&info).build(&[1; 7]);
        assert_eq!(u16::from_be_bytes([seg[44], seg[45]]), 15);
        assert_eq!(u16::from_be_bytes([seg[4], seg[5]]), 15);
        assert!(verify_checksums(&seg));
    }

    #[test]
    fn test_md5_option() {
        let raw = template();
        let info = PacketInfo::parse(&raw).unwrap();
        let seg = SegmentBuilder::from_packet(&info).md5_option().build(b"abc");
        let out = PacketInfo::parse(&seg).unwrap();
        assert_eq!(out.l4_hdr_len, 40);
        assert_eq!(seg[20 + 22], 19);
        assert_eq!(out.payload(), b"abc");
        assert!(verify_checksums(&seg));
    }

    #[test]
    fn test_fragment_ipv4() {
        let raw = template();
        let [a, b] = fragment_ipv4(&raw, 20, 24).unwrap();
        assert_eq!(a.len(), 20 + 24);
        assert_eq!(b.len(), raw.len() - 24);
        assert_eq!(u16::from_be_bytes([a[6], a[7]]), 0x2000);
        assert_eq!(u16::from_be_bytes([b[6], b[7]]), 3);
        assert_eq!(&a[4..6], &raw[4..6]);
        assert_eq!(crate::packet::internet_checksum(&a[..20]), 0);
        assert_eq!(crate::packet::internet_checksum(&b[..20]), 0);
    }

    #[test]
    fn test_fragment_ipv4_rejects_bad_offsets() {
        let raw = template();
        assert!(fragment_ipv4(&raw, 20, 0).is_none());
        assert!(fragment_ipv4(&raw, 20, 13).is_none());
        assert!(fragment_ipv4(&raw, 20, 120).is_none());
    }
}

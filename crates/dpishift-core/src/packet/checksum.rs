//! Internet checksum helpers (RFC 1071)
//!
//! Every packet the engine emits goes through [`fill`] (or
//! [`fix_checksums`]) exactly once, after all header edits.

use super::{ip_layout, IpVersion};
use crate::error::Result;

/// Calculate Internet Checksum (RFC 1071)
pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

fn sum_words(data: &[u8], mut sum: u64) -> u64 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u64::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    // Handle odd byte
    if let [last] = chunks.remainder() {
        sum += u64::from(*last) << 8;
    }
    sum
}

#[allow(clippy::cast_possible_truncation)]
fn fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Calculate IPv4 header checksum, ignoring whatever is in the checksum field
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    if header.len() < 20 {
        return internet_checksum(header);
    }
    fold(sum_words(&header[12..], sum_words(&header[..10], 0)))
}

/// Rewrite the IPv4 header checksum of `pkt` in place
pub(crate) fn refresh_ipv4_header(pkt: &mut [u8], ip_hdr_len: usize) {
    let csum = ipv4_header_checksum(&pkt[..ip_hdr_len]);
    pkt[10..12].copy_from_slice(&csum.to_be_bytes());
}

fn pseudo_header_sum(src: &[u8], dst: &[u8], proto: u8, len: usize) -> u64 {
    let len = len as u64;
    let sum = sum_words(dst, sum_words(src, 0));
    sum + u64::from(proto) + (len >> 16) + (len & 0xFFFF)
}

/// TCP/UDP checksum over a pseudo-header and the transport segment.
///
/// `src`/`dst` are 4 bytes for IPv4 and 16 bytes for IPv6. The checksum
/// field inside `segment` must already be zero.
pub fn transport_checksum(src: &[u8], dst: &[u8], proto: u8, segment: &[u8]) -> u16 {
    fold(sum_words(
        segment,
        pseudo_header_sum(src, dst, proto, segment.len()),
    ))
}

fn addresses(pkt: &[u8], version: IpVersion) -> (&[u8], &[u8]) {
    match version {
        IpVersion::V4 => (&pkt[12..16], &pkt[16..20]),
        IpVersion::V6 => (&pkt[8..24], &pkt[24..40]),
    }
}

fn l4_checksum_field(proto: u8) -> Option<usize> {
    match proto {
        6 => Some(16),
        17 => Some(6),
        _ => None,
    }
}

/// Recompute IPv4 header and TCP/UDP checksums of a packet whose layout is
/// already known. `l4_offset` is the total IP header length.
pub(crate) fn fill(pkt: &mut [u8], version: IpVersion, l4_offset: usize, proto: u8) {
    if version == IpVersion::V4 {
        refresh_ipv4_header(pkt, l4_offset);
    }

    let Some(field) = l4_checksum_field(proto) else {
        return;
    };
    if pkt.len() < l4_offset + field + 2 {
        return;
    }
    pkt[l4_offset + field] = 0;
    pkt[l4_offset + field + 1] = 0;

    let (src, dst) = addresses(pkt, version);
    let mut csum = transport_checksum(src, dst, proto, &pkt[l4_offset..]);
    // Zero means "no checksum" for UDP
    if proto == 17 && csum == 0 {
        csum = 0xFFFF;
    }
    pkt[l4_offset + field..l4_offset + field + 2].copy_from_slice(&csum.to_be_bytes());
}

/// Recompute all checksums of a complete IPv4/IPv6 packet.
///
/// Non-first IPv4 fragments only get their header checksum fixed.
pub fn fix_checksums(pkt: &mut [u8]) -> Result<()> {
    let layout = ip_layout(pkt)?;
    if layout.fragmented {
        if layout.version == IpVersion::V4 {
            refresh_ipv4_header(pkt, layout.ip_hdr_len);
        }
        return Ok(());
    }
    fill(
        &mut pkt[..layout.total_len],
        layout.version,
        layout.ip_hdr_len,
        layout.proto,
    );
    Ok(())
}

/// Damage the TCP/UDP checksum so the receiving stack discards the packet.
///
/// Must be called after [`fix_checksums`]. The result never collides with
/// the valid value under one's-complement equivalence (0x0000 == 0xFFFF).
pub fn corrupt_l4_checksum(pkt: &mut [u8]) -> Result<()> {
    let layout = ip_layout(pkt)?;
    let Some(field) = l4_checksum_field(layout.proto) else {
        return Ok(());
    };
    let at = layout.ip_hdr_len + field;
    if pkt.len() < at + 2 {
        return Ok(());
    }
    let current = u16::from_be_bytes([pkt[at], pkt[at + 1]]);
    let bad = match current {
        0xFFFF | 0x0000 => 0x0001,
        other => other.wrapping_add(1),
    };
    pkt[at..at + 2].copy_from_slice(&bad.to_be_bytes());
    Ok(())
}

/// Check the IPv4 header checksum and the TCP/UDP checksum of a packet
pub fn verify_checksums(pkt: &[u8]) -> bool {
    let Ok(layout) = ip_layout(pkt) else {
        return false;
    };
    if layout.version == IpVersion::V4 && internet_checksum(&pkt[..layout.ip_hdr_len]) != 0 {
        return false;
    }
    if layout.fragmented || l4_checksum_field(layout.proto).is_none() {
        return true;
    }
    let (src, dst) = addresses(pkt, layout.version);
    let segment = &pkt[layout.ip_hdr_len..layout.total_len];
    fold(sum_words(
        segment,
        pseudo_header_sum(src, dst, layout.proto, segment.len()),
    )) == 0
}

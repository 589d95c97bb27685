//! Two-piece splits: TCP segment, IP fragment, TLS record, OOB byte,
//! first byte and pre-SNI-extension

use super::common::{emit_in_order, fake_segment, split_segments};
use super::{Emission, SplitInput};
use crate::packet::{fix_checksums, fragment_ipv4, SegmentBuilder, TcpFlags};
use crate::sni::tls::{CONTENT_HANDSHAKE, RECORD_HEADER_LEN};
use std::time::Duration;

fn split_point(input: &SplitInput<'_, '_>) -> usize {
    let frag = &input.set.fragmentation;
    if frag.middle_sni {
        if let Some(mid) = input.hello.and_then(|h| h.sni_mid()) {
            return mid;
        }
    }
    frag.sni_position
}

fn two_way(input: &SplitInput<'_, '_>, pos: usize, delay: Duration) -> Option<Vec<Emission>> {
    let segments = split_segments(input.info, &[pos])?;
    let order: &[usize] = if input.set.fragmentation.reverse_order {
        &[1, 0]
    } else {
        &[0, 1]
    };
    Some(emit_in_order(segments, order, |_| delay))
}

/// Split at `sni_position` (or the SNI midpoint)
pub(crate) fn tcp(input: &SplitInput<'_, '_>) -> Option<Vec<Emission>> {
    let delay = Duration::from_millis(input.set.tcp.seg2_delay_ms);
    two_way(input, split_point(input), delay)
}

/// IPv4 fragmentation. The cut is rounded up to the 8-byte fragment unit
/// past the TCP header; IPv6 falls back to a TCP split.
pub(crate) fn ip(input: &SplitInput<'_, '_>) -> Option<Vec<Emission>> {
    let info = input.info;
    if info.is_ipv6() {
        return tcp(input);
    }
    let pos = split_point(input);
    if pos == 0 || pos >= info.payload_len {
        return None;
    }
    let offset = (info.l4_hdr_len + pos).div_ceil(8) * 8;
    // The transport checksum travels inside the first fragment
    let mut whole = info.bytes().to_vec();
    fix_checksums(&mut whole).ok()?;
    let [first, second] = fragment_ipv4(&whole, info.ip_hdr_len, offset)?;
    let delay = Duration::from_millis(input.set.tcp.seg2_delay_ms);
    let (a, b) = if input.set.fragmentation.reverse_order {
        (second, first)
    } else {
        (first, second)
    };
    Some(vec![Emission::real(a), Emission::real(b).after(delay)])
}

/// Re-frame the leading handshake record as two records, split
/// `tls_record_position` bytes into its body, one record per segment.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn tls_record(input: &SplitInput<'_, '_>) -> Option<Vec<Emission>> {
    let info = input.info;
    let payload = info.payload();
    if payload.len() <= RECORD_HEADER_LEN || payload[0] != CONTENT_HANDSHAKE {
        return None;
    }
    let body_len = usize::from(u16::from_be_bytes([payload[3], payload[4]]))
        .min(payload.len() - RECORD_HEADER_LEN);
    let pos = input.set.fragmentation.tls_record_position;
    if pos == 0 || pos >= body_len {
        return None;
    }
    let body = &payload[RECORD_HEADER_LEN..RECORD_HEADER_LEN + body_len];
    let trailing = &payload[RECORD_HEADER_LEN + body_len..];

    let record = |chunk: &[u8]| {
        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + chunk.len());
        out.extend_from_slice(&payload[..3]);
        out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        out.extend_from_slice(chunk);
        out
    };
    let first = record(&body[..pos]);
    let mut second = record(&body[pos..]);
    second.extend_from_slice(trailing);

    let psh = info.flags.contains(TcpFlags::PSH);
    let builder = SegmentBuilder::from_packet(info);
    let seg1 = builder.clone().seq(info.seq0).psh(false).build(&first);
    let seg2 = builder
        .seq(info.seq0.wrapping_add(first.len() as u32))
        .psh(psh)
        .build(&second);

    let delay = Duration::from_millis(input.set.tcp.seg2_delay_ms);
    Some(if input.set.fragmentation.reverse_order {
        vec![Emission::real(seg2), Emission::real(seg1).after(delay)]
    } else {
        vec![Emission::real(seg1), Emission::real(seg2).after(delay)]
    })
}

/// Clean segment, one low-TTL urgent byte, clean remainder.
///
/// The fake byte and the remainder share a sequence number: the fake dies
/// before the server, which only ever sees the real data.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn oob(input: &SplitInput<'_, '_>) -> Option<Vec<Emission>> {
    let info = input.info;
    let frag = &input.set.fragmentation;
    let pos = frag.oob_position;
    let mut segments = split_segments(info, &[pos])?.into_iter();
    let (seg1, seg2) = (segments.next()?, segments.next()?);

    let mut byte = [0u8; 4];
    let oob_byte = frag.oob_char.encode_utf8(&mut byte).as_bytes()[0];
    let fake = SegmentBuilder::from_packet(info)
        .seq(seg2.seq)
        .ttl(input.set.faking.ttl)
        .psh(false)
        .urgent(1)
        .build(&[oob_byte]);

    Some(vec![
        Emission::from(seg1),
        Emission::fake(fake),
        Emission::from(seg2),
    ])
}

/// One byte, a pause, the rest
pub(crate) fn first_byte(input: &SplitInput<'_, '_>) -> Option<Vec<Emission>> {
    let segments = split_segments(input.info, &[1])?;
    let delay = Duration::from_millis(input.set.fragmentation.combo.first_delay_ms);
    Some(emit_in_order(segments, &[0, 1], |_| delay))
}

/// Split right before the SNI extension header; falls back to `tcp`
pub(crate) fn ext_split(input: &SplitInput<'_, '_>) -> Option<Vec<Emission>> {
    match input.pre_ext() {
        Some(pos) => two_way(input, pos, Duration::from_millis(input.set.tcp.seg2_delay_ms)),
        None => tcp(input),
    }
}

/// Decoy ClientHello for `host` at the start of the stream
pub(crate) fn decoy_hello(input: &SplitInput<'_, '_>, host: &str) -> Emission {
    let hello = crate::sni::ClientHelloBuilder::new(host).build();
    Emission::fake(fake_segment(
        input.info,
        input.info.seq0,
        input.set.faking.ttl,
        &hello,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleSet;
    use crate::packet::{verify_checksums, PacketBuilder, PacketInfo};
    use crate::sni::{extract_sni, parse_client_hello, ClientHelloBuilder};

    fn packet(payload: &[u8]) -> Vec<u8> {
        PacketBuilder::tcp(
            "10.0.0.1:40000".parse().unwrap(),
            "1.2.3.4:443".parse().unwrap(),
        )
        .seq(5000)
        .ip_id(0x1234)
        .flags(TcpFlags::ACK | TcpFlags::PSH)
        .payload(payload)
        .build()
        .unwrap()
    }

    fn run(
        f: fn(&SplitInput<'_, '_>) -> Option<Vec<Emission>>,
        raw: &[u8],
        set: &RuleSet,
    ) -> Option<Vec<Emission>> {
        let info = PacketInfo::parse(raw).unwrap();
        let hello = parse_client_hello(info.payload());
        f(&SplitInput {
            info: &info,
            set,
            hello: hello.as_ref(),
        })
    }

    // =========== TCP Split Tests ===========

    #[test]
    fn test_tcp_position_one() {
        let raw = packet(&[0xAB; 200]);
        let set = RuleSet::for_domains("t", &[]);
        let out = run(tcp, &raw, &set).unwrap();
        assert_eq!(out.len(), 2);

        let a = PacketInfo::parse(&out[0].packet).unwrap();
        let b = PacketInfo::parse(&out[1].packet).unwrap();
        assert_eq!((a.seq0, a.payload_len), (5000, 1));
        assert_eq!((b.seq0, b.payload_len), (5001, 199));
        assert!(out.iter().all(|e| verify_checksums(&e.packet)));
    }

    #[test]
    fn test_tcp_reverse_and_delay() {
        let raw = packet(&[0xAB; 50]);
        let mut set = RuleSet::for_domains("t", &[]);
        set.fragmentation.sni_position = 10;
        set.fragmentation.reverse_order = true;
        set.tcp.seg2_delay_ms = 7;
        let out = run(tcp, &raw, &set).unwrap();

        let first = PacketInfo::parse(&out[0].packet).unwrap();
        assert_eq!(first.seq0, 5010);
        assert!(first.flags.contains(TcpFlags::PSH));
        assert_eq!(out[1].delay, Duration::from_millis(7));
    }

    #[test]
    fn test_tcp_middle_sni() {
        let hello = ClientHelloBuilder::new("example.com").build();
        let raw = packet(&hello);
        let mut set = RuleSet::for_domains("t", &[]);
        set.fragmentation.middle_sni = true;
        let out = run(tcp, &raw, &set).unwrap();

        let mid = parse_client_hello(&hello).unwrap().sni_mid().unwrap();
        let a = PacketInfo::parse(&out[0].packet).unwrap();
        assert_eq!(a.payload_len, mid);
        assert!(extract_sni(a.payload()).is_none());
    }

    #[test]
    fn test_tcp_position_out_of_range() {
        let raw = packet(&[1; 10]);
        let mut set = RuleSet::for_domains("t", &[]);
        set.fragmentation.sni_position = 10;
        assert!(run(tcp, &raw, &set).is_none());
        set.fragmentation.sni_position = 0;
        assert!(run(tcp, &raw, &set).is_none());
    }

    // =========== IP Fragment Tests ===========

    #[test]
    fn test_ip_fragments() {
        let raw = packet(&[0xCD; 100]);
        let set = RuleSet::for_domains("t", &[]);
        let out = run(ip, &raw, &set).unwrap();
        assert_eq!(out.len(), 2);

        let first = &out[0].packet;
        let second = &out[1].packet;
        assert_eq!(u16::from_be_bytes([first[6], first[7]]), 0x2000);
        // 20 byte TCP header + 1 rounded up to 24
        assert_eq!(u16::from_be_bytes([second[6], second[7]]), 3);
        assert_eq!(first[4..6], [0x12, 0x34]);
        assert_eq!(second[4..6], [0x12, 0x34]);
        assert_eq!(first.len() - 20 + second.len() - 20, raw.len() - 20);
        assert!(verify_checksums(first));
    }

    #[test]
    fn test_ip_on_ipv6_degrades_to_tcp() {
        let raw = PacketBuilder::tcp("[::1]:40000".parse().unwrap(), "[::2]:443".parse().unwrap())
            .seq(1)
            .payload(&[1; 40])
            .build()
            .unwrap();
        let set = RuleSet::for_domains("t", &[]);
        let out = run(ip, &raw, &set).unwrap();
        assert_eq!(PacketInfo::parse(&out[1].packet).unwrap().seq0, 2);
    }

    // =========== TLS Record Tests ===========

    #[test]
    fn test_tls_record_split() {
        let hello = ClientHelloBuilder::new("example.com").build();
        let raw = packet(&hello);
        let mut set = RuleSet::for_domains("t", &[]);
        set.fragmentation.tls_record_position = 2;
        let out = run(tls_record, &raw, &set).unwrap();

        let a = PacketInfo::parse(&out[0].packet).unwrap();
        let b = PacketInfo::parse(&out[1].packet).unwrap();
        assert_eq!(a.payload(), &[0x16, 0x03, 0x01, 0x00, 0x02, hello[5], hello[6]]);
        assert_eq!(b.seq0, 5000 + 7);
        assert_eq!(a.payload_len + b.payload_len, hello.len() + RECORD_HEADER_LEN);
        let declared = usize::from(u16::from_be_bytes([b.payload()[3], b.payload()[4]]));
        assert_eq!(declared, hello.len() - RECORD_HEADER_LEN - 2);
    }

    #[test]
    fn test_tls_record_requires_record() {
        let raw = packet(b"GET / HTTP/1.1\r\n");
        let set = RuleSet::for_domains("t", &[]);
        assert!(run(tls_record, &raw, &set).is_none());
    }

    // =========== OOB Tests ===========

    #[test]
    fn test_oob() {
        let raw = packet(&[0x11; 30]);
        let mut set = RuleSet::for_domains("t", &[]);
        set.fragmentation.oob_position = 4;
        set.fragmentation.oob_char = 'z';
        let out = run(oob, &raw, &set).unwrap();
        assert_eq!(out.len(), 3);

        let fake = PacketInfo::parse(&out[1].packet).unwrap();
        assert!(!out[1].is_real());
        assert_eq!(fake.payload(), b"z");
        assert!(fake.flags.contains(TcpFlags::URG));
        assert_eq!(fake.ttl, set.faking.ttl);
        let tail = PacketInfo::parse(&out[2].packet).unwrap();
        assert_eq!(fake.seq0, tail.seq0);
        assert_eq!(tail.payload_len, 26);
    }

    // =========== First Byte / ExtSplit Tests ===========

    #[test]
    fn test_first_byte_delay() {
        let raw = packet(&[3; 20]);
        let set = RuleSet::for_domains("t", &[]);
        let out = run(first_byte, &raw, &set).unwrap();
        assert_eq!(PacketInfo::parse(&out[0].packet).unwrap().payload_len, 1);
        assert_eq!(
            out[1].delay,
            Duration::from_millis(set.fragmentation.combo.first_delay_ms)
        );
    }

    #[test]
    fn test_ext_split_at_sni_extension() {
        let hello = ClientHelloBuilder::new("example.com").build();
        let raw = packet(&hello);
        let set = RuleSet::for_domains("t", &[]);
        let out = run(ext_split, &raw, &set).unwrap();

        let ext = parse_client_hello(&hello).unwrap().sni_ext.unwrap();
        let b = PacketInfo::parse(&out[1].packet).unwrap();
        assert_eq!(b.payload()[..2], [0x00, 0x00]);
        assert_eq!(b.seq0, 5000 + u32::try_from(ext).unwrap());
    }

    #[test]
    fn test_ext_split_falls_back_to_tcp() {
        let raw = packet(&[9; 40]);
        let set = RuleSet::for_domains("t", &[]);
        let out = run(ext_split, &raw, &set).unwrap();
        assert_eq!(PacketInfo::parse(&out[0].packet).unwrap().payload_len, 1);
    }
}

//! UDP handling for QUIC, STUN and port-matched datagrams

use super::common::random_bytes;
use super::{Emission, Plan};
use crate::config::{RuleSet, UdpFaking, UdpMode};
use crate::packet::{PacketInfo, SegmentBuilder};
use crate::sni::quic::{self, QuicVersion};
use crate::sni::ClientHelloBuilder;

/// Connection ID length of decoy Initials
const DECOY_CID_LEN: usize = 8;

/// What to do with a matched datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpAction {
    /// Discard it; QUIC clients fall back to TCP
    Drop,
    /// Drop the original and send this plan instead
    Inject(Plan),
}

/// Decoy payload: a sealed Initial for `decoy_sni` when the original is a
/// QUIC Initial, random bytes otherwise
fn decoy_payload(info: &PacketInfo<'_>, set: &RuleSet, max_len: usize) -> Vec<u8> {
    let payload = info.payload();
    let min_len = set.udp.fake_len.max(1);
    if quic::is_initial(payload) {
        let version = payload
            .get(1..5)
            .and_then(|v| QuicVersion::from_u32(u32::from_be_bytes([v[0], v[1], v[2], v[3]])))
            .unwrap_or(QuicVersion::V1);
        let hello = ClientHelloBuilder::new(&set.faking.decoy_sni).build();
        let decoy = quic::seal_initial(
            &random_bytes(DECOY_CID_LEN),
            &random_bytes(DECOY_CID_LEN),
            version,
            0,
            &hello[5..],
            min_len,
        );
        if let Some(decoy) = decoy.filter(|d| d.len() <= max_len) {
            return decoy;
        }
    }
    random_bytes(min_len.min(max_len))
}

/// Decide on a datagram matched by `set`
pub fn udp_action(info: &PacketInfo<'_>, set: &RuleSet, mtu: usize) -> UdpAction {
    let opts = &set.udp;
    if opts.mode == UdpMode::Drop {
        return UdpAction::Drop;
    }

    let max_len = mtu.saturating_sub(info.payload_start);
    let mut plan = Plan::new(info.dst);
    let base = SegmentBuilder::from_packet(info);
    for _ in 0..opts.fake_count {
        let payload = decoy_payload(info, set, max_len);
        let emission = match opts.faking {
            UdpFaking::None => Emission::fake(base.build(&payload)),
            UdpFaking::Ttl => Emission::fake(base.clone().ttl(set.faking.ttl).build(&payload)),
            UdpFaking::Checksum => Emission::corrupted(base.build(&payload)),
        };
        plan.push(emission);
    }
    plan.push(Emission::resend(info.bytes()));
    plan.stamp_ids(info.id0);
    UdpAction::Inject(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{verify_checksums, PacketBuilder};

    fn quic_packet() -> Vec<u8> {
        let hello = ClientHelloBuilder::new("video.example").build();
        let initial =
            quic::seal_initial(&[1; 8], &[], QuicVersion::V1, 0, &hello[5..], quic::MIN_INITIAL_SIZE)
                .unwrap();
        PacketBuilder::udp(
            "10.0.0.1:50000".parse().unwrap(),
            "1.2.3.4:443".parse().unwrap(),
        )
        .payload(&initial)
        .build()
        .unwrap()
    }

    #[test]
    fn test_drop_mode() {
        let raw = quic_packet();
        let info = PacketInfo::parse(&raw).unwrap();
        let mut set = RuleSet::for_domains("q", &[]);
        set.udp.mode = UdpMode::Drop;
        assert_eq!(udp_action(&info, &set, 1500), UdpAction::Drop);
    }

    #[test]
    fn test_quic_decoys_then_original() {
        let raw = quic_packet();
        let info = PacketInfo::parse(&raw).unwrap();
        let mut set = RuleSet::for_domains("q", &[]);
        set.udp.fake_count = 2;
        set.udp.faking = UdpFaking::Ttl;
        let UdpAction::Inject(plan) = udp_action(&info, &set, 1500) else {
            panic!("expected injection");
        };

        assert_eq!(plan.len(), 3);
        assert_eq!(plan.emissions[2].packet[20..], raw[20..]);
        let ids: Vec<u16> = plan
            .emissions
            .iter()
            .map(|e| PacketInfo::parse(&e.packet).unwrap().id0)
            .collect();
        assert_eq!(ids, vec![info.id0, info.id0 + 1, info.id0 + 2]);
        let fake = PacketInfo::parse(&plan.emissions[0].packet).unwrap();
        assert_eq!(fake.ttl, set.faking.ttl);
        assert_eq!(
            quic::extract_sni(fake.payload()).as_deref(),
            Some(set.faking.decoy_sni.as_str())
        );
        assert!(verify_checksums(&plan.emissions[0].packet));
    }

    #[test]
    fn test_non_quic_random_fakes_corrupted() {
        let raw = PacketBuilder::udp(
            "10.0.0.1:50000".parse().unwrap(),
            "1.2.3.4:3478".parse().unwrap(),
        )
        .payload(&[0; 40])
        .build()
        .unwrap();
        let info = PacketInfo::parse(&raw).unwrap();
        let mut set = RuleSet::for_domains("s", &[]);
        set.udp.fake_count = 1;
        set.udp.faking = UdpFaking::Checksum;
        let UdpAction::Inject(plan) = udp_action(&info, &set, 1500) else {
            panic!("expected injection");
        };
        let fake = PacketInfo::parse(&plan.emissions[0].packet).unwrap();
        assert_eq!(fake.payload_len, set.udp.fake_len);
        assert!(plan.emissions[0].corrupted);
    }

    #[test]
    fn test_original_resent_with_valid_checksum() {
        let mut raw = quic_packet();
        // Partial checksum as handed over with offload enabled
        raw[26] ^= 0x5a;
        assert!(!verify_checksums(&raw));
        let info = PacketInfo::parse(&raw).unwrap();
        let set = RuleSet::for_domains("q", &[]);
        let UdpAction::Inject(plan) = udp_action(&info, &set, 1500) else {
            panic!("expected injection");
        };
        assert!(plan.emissions.last().is_some_and(|e| e.is_real() && verify_checksums(&e.packet)));
    }
}

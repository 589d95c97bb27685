//! Fake SYN ahead of the real handshake

use super::{Emission, Plan};
use crate::config::{FakingStrategy, RuleSet};
use crate::packet::{PacketInfo, SegmentBuilder};
use crate::sni::ClientHelloBuilder;
use tracing::debug;

/// Plan for an outbound SYN: a corrupted low-TTL fake SYN carrying a
/// bogus ClientHello, then the real SYN.
///
/// Anything that is not a bare SYN, or a set without `syn_fake`, is sent
/// unchanged.
pub fn syn_plan(info: &PacketInfo<'_>, set: &RuleSet, mtu: usize) -> Plan {
    let dst = info.dst;
    if !info.is_tcp() || !info.flags.is_syn_only() || !set.tcp.syn_fake {
        return Plan::passthrough(info.bytes(), dst);
    }

    let mut payload = ClientHelloBuilder::new(&set.faking.decoy_sni).build();
    if set.tcp.syn_fake_len > 0 {
        payload.resize(set.tcp.syn_fake_len, 0);
    }
    payload.truncate(mtu.saturating_sub(info.payload_start + 20));

    let mut builder = SegmentBuilder::from_packet(info).ttl(set.tcp.syn_ttl);
    if set.faking.strategy == FakingStrategy::Md5Sum {
        builder = builder.md5_option();
    }

    debug!(set = %set.id, %dst, "fake SYN");
    let mut plan = Plan::new(dst);
    plan.push(Emission::corrupted(builder.build(&payload)));
    plan.push(Emission::resend(info.bytes()));
    plan.stamp_ids(info.id0);
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{verify_checksums, PacketBuilder, TcpFlags};

    fn syn() -> Vec<u8> {
        PacketBuilder::tcp(
            "10.0.0.1:40000".parse().unwrap(),
            "1.2.3.4:443".parse().unwrap(),
        )
        .seq(42)
        .flags(TcpFlags::SYN)
        .build()
        .unwrap()
    }

    #[test]
    fn test_syn_fake() {
        let raw = syn();
        let info = PacketInfo::parse(&raw).unwrap();
        let mut set = RuleSet::for_domains("s", &[]);
        set.tcp.syn_fake = true;
        set.tcp.syn_fake_len = 100;
        let plan = syn_plan(&info, &set, 1500);

        assert_eq!(plan.len(), 2);
        let fake = PacketInfo::parse(&plan.emissions[0].packet).unwrap();
        assert_eq!(fake.flags, TcpFlags::SYN);
        assert_eq!(fake.ttl, 3);
        assert_eq!(fake.payload_len, 100);
        assert!(!verify_checksums(&plan.emissions[0].packet));

        // The real SYN follows the fake in IP id order
        let mut expected = raw.clone();
        crate::packet::set_ipv4_id(&mut expected, info.id0.wrapping_add(1)).unwrap();
        assert_eq!(plan.emissions[1].packet, expected);
    }

    #[test]
    fn test_real_syn_checksum_completed() {
        let mut raw = syn();
        // Checksum left to the NIC
        raw[36] = 0;
        raw[37] = 0;
        assert!(!verify_checksums(&raw));
        let info = PacketInfo::parse(&raw).unwrap();
        let mut set = RuleSet::for_domains("s", &[]);
        set.tcp.syn_fake = true;
        let plan = syn_plan(&info, &set, 1500);
        assert!(verify_checksums(&plan.emissions[1].packet));
    }

    #[test]
    fn test_syn_fake_md5() {
        let raw = syn();
        let info = PacketInfo::parse(&raw).unwrap();
        let mut set = RuleSet::for_domains("s", &[]);
        set.tcp.syn_fake = true;
        set.faking.strategy = FakingStrategy::Md5Sum;
        let plan = syn_plan(&info, &set, 1500);
        assert_eq!(
            PacketInfo::parse(&plan.emissions[0].packet).unwrap().l4_hdr_len,
            40
        );
    }

    #[test]
    fn test_disabled_passes_through() {
        let raw = syn();
        let info = PacketInfo::parse(&raw).unwrap();
        let set = RuleSet::for_domains("s", &[]);
        assert!(syn_plan(&info, &set, 1500).is_passthrough(&raw));
    }
}

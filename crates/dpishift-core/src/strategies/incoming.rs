//! Reactions to inbound volume on rewritten flows

use super::common::random_bytes;
use super::{Emission, Plan};
use crate::conntrack::IncomingAction;
use crate::packet::{PacketBuilder, PacketInfo, TcpFlags};

/// Payload size of incoming fakes
const FAKE_LEN: usize = 64;

/// Fakes toward the server in response to an inbound packet.
///
/// `info` is the server-to-client packet; the forged packets travel
/// client-to-server at the sequence the client would use next. The
/// inbound packet itself is left to the kernel.
#[allow(clippy::cast_possible_truncation)]
pub fn incoming_plan(info: &PacketInfo<'_>, action: &IncomingAction) -> Option<Plan> {
    if !info.is_tcp() {
        return None;
    }
    let seq = info.ack;
    let ack = info.seq0.wrapping_add(info.payload_len as u32);
    let forge = |flags: TcpFlags, ttl: u8, payload: &[u8]| {
        PacketBuilder::tcp(info.dst_addr(), info.src_addr())
            .ttl(ttl)
            .flags(flags)
            .seq(seq)
            .ack(ack)
            .payload(payload)
            .build()
            .ok()
    };

    let mut plan = Plan::new(info.src);
    match action {
        IncomingAction::Fake(set) => {
            let opts = &set.tcp.incoming;
            for _ in 0..opts.fake_count {
                let packet = forge(
                    TcpFlags::ACK | TcpFlags::PSH,
                    opts.fake_ttl,
                    &random_bytes(FAKE_LEN),
                )?;
                plan.push(Emission::corrupted(packet));
            }
        }
        IncomingAction::Reset(set) => {
            let packet = forge(TcpFlags::RST | TcpFlags::ACK, set.tcp.incoming.fake_ttl, &[])?;
            plan.push(Emission::fake(packet));
        }
    }
    plan.stamp_ids(rand::random());
    Some(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IncomingMode, RuleSet};
    use crate::packet::verify_checksums;
    use std::sync::Arc;

    fn inbound() -> Vec<u8> {
        PacketBuilder::tcp(
            "1.2.3.4:443".parse().unwrap(),
            "10.0.0.1:40000".parse().unwrap(),
        )
        .seq(7000)
        .ack(3000)
        .payload(&[0; 1000])
        .build()
        .unwrap()
    }

    fn set(mode: IncomingMode) -> Arc<RuleSet> {
        let mut set = RuleSet::for_domains("i", &[]);
        set.tcp.incoming.mode = mode;
        set.tcp.incoming.fake_count = 2;
        Arc::new(set)
    }

    #[test]
    fn test_fake_toward_server() {
        let raw = inbound();
        let info = PacketInfo::parse(&raw).unwrap();
        let plan = incoming_plan(&info, &IncomingAction::Fake(set(IncomingMode::Fake))).unwrap();

        assert_eq!(plan.dst, info.src);
        assert_eq!(plan.len(), 2);
        for e in &plan.emissions {
            let p = PacketInfo::parse(&e.packet).unwrap();
            assert_eq!(p.dst_port, 443);
            assert_eq!((p.seq0, p.ack), (3000, 8000));
            assert_eq!(p.ttl, 3);
            assert!(!verify_checksums(&e.packet));
        }
    }

    #[test]
    fn test_reset() {
        let raw = inbound();
        let info = PacketInfo::parse(&raw).unwrap();
        let plan = incoming_plan(&info, &IncomingAction::Reset(set(IncomingMode::Reset))).unwrap();
        assert_eq!(plan.len(), 1);
        let p = PacketInfo::parse(&plan.emissions[0].packet).unwrap();
        assert!(p.flags.contains(TcpFlags::RST));
        assert!(verify_checksums(&plan.emissions[0].packet));
    }
}

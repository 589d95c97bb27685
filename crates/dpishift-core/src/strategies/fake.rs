//! Fake ClientHellos sent ahead of the real data

use super::common::random_bytes;
use super::Emission;
use crate::config::{FakePayload, FakingStrategy, RuleSet};
use crate::packet::{PacketInfo, SegmentBuilder};
use crate::sni::ClientHelloBuilder;
use rand::Rng;
use tracing::warn;

/// Room reserved for an MD5 signature option
const MD5_OPTION_ROOM: usize = 20;

/// Payload carried by fakes, per `faking.payload`
pub(crate) fn fake_payload(set: &RuleSet) -> Vec<u8> {
    let faking = &set.faking;
    match faking.payload {
        FakePayload::Default => ClientHelloBuilder::new(&faking.decoy_sni).build(),
        FakePayload::Random => random_bytes(faking.payload_len.max(1)),
        FakePayload::Custom => match set.custom_payload() {
            Ok(Some(bytes)) if !bytes.is_empty() => bytes,
            Ok(_) => ClientHelloBuilder::new(&faking.decoy_sni).build(),
            Err(e) => {
                warn!(set = %set.id, error = %e, "bad custom fake payload");
                ClientHelloBuilder::new(&faking.decoy_sni).build()
            }
        },
    }
}

/// `faking.count` fakes kept from the server by `faking.strategy`
pub(crate) fn fake_hellos(info: &PacketInfo<'_>, set: &RuleSet, mtu: usize) -> Vec<Emission> {
    let faking = &set.faking;
    if !faking.sni || faking.count == 0 {
        return Vec::new();
    }
    let mut payload = fake_payload(set);
    payload.truncate(mtu.saturating_sub(info.payload_start + MD5_OPTION_ROOM));
    if payload.is_empty() {
        return Vec::new();
    }

    let base = SegmentBuilder::from_packet(info).psh(false);
    (0..faking.count)
        .map(|_| match faking.strategy {
            FakingStrategy::Ttl => {
                Emission::fake(base.clone().seq(info.seq0).ttl(faking.ttl).build(&payload))
            }
            FakingStrategy::PastSeq => Emission::fake(
                base.clone()
                    .seq(info.seq0.wrapping_sub(faking.seq_offset))
                    .build(&payload),
            ),
            FakingStrategy::RandSeq => {
                let seq = rand::thread_rng().gen::<u32>();
                Emission::fake(base.clone().seq(seq).build(&payload))
            }
            FakingStrategy::TcpCheck => {
                Emission::corrupted(base.clone().seq(info.seq0).build(&payload))
            }
            FakingStrategy::Md5Sum => {
                Emission::fake(base.clone().seq(info.seq0).md5_option().build(&payload))
            }
        })
        .collect()
}

//! Forged control packets: RST/FIN/ACK desync bursts, window games and
//! duplicate ACKs

use super::Emission;
use crate::config::{DesyncMode, RuleSet, WindowMode};
use crate::packet::{PacketInfo, SegmentBuilder, TcpFlags};
use rand::Rng;

/// Sequence spread between packets of a `full` burst
const FULL_SEQ_SPREAD: u32 = 1460;

/// `desync.count` forged packets per kind, TTL-limited and
/// checksum-corrupted
pub(crate) fn desync(info: &PacketInfo<'_>, set: &RuleSet) -> Vec<Emission> {
    let opts = &set.tcp.desync;
    let fin = TcpFlags::FIN | TcpFlags::ACK;
    let kinds = match opts.mode {
        DesyncMode::Off => return Vec::new(),
        DesyncMode::Rst => vec![TcpFlags::RST],
        DesyncMode::Fin => vec![fin],
        DesyncMode::Ack => vec![TcpFlags::ACK],
        DesyncMode::Combo | DesyncMode::Full => vec![TcpFlags::RST, fin, TcpFlags::ACK],
    };
    let full = opts.mode == DesyncMode::Full;
    let mut rng = rand::thread_rng();
    let base = SegmentBuilder::from_packet(info).ttl(opts.ttl);

    let mut out = Vec::with_capacity(kinds.len() * usize::from(opts.count));
    for flags in kinds {
        for i in 0..u32::from(opts.count) {
            let (seq, ack) = if full {
                let spread = (i + 1) * FULL_SEQ_SPREAD;
                let seq = if i % 2 == 0 {
                    info.seq0.wrapping_add(spread)
                } else {
                    info.seq0.wrapping_sub(spread)
                };
                (seq, rng.gen::<u32>())
            } else {
                (info.seq0, info.ack)
            };
            let packet = base.clone().flags(flags).seq(seq).ack(ack).build(&[]);
            out.push(Emission::corrupted(packet));
        }
    }
    out
}

/// Low-TTL pure ACKs advertising manipulated windows
pub(crate) fn window(info: &PacketInfo<'_>, set: &RuleSet) -> Vec<Emission> {
    let opts = &set.tcp.window;
    let n = opts.values.len().max(1);
    let values: Vec<u16> = match opts.mode {
        WindowMode::Off => return Vec::new(),
        WindowMode::Oscillate => opts.values.iter().copied().cycle().take(n * 2).collect(),
        WindowMode::Zero => vec![0; n],
        WindowMode::Random => {
            let mut rng = rand::thread_rng();
            (0..n).map(|_| rng.gen()).collect()
        }
        WindowMode::Escalate => {
            let mut v = opts.values.clone();
            v.sort_unstable();
            v
        }
    };

    let base = SegmentBuilder::from_packet(info)
        .flags(TcpFlags::ACK)
        .seq(info.seq0)
        .ttl(set.faking.ttl);
    values
        .into_iter()
        .map(|w| Emission::fake(base.clone().window(w).build(&[])))
        .collect()
}

/// `dup_ack_count` low-TTL copies of the current ACK
pub(crate) fn dup_ack(info: &PacketInfo<'_>, set: &RuleSet) -> Vec<Emission> {
    if set.tcp.dup_ack_count == 0 {
        return Vec::new();
    }
    let packet = SegmentBuilder::from_packet(info)
        .flags(TcpFlags::ACK)
        .seq(info.seq0)
        .ttl(set.faking.ttl)
        .build(&[]);
    (0..set.tcp.dup_ack_count)
        .map(|_| Emission::fake(packet.clone()))
        .collect()
}

//! Segment helpers shared by the split strategies

use super::{Emission, Segment};
use crate::packet::{PacketInfo, SegmentBuilder, TcpFlags};
use rand::Rng;
use std::time::Duration;

/// Split the payload of `info` at `cuts` into in-order real segments.
///
/// Cuts outside `1..len` are ignored; `None` if none remain. Only the
/// segment carrying the highest sequence number keeps the original PSH.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn split_segments(info: &PacketInfo<'_>, cuts: &[usize]) -> Option<Vec<Segment>> {
    let payload = info.payload();
    let len = payload.len();
    let mut bounds: Vec<usize> = cuts.iter().copied().filter(|&c| c > 0 && c < len).collect();
    if bounds.is_empty() {
        return None;
    }
    bounds.push(0);
    bounds.push(len);
    bounds.sort_unstable();
    bounds.dedup();

    let builder = SegmentBuilder::from_packet(info);
    let psh = info.flags.contains(TcpFlags::PSH);
    let last = bounds.len() - 2;
    Some(
        bounds
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                let seq = info.seq0.wrapping_add(w[0] as u32);
                let packet = builder
                    .clone()
                    .seq(seq)
                    .psh(psh && i == last)
                    .build(&payload[w[0]..w[1]]);
                Segment { packet, seq }
            })
            .collect(),
    )
}

/// Decoy TCP segment at `seq` carrying `payload`, PSH cleared
pub(crate) fn fake_segment(info: &PacketInfo<'_>, seq: u32, ttl: u8, payload: &[u8]) -> Vec<u8> {
    SegmentBuilder::from_packet(info)
        .seq(seq)
        .ttl(ttl)
        .psh(false)
        .build(payload)
}

/// Uniform random delay in `[min_us, max_us]` microseconds
pub(crate) fn jitter(min_us: u64, max_us: u64) -> Duration {
    let (lo, hi) = (min_us.min(max_us), min_us.max(max_us));
    if hi == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(rand::thread_rng().gen_range(lo..=hi))
}

/// Random bytes
pub(crate) fn random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    rand::thread_rng().fill(&mut out[..]);
    out
}

/// Pick one name from a list
pub(crate) fn pick<'a>(names: &'a [String], fallback: &'a str) -> &'a str {
    if names.is_empty() {
        return fallback;
    }
    &names[rand::thread_rng().gen_range(0..names.len())]
}

/// Emissions for segments in the given order, the first sent immediately
/// and each later one after `delay_of(index)`
pub(crate) fn emit_in_order(
    segments: Vec<Segment>,
    order: &[usize],
    mut delay_of: impl FnMut(usize) -> Duration,
) -> Vec<Emission> {
    let mut slots: Vec<Option<Segment>> = segments.into_iter().map(Some).collect();
    order
        .iter()
        .enumerate()
        .filter_map(|(n, &i)| {
            let segment = slots.get_mut(i)?.take()?;
            let delay = if n == 0 { Duration::ZERO } else { delay_of(n) };
            Some(Emission::from(segment).after(delay))
        })
        .collect()
}

//! Multi-point split with shuffling and decoys, and the hybrid selector

use super::common::{emit_in_order, fake_segment, jitter, pick, random_bytes, split_segments};
use super::{disorder, fragment, Emission, SplitInput};
use crate::config::ShuffleMode;
use rand::seq::SliceRandom;
use std::time::Duration;

/// Emission order for `n` segments
pub(crate) fn shuffle_order(n: usize, mode: ShuffleMode) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = rand::thread_rng();
    match mode {
        ShuffleMode::None => {}
        ShuffleMode::Reverse => order.reverse(),
        ShuffleMode::Full => order.shuffle(&mut rng),
        ShuffleMode::Middle => {
            if n > 3 {
                order[1..n - 1].shuffle(&mut rng);
            }
        }
    }
    order
}

/// Split at the first byte, before the SNI extension, at the SNI start
/// and at its midpoint.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn combo(input: &SplitInput<'_, '_>) -> Option<Vec<Emission>> {
    let opts = &input.set.fragmentation.combo;
    let mut cuts = Vec::with_capacity(4);
    if opts.first_byte_split {
        cuts.push(1);
    }
    if opts.ext_split {
        cuts.extend(input.pre_ext());
    }
    if let Some(sni) = input.sni() {
        cuts.push(sni.start);
        cuts.push(sni.start + sni.len() / 2);
    }
    let Some(segments) = split_segments(input.info, &cuts) else {
        return fragment::tcp(input);
    };

    let info = input.info;
    let ttl = input.set.faking.ttl;
    let mut out = Vec::with_capacity(segments.len() + 2);
    if opts.seq_overlap > 0 {
        let prefix = random_bytes(opts.seq_overlap);
        let seq = info.seq0.wrapping_sub(opts.seq_overlap as u32);
        out.push(Emission::fake(fake_segment(info, seq, ttl, &prefix)));
    }
    if opts.decoy && !opts.decoy_snis.is_empty() {
        out.push(fragment::decoy_hello(input, pick(&opts.decoy_snis, "")));
    }

    let order = shuffle_order(segments.len(), opts.shuffle);
    let first_delay = Duration::from_millis(opts.first_delay_ms);
    let jitter_max = opts.jitter_max_us;
    out.extend(emit_in_order(segments, &order, |n| {
        if n == 1 {
            first_delay
        } else {
            jitter(0, jitter_max)
        }
    }));
    Some(out)
}

/// Pick a strategy from what the ClientHello offers, in fixed priority:
/// combo, disorder, extsplit, first byte.
pub(crate) fn hybrid(input: &SplitInput<'_, '_>) -> Option<Vec<Emission>> {
    match (input.pre_ext().is_some(), input.sni().is_some()) {
        (true, true) => combo(input),
        (false, true) => disorder::disorder(input),
        (true, false) => fragment::ext_split(input),
        (false, false) => fragment::first_byte(input),
    }
}

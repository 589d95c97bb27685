//! Three-or-more-way split sent out of order with random gaps

use super::common::{emit_in_order, jitter, split_segments};
use super::{fragment, Emission, SplitInput};
use crate::config::DisorderShuffle;
use rand::seq::SliceRandom;

/// Cut around the SNI (start, middle, end) or in thirds, then send the
/// pieces shuffled or reversed with microsecond jitter between them.
pub(crate) fn disorder(input: &SplitInput<'_, '_>) -> Option<Vec<Emission>> {
    let len = input.len();
    let cuts = match input.sni() {
        Some(sni) => vec![sni.start, sni.start + sni.len() / 2, sni.end],
        None => vec![len / 3, 2 * len / 3],
    };
    let segments = match split_segments(input.info, &cuts) {
        Some(s) if s.len() >= 3 => s,
        _ => return fragment::tcp(input),
    };

    let opts = &input.set.fragmentation.disorder;
    let n = segments.len();
    let mut order: Vec<usize> = (0..n).collect();
    match opts.shuffle {
        DisorderShuffle::Reverse => order.reverse(),
        DisorderShuffle::Full => {
            order.shuffle(&mut rand::thread_rng());
            // An in-order shuffle defeats the purpose
            if order.windows(2).all(|w| w[0] < w[1]) {
                order.reverse();
            }
        }
    }

    let (lo, hi) = (opts.min_jitter_us, opts.max_jitter_us);
    Some(emit_in_order(segments, &order, |_| jitter(lo, hi)))
}

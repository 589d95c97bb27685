//! Overlapping segments: real SNI first, decoy SNI over the same bytes

use super::common::{fake_segment, pick, split_segments};
use super::{fragment, Emission, SplitInput};

/// Decoy bytes of exactly `len`, cycling `name`
fn decoy_bytes(name: &str, len: usize) -> Vec<u8> {
    if name.is_empty() {
        return vec![b'a'; len];
    }
    name.bytes().cycle().take(len).collect()
}

/// Real `[0, sni_end)`, a decoy over `[sni_start, sni_end)`, real rest.
///
/// The server keeps the bytes it received first at overlapping offsets.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn overlap(input: &SplitInput<'_, '_>) -> Option<Vec<Emission>> {
    let Some(sni) = input.sni() else {
        return fragment::tcp(input);
    };
    let info = input.info;

    let reals: Vec<Emission> = match split_segments(info, &[sni.end]) {
        Some(segments) => segments.into_iter().map(Emission::from).collect(),
        None => vec![Emission::resend(info.bytes())],
    };
    let mut reals = reals.into_iter();

    let name = pick(&input.set.fragmentation.overlap.fake_snis, "");
    let decoy = decoy_bytes(name, sni.len());
    let fake = fake_segment(
        info,
        info.seq0.wrapping_add(sni.start as u32),
        info.ttl,
        &decoy,
    );

    let mut out = Vec::with_capacity(3);
    out.extend(reals.next());
    out.push(Emission::fake(fake));
    out.extend(reals);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleSet;
    use crate::packet::{PacketBuilder, PacketInfo};
    use crate::sni::{parse_client_hello, ClientHelloBuilder};

    #[test]
    fn test_decoy_bytes_length() {
        assert_eq!(decoy_bytes("ya.ru", 12), b"ya.ruya.ruya".to_vec());
        assert_eq!(decoy_bytes("", 3), b"aaa".to_vec());
    }

    #[test]
    fn test_overlap_layout() {
        let hello = ClientHelloBuilder::new("blocked.example").build();
        let raw = PacketBuilder::tcp(
            "10.0.0.1:40000".parse().unwrap(),
            "1.2.3.4:443".parse().unwrap(),
        )
        .seq(1)
        .payload(&hello)
        .build()
        .unwrap();
        let info = PacketInfo::parse(&raw).unwrap();
        let parsed = parse_client_hello(info.payload()).unwrap();
        let sni = parsed.sni.clone().unwrap();
        let set = RuleSet::for_domains("o", &[]);
        let out = overlap(&SplitInput {
            info: &info,
            set: &set,
            hello: Some(&parsed),
        })
        .unwrap();

        assert_eq!(out.len(), 3);
        let first = PacketInfo::parse(&out[0].packet).unwrap();
        assert_eq!(first.payload(), &hello[..sni.end]);

        let fake = PacketInfo::parse(&out[1].packet).unwrap();
        assert!(!out[1].is_real());
        assert_eq!(fake.seq0, 1 + u32::try_from(sni.start).unwrap());
        assert_eq!(fake.payload_len, sni.len());
        assert_ne!(fake.payload(), &hello[sni.clone()]);

        let rest = PacketInfo::parse(&out[2].packet).unwrap();
        assert_eq!(rest.payload(), &hello[sni.end..]);
    }
}

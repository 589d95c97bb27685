//! ClientHello extension mutation
//!
//! Rewrites the extension list of a complete single-record ClientHello
//! (extra fake SNIs, GREASE, padding, TLS 1.3 extras, shuffled order) and
//! recomputes the extension, handshake and record lengths. If the result
//! would not fit the MTU, mutations are dropped lowest priority first.

use crate::config::{RuleSet, SniMutationMode, SniMutationOptions};
use crate::packet::{PacketInfo, SegmentBuilder};
use crate::sni::tls::{self, server_name_body, ClientHello, EXT_PADDING, EXT_PRE_SHARED_KEY, EXT_SERVER_NAME};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mutation {
    Duplicate,
    Grease,
    Padding,
    Advanced,
    Reorder,
}

/// Size-changing mutations, dropped in this order when over the MTU
const DROP_ORDER: [Mutation; 4] = [
    Mutation::Padding,
    Mutation::Grease,
    Mutation::Advanced,
    Mutation::Duplicate,
];

/// TLS 1.3 extensions added by `advanced` when missing
const ADVANCED_EXTENSIONS: [(u16, &[u8]); 4] = [
    (0x0005, &[0x01, 0x00, 0x00, 0x00, 0x00]), // status_request
    (0x0012, &[]),                             // signed_certificate_timestamp
    (0x001b, &[0x02, 0x00, 0x02]),             // compress_certificate (brotli)
    (0x002d, &[0x01, 0x01]),                   // psk_key_exchange_modes
];
const EXT_KEY_SHARE: u16 = 0x0033;

fn mutations(mode: SniMutationMode) -> Vec<Mutation> {
    match mode {
        SniMutationMode::Off => Vec::new(),
        SniMutationMode::Duplicate => vec![Mutation::Duplicate],
        SniMutationMode::Grease => vec![Mutation::Grease],
        SniMutationMode::Padding => vec![Mutation::Padding],
        SniMutationMode::Reorder => vec![Mutation::Reorder],
        SniMutationMode::Advanced => vec![Mutation::Advanced],
        SniMutationMode::Full => vec![
            Mutation::Duplicate,
            Mutation::Grease,
            Mutation::Padding,
            Mutation::Advanced,
            Mutation::Reorder,
        ],
    }
}

/// True for the sixteen reserved GREASE codepoints (RFC 8701)
pub fn is_grease(ext_type: u16) -> bool {
    ext_type & 0x0f0f == 0x0a0a && (ext_type >> 8) == (ext_type & 0xff)
}

fn key_share_body() -> Vec<u8> {
    let mut key = [0u8; 32];
    rand::thread_rng().fill(&mut key);
    let mut body = vec![0x00, 0x24, 0x00, 0x1d, 0x00, 0x20];
    body.extend_from_slice(&key);
    body
}

fn mutate(
    mut exts: Vec<(u16, Vec<u8>)>,
    active: &[Mutation],
    opts: &SniMutationOptions,
) -> Vec<(u16, Vec<u8>)> {
    let mut rng = rand::thread_rng();

    if active.contains(&Mutation::Duplicate) {
        let at = exts
            .iter()
            .position(|(ty, _)| *ty == EXT_SERVER_NAME)
            .map_or(0, |i| i + 1);
        for (i, name) in opts.fake_snis.iter().enumerate() {
            exts.insert(at + i, (EXT_SERVER_NAME, server_name_body(name)));
        }
    }

    if active.contains(&Mutation::Advanced) {
        for (ty, body) in ADVANCED_EXTENSIONS {
            if !exts.iter().any(|(t, _)| *t == ty) {
                exts.push((ty, body.to_vec()));
            }
        }
        if !exts.iter().any(|(t, _)| *t == EXT_KEY_SHARE) {
            exts.push((EXT_KEY_SHARE, key_share_body()));
        }
    }

    if active.contains(&Mutation::Grease) {
        let mut free: Vec<u16> = (0..16u16)
            .map(|k| 0x0a0a + 0x1010 * k)
            .filter(|g| !exts.iter().any(|(t, _)| t == g))
            .collect();
        free.shuffle(&mut rng);
        for ty in free.into_iter().take(usize::from(opts.grease_count)) {
            let at = rng.gen_range(0..=exts.len());
            exts.insert(at, (ty, Vec::new()));
        }
    }

    if active.contains(&Mutation::Reorder) {
        // server_name entries move as one block, the real name first
        let at = exts.iter().position(|(t, _)| *t == EXT_SERVER_NAME);
        let (names, mut rest): (Vec<_>, Vec<_>) = exts
            .into_iter()
            .partition(|(t, _)| *t == EXT_SERVER_NAME);
        rest.shuffle(&mut rng);
        if let Some(at) = at {
            let at = at.min(rest.len());
            rest.splice(at..at, names);
        }
        exts = rest;
    }

    if active.contains(&Mutation::Padding) && opts.padding_size > 0 {
        match exts.iter_mut().find(|(t, _)| *t == EXT_PADDING) {
            Some((_, body)) => body.resize(body.len() + opts.padding_size, 0),
            None => exts.push((EXT_PADDING, vec![0; opts.padding_size])),
        }
    }

    // pre_shared_key must stay last
    if let Some(i) = exts.iter().position(|(t, _)| *t == EXT_PRE_SHARED_KEY) {
        let psk = exts.remove(i);
        exts.push(psk);
    }
    exts
}

fn add_u24(buf: &mut [u8], at: usize, delta: isize) -> Option<()> {
    let field = buf.get_mut(at..at + 3)?;
    let old = (usize::from(field[0]) << 16) | (usize::from(field[1]) << 8) | usize::from(field[2]);
    let new = old.checked_add_signed(delta).filter(|&v| v < 1 << 24)?;
    field.copy_from_slice(&u32::try_from(new).ok()?.to_be_bytes()[1..]);
    Some(())
}

fn add_u16(buf: &mut [u8], at: usize, delta: isize) -> Option<()> {
    let field = buf.get_mut(at..at + 2)?;
    let old = usize::from(u16::from_be_bytes([field[0], field[1]]));
    let new = u16::try_from(old.checked_add_signed(delta)?).ok()?;
    field.copy_from_slice(&new.to_be_bytes());
    Some(())
}

fn rebuild(
    payload: &[u8],
    hello: &ClientHello,
    ext_end: usize,
    exts: &[(u16, Vec<u8>)],
) -> Option<Vec<u8>> {
    let ext_len: usize = exts.iter().map(|(_, body)| 4 + body.len()).sum();
    let ext_len = u16::try_from(ext_len).ok()?;

    let mut out = Vec::with_capacity(payload.len() + 512);
    out.extend_from_slice(&payload[..hello.extensions_start]);
    out.extend_from_slice(&ext_len.to_be_bytes());
    for (ty, body) in exts {
        out.extend_from_slice(&ty.to_be_bytes());
        out.extend_from_slice(&u16::try_from(body.len()).ok()?.to_be_bytes());
        out.extend_from_slice(body);
    }
    out.extend_from_slice(&payload[ext_end..]);

    let delta = isize::try_from(out.len()).ok()? - isize::try_from(payload.len()).ok()?;
    add_u24(&mut out, hello.handshake_start + 1, delta)?;
    add_u16(&mut out, 3, delta)?;
    Some(out)
}

/// Mutate a payload that starts with a complete ClientHello record.
///
/// Returns `None` when the mode is off, the payload is not a complete
/// ClientHello, or nothing fits in `max_len`.
pub fn mutate_payload(payload: &[u8], opts: &SniMutationOptions, max_len: usize) -> Option<Vec<u8>> {
    let mut active = mutations(opts.mode);
    if active.is_empty() {
        return None;
    }
    let hello = tls::parse_client_hello(payload)?;
    if hello.record_start != Some(0) {
        return None;
    }
    let at = hello.extensions_start;
    let declared = usize::from(u16::from_be_bytes([*payload.get(at)?, *payload.get(at + 1)?]));
    let ext_end = at + 2 + declared;
    if ext_end > payload.len() {
        return None;
    }

    let exts: Vec<(u16, Vec<u8>)> = tls::extensions(payload, &hello)
        .map(|e| (e.ext_type, payload[e.data.clone()].to_vec()))
        .collect();

    loop {
        let rebuilt = rebuild(payload, &hello, ext_end, &mutate(exts.clone(), &active, opts))?;
        if rebuilt.len() <= max_len {
            return Some(rebuilt);
        }
        let victim = DROP_ORDER.iter().find(|m| active.contains(m))?;
        debug!(mutation = ?victim, size = rebuilt.len(), max_len, "over MTU, dropping mutation");
        active.retain(|m| m != victim);
        if active.is_empty() {
            return None;
        }
    }
}

/// Mutated copy of `info`'s packet, or `None` to keep it as is
pub fn apply(info: &PacketInfo<'_>, set: &RuleSet, mtu: usize) -> Option<Vec<u8>> {
    let opts = &set.fragmentation.sni_mutation;
    if opts.mode == SniMutationMode::Off || !info.is_tcp() {
        return None;
    }
    let max_len = mtu.saturating_sub(info.payload_start);
    let payload = mutate_payload(info.payload(), opts, max_len)?;
    debug!(
        set = %set.id,
        mode = ?opts.mode,
        before = info.payload_len,
        after = payload.len(),
        "ClientHello mutated"
    );
    Some(SegmentBuilder::from_packet(info).build(&payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sni::{extract_sni, ClientHelloBuilder};

    fn opts(mode: SniMutationMode) -> SniMutationOptions {
        SniMutationOptions {
            mode,
            ..SniMutationOptions::default()
        }
    }

    fn ext_types(payload: &[u8]) -> Vec<u16> {
        let hello = tls::parse_client_hello(payload).unwrap();
        tls::extensions(payload, &hello).map(|e| e.ext_type).collect()
    }

    fn assert_lengths_consistent(payload: &[u8]) {
        let record = usize::from(u16::from_be_bytes([payload[3], payload[4]]));
        assert_eq!(record, payload.len() - 5);
        let hs = (usize::from(payload[6]) << 16) | (usize::from(payload[7]) << 8) | usize::from(payload[8]);
        assert_eq!(hs, payload.len() - 9);
    }

    #[test]
    fn test_is_grease() {
        assert!(is_grease(0x0a0a));
        assert!(is_grease(0xfafa));
        assert!(!is_grease(0x0a1a));
        assert!(!is_grease(0x0000));
    }

    #[test]
    fn test_off_is_none() {
        let hello = ClientHelloBuilder::new("example.com").build();
        assert!(mutate_payload(&hello, &opts(SniMutationMode::Off), 1500).is_none());
    }

    #[test]
    fn test_padding() {
        let hello = ClientHelloBuilder::new("example.com").build();
        let out = mutate_payload(&hello, &opts(SniMutationMode::Padding), 1500).unwrap();
        assert_eq!(out.len(), hello.len() + 4 + 256);
        assert_lengths_consistent(&out);
        assert_eq!(extract_sni(&out).as_deref(), Some("example.com"));
    }

    #[test]
    fn test_duplicate_keeps_real_first() {
        let hello = ClientHelloBuilder::new("example.com").build();
        let out = mutate_payload(&hello, &opts(SniMutationMode::Duplicate), 1500).unwrap();
        let sni_count = ext_types(&out).iter().filter(|t| **t == EXT_SERVER_NAME).count();
        assert_eq!(sni_count, 2);
        assert_eq!(extract_sni(&out).as_deref(), Some("example.com"));
        assert_lengths_consistent(&out);
    }

    #[test]
    fn test_grease() {
        let hello = ClientHelloBuilder::new("example.com").build();
        let out = mutate_payload(&hello, &opts(SniMutationMode::Grease), 1500).unwrap();
        assert_eq!(ext_types(&out).into_iter().filter(|t| is_grease(*t)).count(), 3);
        assert_lengths_consistent(&out);
    }

    #[test]
    fn test_advanced_adds_missing_only() {
        let hello = ClientHelloBuilder::new("example.com").build();
        let before = ext_types(&hello);
        let out = mutate_payload(&hello, &opts(SniMutationMode::Advanced), 1500).unwrap();
        let after = ext_types(&out);
        // psk_key_exchange_modes and key_share were already present
        assert_eq!(after.len(), before.len() + 3);
        assert_eq!(after.iter().filter(|t| **t == 0x002d).count(), 1);
    }

    #[test]
    fn test_reorder_keeps_psk_last() {
        let hello = ClientHelloBuilder::new("example.com")
            .extension(EXT_PRE_SHARED_KEY, vec![0; 10])
            .build();
        for _ in 0..10 {
            let out = mutate_payload(&hello, &opts(SniMutationMode::Reorder), 1500).unwrap();
            assert_eq!(out.len(), hello.len());
            assert_eq!(*ext_types(&out).last().unwrap(), EXT_PRE_SHARED_KEY);
            assert_eq!(extract_sni(&out).as_deref(), Some("example.com"));
        }
    }

    #[test]
    fn test_full_keeps_real_name_first() {
        let hello = ClientHelloBuilder::new("example.com").build();
        let o = opts(SniMutationMode::Full);
        assert!(!o.fake_snis.is_empty());
        for _ in 0..200 {
            let out = mutate_payload(&hello, &o, 1500).unwrap();
            assert_eq!(extract_sni(&out).as_deref(), Some("example.com"));

            let types = ext_types(&out);
            let first = types.iter().position(|t| *t == EXT_SERVER_NAME).unwrap();
            let names = 1 + o.fake_snis.len();
            assert!(types[first..first + names].iter().all(|t| *t == EXT_SERVER_NAME));
            assert_lengths_consistent(&out);
        }
    }

    #[test]
    fn test_mtu_drops_padding_first() {
        let hello = ClientHelloBuilder::new("example.com").build();
        let mut o = opts(SniMutationMode::Full);
        o.padding_size = 2000;
        let out = mutate_payload(&hello, &o, 1400).unwrap();
        assert!(out.len() <= 1400);
        let types = ext_types(&out);
        assert!(!types.contains(&EXT_PADDING));
        assert!(types.iter().any(|t| is_grease(*t)));
        assert_lengths_consistent(&out);
    }

    #[test]
    fn test_incomplete_hello_rejected() {
        let hello = ClientHelloBuilder::new("example.com").build();
        assert!(mutate_payload(&hello[..hello.len() - 10], &opts(SniMutationMode::Padding), 1500).is_none());
    }
}

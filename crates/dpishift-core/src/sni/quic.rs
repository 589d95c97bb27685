//! QUIC Initial packet SNI extraction (RFC 9001, RFC 9369)
//!
//! Client Initial packets are encrypted with keys anyone can derive from
//! the Destination Connection ID. We derive them, strip header protection,
//! decrypt the payload, stitch the CRYPTO frames back into a ClientHello
//! and hand it to the TLS walker. Every failure is simply "no name".

use super::tls;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use tracing::trace;

/// QUIC v1 Initial Salt (RFC 9001 Section 5.2)
const QUIC_V1_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];

/// QUIC v2 Initial Salt (RFC 9369)
const QUIC_V2_SALT: [u8; 20] = [
    0x0d, 0xed, 0xe3, 0xde, 0xf7, 0x00, 0xa6, 0xdb, 0x81, 0x93, 0x81, 0xbe, 0x6e, 0x26, 0x9d, 0xcb,
    0xf9, 0xbd, 0x2e, 0xd9,
];

const MAX_CID_LEN: usize = 20;
const HP_SAMPLE_LEN: usize = 16;
const TAG_LEN: usize = 16;
/// Packet number length used for sealed decoys
const PN_LEN: usize = 4;
/// Upper bound on reassembled CRYPTO data
const MAX_CRYPTO_LEN: usize = 16 * 1024;
/// Client Initials must be padded to at least this size
pub const MIN_INITIAL_SIZE: usize = 1200;

/// Supported QUIC versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicVersion {
    /// RFC 9000
    V1,
    /// RFC 9369
    V2,
}

impl QuicVersion {
    /// Map a wire version number
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x0000_0001 => Some(Self::V1),
            0x6b33_43cf => Some(Self::V2),
            _ => None,
        }
    }

    /// Wire version number
    pub fn as_u32(self) -> u32 {
        match self {
            Self::V1 => 0x0000_0001,
            Self::V2 => 0x6b33_43cf,
        }
    }

    fn salt(self) -> &'static [u8; 20] {
        match self {
            Self::V1 => &QUIC_V1_SALT,
            Self::V2 => &QUIC_V2_SALT,
        }
    }

    fn label_prefix(self) -> &'static str {
        match self {
            Self::V1 => "quic",
            Self::V2 => "quicv2",
        }
    }

    /// Long-header packet type bits of an Initial
    fn initial_type(self) -> u8 {
        match self {
            Self::V1 => 0,
            Self::V2 => 1,
        }
    }
}

/// Client Initial keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialKeys {
    /// AES-128-GCM key
    pub key: [u8; 16],
    /// AEAD IV
    pub iv: [u8; 12],
    /// Header protection key
    pub hp: [u8; 16],
}

fn expand_label(secret: &Hkdf<Sha256>, label: &str, out: &mut [u8]) -> Option<()> {
    let full = format!("tls13 {label}");
    let mut info = Vec::with_capacity(4 + full.len());
    info.extend_from_slice(&u16::try_from(out.len()).ok()?.to_be_bytes());
    info.push(u8::try_from(full.len()).ok()?);
    info.extend_from_slice(full.as_bytes());
    info.push(0);
    secret.expand(&info, out).ok()
}

/// Derive client Initial keys from a Destination Connection ID
pub fn derive_initial_keys(dcid: &[u8], version: QuicVersion) -> Option<InitialKeys> {
    let initial = Hkdf::<Sha256>::new(Some(version.salt()), dcid);
    let mut client_secret = [0u8; 32];
    expand_label(&initial, "client in", &mut client_secret)?;

    let client = Hkdf::<Sha256>::from_prk(&client_secret).ok()?;
    let prefix = version.label_prefix();
    let mut keys = InitialKeys {
        key: [0; 16],
        iv: [0; 12],
        hp: [0; 16],
    };
    expand_label(&client, &format!("{prefix} key"), &mut keys.key)?;
    expand_label(&client, &format!("{prefix} iv"), &mut keys.iv)?;
    expand_label(&client, &format!("{prefix} hp"), &mut keys.hp)?;
    Some(keys)
}

/// Read a QUIC variable-length integer at `*pos`
pub fn read_varint(data: &[u8], pos: &mut usize) -> Option<u64> {
    let first = *data.get(*pos)?;
    let len = 1usize << (first >> 6);
    let bytes = data.get(*pos..*pos + len)?;
    let value = bytes[1..]
        .iter()
        .fold(u64::from(first & 0x3f), |acc, b| (acc << 8) | u64::from(*b));
    *pos += len;
    Some(value)
}

#[allow(clippy::cast_possible_truncation)]
fn write_varint(out: &mut Vec<u8>, v: u64) {
    if v < 0x40 {
        out.push(v as u8);
    } else if v < 0x4000 {
        out.extend_from_slice(&((v as u16) | 0x4000).to_be_bytes());
    } else {
        out.extend_from_slice(&((v as u32) | 0x8000_0000).to_be_bytes());
    }
}

/// Parsed (still protected) Initial header
#[derive(Debug, Clone)]
struct InitialHeader {
    version: QuicVersion,
    dcid: std::ops::Range<usize>,
    pn_offset: usize,
    /// Value of the Length field (packet number + payload)
    length: usize,
}

fn parse_header(data: &[u8]) -> Option<InitialHeader> {
    let first = *data.first()?;
    // Long header with the fixed bit set
    if first & 0xC0 != 0xC0 {
        return None;
    }
    let v = data.get(1..5)?;
    let version = QuicVersion::from_u32(u32::from_be_bytes([v[0], v[1], v[2], v[3]]))?;
    if (first >> 4) & 0x03 != version.initial_type() {
        return None;
    }

    let mut pos = 5;
    let dcid_len = usize::from(*data.get(pos)?);
    if dcid_len > MAX_CID_LEN {
        return None;
    }
    let dcid = pos + 1..pos + 1 + dcid_len;
    pos = dcid.end;
    let scid_len = usize::from(*data.get(pos)?);
    if scid_len > MAX_CID_LEN {
        return None;
    }
    pos += 1 + scid_len;

    let token_len = usize::try_from(read_varint(data, &mut pos)?).ok()?;
    pos = pos.checked_add(token_len)?;
    let length = usize::try_from(read_varint(data, &mut pos)?).ok()?;
    if pos > data.len() {
        return None;
    }

    Some(InitialHeader {
        version,
        dcid,
        pn_offset: pos,
        length,
    })
}

/// Cheap check: long header, supported version, Initial type
pub fn is_initial(data: &[u8]) -> bool {
    parse_header(data).is_some()
}

fn hp_mask(hp: &[u8; 16], sample: &[u8]) -> Option<[u8; 16]> {
    let cipher = Aes128::new_from_slice(hp).ok()?;
    let mut block = [0u8; 16];
    block.copy_from_slice(sample.get(..HP_SAMPLE_LEN)?);
    cipher.encrypt_block(aes::Block::from_mut_slice(&mut block));
    Some(block)
}

fn nonce_for(iv: &[u8; 12], pn: u64) -> [u8; 12] {
    let mut nonce = *iv;
    for (n, p) in nonce[4..].iter_mut().zip(pn.to_be_bytes()) {
        *n ^= p;
    }
    nonce
}

/// Decrypt the payload of a client Initial packet
pub fn decrypt_initial(data: &[u8]) -> Option<Vec<u8>> {
    let header = parse_header(data)?;
    let keys = derive_initial_keys(&data[header.dcid.clone()], header.version)?;

    let sample_at = header.pn_offset + 4;
    let mask = hp_mask(&keys.hp, data.get(sample_at..sample_at + HP_SAMPLE_LEN)?)?;

    let first = data[0] ^ (mask[0] & 0x0f);
    let pn_len = usize::from(first & 0x03) + 1;
    let payload_start = header.pn_offset + pn_len;
    let payload_end = header.pn_offset.checked_add(header.length)?;
    if payload_end > data.len() || payload_end < payload_start + TAG_LEN {
        return None;
    }

    let mut aad = data[..payload_start].to_vec();
    aad[0] = first;
    let mut pn = 0u64;
    for i in 0..pn_len {
        aad[header.pn_offset + i] ^= mask[1 + i];
        pn = (pn << 8) | u64::from(aad[header.pn_offset + i]);
    }

    let cipher = Aes128Gcm::new_from_slice(&keys.key).ok()?;
    let nonce = nonce_for(&keys.iv, pn);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &data[payload_start..payload_end],
                aad: &aad,
            },
        )
        .ok()
}

fn skip_ack(payload: &[u8], pos: &mut usize, ecn: bool) -> Option<()> {
    read_varint(payload, pos)?; // largest acknowledged
    read_varint(payload, pos)?; // delay
    let ranges = read_varint(payload, pos)?;
    read_varint(payload, pos)?; // first range
    for _ in 0..ranges {
        read_varint(payload, pos)?;
        read_varint(payload, pos)?;
    }
    if ecn {
        for _ in 0..3 {
            read_varint(payload, pos)?;
        }
    }
    Some(())
}

/// Reassemble CRYPTO frame data contiguous from offset 0
pub fn reassemble_crypto(payload: &[u8]) -> Option<Vec<u8>> {
    let mut fragments: Vec<(usize, &[u8])> = Vec::new();
    let mut pos = 0;

    while pos < payload.len() {
        let frame = payload[pos];
        pos += 1;
        match frame {
            0x00 | 0x01 => {}
            0x02 | 0x03 => skip_ack(payload, &mut pos, frame == 0x03)?,
            0x06 => {
                let offset = usize::try_from(read_varint(payload, &mut pos)?).ok()?;
                let len = usize::try_from(read_varint(payload, &mut pos)?).ok()?;
                let data = payload.get(pos..pos.checked_add(len)?)?;
                pos += len;
                if offset < MAX_CRYPTO_LEN {
                    fragments.push((offset, data));
                }
            }
            _ => break,
        }
    }

    fragments.sort_by_key(|(offset, _)| *offset);
    let mut out: Vec<u8> = Vec::new();
    for (offset, data) in fragments {
        if offset > out.len() {
            break;
        }
        let skip = out.len() - offset;
        if skip < data.len() {
            out.extend_from_slice(&data[skip..]);
        }
    }
    out.truncate(MAX_CRYPTO_LEN);
    (!out.is_empty()).then_some(out)
}

/// Extract the Server Name from a UDP payload holding a client Initial
pub fn extract_sni(data: &[u8]) -> Option<String> {
    let Some(plain) = decrypt_initial(data) else {
        trace!("QUIC: initial did not decrypt");
        return None;
    };
    let crypto = reassemble_crypto(&plain)?;
    let hello = tls::parse_handshake(&crypto, 0)?;
    hello.server_name(&crypto).map(str::to_owned)
}

/// Seal a client Initial carrying `crypto` as a single CRYPTO frame.
///
/// The packet is padded with PADDING frames to at least `min_size` bytes.
/// Used to build decoy Initials.
#[allow(clippy::cast_possible_truncation)]
pub fn seal_initial(
    dcid: &[u8],
    scid: &[u8],
    version: QuicVersion,
    pn: u32,
    crypto: &[u8],
    min_size: usize,
) -> Option<Vec<u8>> {
    if dcid.len() > MAX_CID_LEN || scid.len() > MAX_CID_LEN {
        return None;
    }
    let keys = derive_initial_keys(dcid, version)?;

    let mut plain = vec![0x06, 0x00];
    write_varint(&mut plain, crypto.len() as u64);
    plain.extend_from_slice(crypto);

    let mut header = vec![0xC0 | (version.initial_type() << 4) | (PN_LEN as u8 - 1)];
    header.extend_from_slice(&version.as_u32().to_be_bytes());
    header.push(dcid.len() as u8);
    header.extend_from_slice(dcid);
    header.push(scid.len() as u8);
    header.extend_from_slice(scid);
    header.push(0); // token length
    // Length is always written as a 2-byte varint
    let fixed = header.len() + 2 + PN_LEN + TAG_LEN;
    if fixed + plain.len() < min_size {
        plain.resize(min_size - fixed, 0);
    }
    let length = PN_LEN + plain.len() + TAG_LEN;
    if length >= 0x4000 {
        return None;
    }
    header.extend_from_slice(&((length as u16) | 0x4000).to_be_bytes());
    let pn_offset = header.len();
    header.extend_from_slice(&pn.to_be_bytes());

    let cipher = Aes128Gcm::new_from_slice(&keys.key).ok()?;
    let nonce = nonce_for(&keys.iv, u64::from(pn));
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plain,
                aad: &header,
            },
        )
        .ok()?;

    let mut packet = header;
    packet.extend_from_slice(&sealed);
    let sample_at = pn_offset + 4;
    let mask = hp_mask(&keys.hp, &packet[sample_at..sample_at + HP_SAMPLE_LEN])?;
    packet[0] ^= mask[0] & 0x0f;
    for i in 0..PN_LEN {
        packet[pn_offset + i] ^= mask[1 + i];
    }
    Some(packet)
}

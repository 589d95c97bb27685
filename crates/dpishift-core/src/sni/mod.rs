//! Protocol extractors
//!
//! Pull a Server Name out of TLS ClientHellos, QUIC Initials and DNS
//! queries. None of these return errors: a name is either there or it
//! is not (yet).

pub mod dns;
pub mod quic;
pub mod tls;

pub use tls::{extract_sni, parse_client_hello, ClientHello, ClientHelloBuilder};

/// STUN magic cookie (RFC 5389)
const STUN_MAGIC: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];

/// True for STUN messages (used by WebRTC voice/video)
pub fn is_stun(payload: &[u8]) -> bool {
    payload.len() >= 20
        && payload[0] & 0xC0 == 0
        && payload[4..8] == STUN_MAGIC
        && usize::from(u16::from_be_bytes([payload[2], payload[3]])) + 20 <= payload.len()
}

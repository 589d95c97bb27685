//! TLS ClientHello parsing
//!
//! A streaming-tolerant walk over a ClientHello: declared lengths are
//! clamped to the bytes actually available, so the same function serves
//! both whole records and the first few segments of one. Absence of a
//! Server Name is reported as `None`; the caller retries once more bytes
//! have arrived.

use crate::packet::MAX_HOSTNAME_LEN;
use std::ops::Range;

/// TLS record content type: handshake
pub const CONTENT_HANDSHAKE: u8 = 0x16;
/// Handshake message type: ClientHello
pub const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
/// server_name extension
pub const EXT_SERVER_NAME: u16 = 0x0000;
/// padding extension (RFC 7685)
pub const EXT_PADDING: u16 = 0x0015;
/// pre_shared_key extension, always last when present
pub const EXT_PRE_SHARED_KEY: u16 = 0x0029;
/// Encrypted Client Hello codepoints seen in the wild
pub const EXT_ECH: std::ops::RangeInclusive<u16> = 0xfe0d..=0xfe0f;

/// Size of a TLS record header
pub const RECORD_HEADER_LEN: usize = 5;
/// Size of a handshake message header
pub const HANDSHAKE_HEADER_LEN: usize = 4;

/// Byte layout of a (possibly truncated) ClientHello.
///
/// All offsets are relative to the buffer that was parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// Offset of the TLS record header, `None` for bare handshakes (QUIC)
    pub record_start: Option<usize>,
    /// Offset of the handshake header (type byte)
    pub handshake_start: usize,
    /// Offset of the 2-byte extensions length field
    pub extensions_start: usize,
    /// End of the extensions block, clamped to the buffer
    pub extensions_end: usize,
    /// Offset of the server_name extension's type field
    pub sni_ext: Option<usize>,
    /// Bytes of the first host_name entry
    pub sni: Option<Range<usize>>,
    /// An Encrypted Client Hello extension was present
    pub ech: bool,
}

impl ClientHello {
    /// The validated Server Name, borrowed from `buf`
    pub fn server_name<'a>(&self, buf: &'a [u8]) -> Option<&'a str> {
        let range = self.sni.clone()?;
        std::str::from_utf8(buf.get(range)?)
            .ok()
            .filter(|name| is_valid_hostname(name))
    }

    /// Midpoint of the Server Name bytes
    pub fn sni_mid(&self) -> Option<usize> {
        self.sni.as_ref().map(|r| r.start + r.len() / 2)
    }
}

/// One extension inside the extensions block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    /// Extension type
    pub ext_type: u16,
    /// Offset of the type field
    pub start: usize,
    /// Extension body, clamped to the buffer
    pub data: Range<usize>,
    /// Body was cut short by the end of the buffer
    pub truncated: bool,
}

impl Extension {
    /// Offset one past the end of this extension
    pub fn end(&self) -> usize {
        self.data.end
    }
}

/// Iterator over the extensions of a parsed ClientHello
pub struct Extensions<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl Iterator for Extensions<'_> {
    type Item = Extension;

    fn next(&mut self) -> Option<Extension> {
        if self.pos + 4 > self.end {
            return None;
        }
        let b = &self.buf[self.pos..self.pos + 4];
        let ext_type = u16::from_be_bytes([b[0], b[1]]);
        let len = usize::from(u16::from_be_bytes([b[2], b[3]]));
        let body = self.pos + 4;
        let declared_end = body + len;
        let ext = Extension {
            ext_type,
            start: self.pos,
            data: body..declared_end.min(self.end),
            truncated: declared_end > self.end,
        };
        self.pos = declared_end;
        Some(ext)
    }
}

/// Walk the extensions of `hello`
pub fn extensions<'a>(buf: &'a [u8], hello: &ClientHello) -> Extensions<'a> {
    Extensions {
        buf,
        pos: hello.extensions_start + 2,
        end: hello.extensions_end.min(buf.len()),
    }
}

/// Check a Server Name the way browsers tolerate them.
///
/// Permissive for IDN: any non-ASCII character is accepted.
pub fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    let chars_ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') || !c.is_ascii());
    chars_ok && (name.contains('.') || name == "localhost")
}

/// Offset of the first TLS handshake record that carries a ClientHello
pub fn find_client_hello(buf: &[u8]) -> Option<usize> {
    if buf.len() < RECORD_HEADER_LEN + 1 {
        return None;
    }
    (0..buf.len() - RECORD_HEADER_LEN).find(|&i| {
        buf[i] == CONTENT_HANDSHAKE
            && buf[i + 1] == 0x03
            && buf[i + 2] <= 0x04
            && buf[i + RECORD_HEADER_LEN] == HANDSHAKE_CLIENT_HELLO
    })
}

/// Parse the first ClientHello record in `buf`
pub fn parse_client_hello(buf: &[u8]) -> Option<ClientHello> {
    let record = find_client_hello(buf)?;
    let mut hello = parse_handshake(buf, record + RECORD_HEADER_LEN)?;
    hello.record_start = Some(record);
    Some(hello)
}

/// Parse a ClientHello handshake message starting at `hs` (the type byte)
pub fn parse_handshake(buf: &[u8], hs: usize) -> Option<ClientHello> {
    if *buf.get(hs)? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let hdr = buf.get(hs + 1..hs + HANDSHAKE_HEADER_LEN)?;
    let declared = (usize::from(hdr[0]) << 16) | (usize::from(hdr[1]) << 8) | usize::from(hdr[2]);
    let limit = (hs + HANDSHAKE_HEADER_LEN + declared).min(buf.len());

    // client_version(2) + random(32)
    let mut pos = hs + HANDSHAKE_HEADER_LEN + 2 + 32;
    let len_at = |pos: usize, width: usize| -> Option<usize> {
        if pos + width > limit {
            return None;
        }
        Some(match width {
            1 => usize::from(buf[pos]),
            _ => usize::from(u16::from_be_bytes([buf[pos], buf[pos + 1]])),
        })
    };

    // session_id, cipher_suites, compression_methods
    pos += 1 + len_at(pos, 1)?;
    pos += 2 + len_at(pos, 2)?;
    pos += 1 + len_at(pos, 1)?;

    let ext_len = len_at(pos, 2)?;
    let extensions_start = pos;
    let extensions_end = (pos + 2 + ext_len).min(limit);

    let walk = Extensions {
        buf,
        pos: extensions_start + 2,
        end: extensions_end,
    };
    let (mut sni_ext, mut sni, mut ech) = (None, None, false);
    for ext in walk {
        if EXT_ECH.contains(&ext.ext_type) {
            ech = true;
        }
        if ext.ext_type == EXT_SERVER_NAME && sni_ext.is_none() {
            sni_ext = Some(ext.start);
            sni = host_name_entry(buf, &ext.data);
        }
    }

    Some(ClientHello {
        record_start: None,
        handshake_start: hs,
        extensions_start,
        extensions_end,
        sni_ext,
        sni,
        ech,
    })
}

/// First host_name entry of a server_name extension body
fn host_name_entry(buf: &[u8], body: &Range<usize>) -> Option<Range<usize>> {
    let data = buf.get(body.clone())?;
    let list_len = usize::from(u16::from_be_bytes([*data.first()?, *data.get(1)?]));
    let list_end = (2 + list_len).min(data.len());
    let mut pos = 2;
    while pos + 3 <= list_end {
        let name_type = data[pos];
        let name_len = usize::from(u16::from_be_bytes([data[pos + 1], data[pos + 2]]));
        let start = pos + 3;
        if start + name_len > list_end {
            return None;
        }
        if name_type == 0 {
            return Some(body.start + start..body.start + start + name_len);
        }
        pos = start + name_len;
    }
    None
}

/// Extract the validated Server Name from a buffer holding a ClientHello
pub fn extract_sni(buf: &[u8]) -> Option<String> {
    let hello = parse_client_hello(buf)?;
    hello.server_name(buf).map(str::to_owned)
}

/// Builds synthetic ClientHello records.
///
/// Used for decoys and fake payloads; the extension set mimics a current
/// browser closely enough to be parsed as a real handshake.
#[derive(Debug, Clone)]
pub struct ClientHelloBuilder {
    random: [u8; 32],
    session_id: [u8; 32],
    extensions: Vec<(u16, Vec<u8>)>,
}

impl ClientHelloBuilder {
    /// A ClientHello for `host` with a browser-like extension list
    pub fn new(host: &str) -> Self {
        let mut random = [0u8; 32];
        let mut session_id = [0u8; 32];
        let mut key = [0u8; 32];
        let mut rng = rand::thread_rng();
        rand::Rng::fill(&mut rng, &mut random[..]);
        rand::Rng::fill(&mut rng, &mut session_id[..]);
        rand::Rng::fill(&mut rng, &mut key[..]);

        let mut key_share = vec![0x00, 0x24, 0x00, 0x1d, 0x00, 0x20];
        key_share.extend_from_slice(&key);

        let extensions = vec![
            (EXT_SERVER_NAME, server_name_body(host)),
            (0x0017, Vec::new()),                                          // extended_master_secret
            (0xff01, vec![0x00]),                                          // renegotiation_info
            (0x000a, vec![0x00, 0x06, 0x00, 0x1d, 0x00, 0x17, 0x00, 0x18]), // supported_groups
            (0x000b, vec![0x01, 0x00]),                                    // ec_point_formats
            (0x0010, alpn_body(&[b"h2", b"http/1.1"])),
            (
                0x000d,
                vec![0x00, 0x08, 0x04, 0x03, 0x08, 0x04, 0x04, 0x01, 0x05, 0x03],
            ), // signature_algorithms
            (0x002b, vec![0x04, 0x03, 0x04, 0x03, 0x03]), // supported_versions
            (0x002d, vec![0x01, 0x01]),                   // psk_key_exchange_modes
            (0x0033, key_share),
        ];

        Self {
            random,
            session_id,
            extensions,
        }
    }

    /// Mutable access to the extension list (type, body)
    pub fn extensions_mut(&mut self) -> &mut Vec<(u16, Vec<u8>)> {
        &mut self.extensions
    }

    /// Append an extension
    #[must_use]
    pub fn extension(mut self, ext_type: u16, body: Vec<u8>) -> Self {
        self.extensions.push((ext_type, body));
        self
    }

    /// Serialize as one TLS record
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Vec<u8> {
        const CIPHERS: [u16; 9] = [
            0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8,
        ];

        let mut body = Vec::with_capacity(512);
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&self.random);
        body.push(self.session_id.len() as u8);
        body.extend_from_slice(&self.session_id);
        body.extend_from_slice(&((CIPHERS.len() * 2) as u16).to_be_bytes());
        for suite in CIPHERS {
            body.extend_from_slice(&suite.to_be_bytes());
        }
        body.extend_from_slice(&[0x01, 0x00]);

        let ext_total: usize = self.extensions.iter().map(|(_, d)| 4 + d.len()).sum();
        body.extend_from_slice(&(ext_total as u16).to_be_bytes());
        for (ty, data) in &self.extensions {
            body.extend_from_slice(&ty.to_be_bytes());
            body.extend_from_slice(&(data.len() as u16).to_be_bytes());
            body.extend_from_slice(data);
        }

        let hs_len = body.len();
        let mut record = Vec::with_capacity(hs_len + 9);
        record.extend_from_slice(&[CONTENT_HANDSHAKE, 0x03, 0x01]);
        record.extend_from_slice(&((hs_len + 4) as u16).to_be_bytes());
        record.push(HANDSHAKE_CLIENT_HELLO);
        record.extend_from_slice(&(hs_len as u32).to_be_bytes()[1..]);
        record.extend_from_slice(&body);
        record
    }
}

/// Body of a server_name extension holding one host_name entry
#[allow(clippy::cast_possible_truncation)]
pub fn server_name_body(host: &str) -> Vec<u8> {
    let name = host.as_bytes();
    let mut out = Vec::with_capacity(name.len() + 5);
    out.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    out.push(0);
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name);
    out
}

#[allow(clippy::cast_possible_truncation)]
fn alpn_body(protocols: &[&[u8]]) -> Vec<u8> {
    let list: Vec<u8> = protocols
        .iter()
        .flat_map(|p| std::iter::once(p.len() as u8).chain(p.iter().copied()))
        .collect();
    let mut out = (list.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(&list);
    out
}

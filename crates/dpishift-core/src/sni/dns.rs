//! DNS query name extraction for the plaintext redirect path

use crate::packet::MAX_HOSTNAME_LEN;

/// DNS header size
const HEADER_LEN: usize = 12;
/// Maximum length of one label
const MAX_LABEL_LEN: usize = 63;

/// Extract the first QNAME of a DNS query, lowercased.
///
/// Responses (QR=1), queries without questions and compressed names are
/// rejected; queries never need compression pointers.
pub fn extract_qname(payload: &[u8]) -> Option<String> {
    if payload.len() < HEADER_LEN {
        return None;
    }
    // QR bit
    if payload[2] & 0x80 != 0 {
        return None;
    }
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]);
    if qdcount == 0 {
        return None;
    }

    let mut name = String::with_capacity(64);
    let mut pos = HEADER_LEN;
    loop {
        let len = usize::from(*payload.get(pos)?);
        if len == 0 {
            break;
        }
        if len > MAX_LABEL_LEN {
            return None;
        }
        let label = payload.get(pos + 1..pos + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        for &b in label {
            if !(b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
                return None;
            }
            name.push(char::from(b.to_ascii_lowercase()));
        }
        if name.len() > MAX_HOSTNAME_LEN {
            return None;
        }
        pos += 1 + len;
    }

    (!name.is_empty()).then_some(name)
}

/// True if the payload looks like a DNS response (QR=1)
pub fn is_response(payload: &[u8]) -> bool {
    payload.len() >= HEADER_LEN && payload[2] & 0x80 != 0
}

#[cfg(test)]
pub(crate) fn build_query(id: u16, name: &str) -> Vec<u8> {
    let mut q = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    q.extend_from_slice(&id.to_be_bytes());
    q.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    for label in name.split('.') {
        q.push(u8::try_from(label.len()).unwrap());
        q.extend_from_slice(label.as_bytes());
    }
    q.extend_from_slice(&[0, 0x00, 0x01, 0x00, 0x01]);
    q
}

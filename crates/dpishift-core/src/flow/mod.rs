//! Flow reassembler
//!
//! Accumulates the first bytes of each outbound TCP flow until a Server
//! Name falls out of the ClientHello. Each worker owns one [`FlowTable`];
//! the kernel hashes a flow to a single queue, so no locking is needed.

use crate::packet::FlowKey;
use crate::sni::tls::{self, CONTENT_HANDSHAKE};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::trace;

/// Default per-flow buffer cap
pub const DEFAULT_BUFFER_CAP: usize = 8 * 1024;
/// Default entry lifetime
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Per-flow accumulator
#[derive(Debug)]
struct FlowState {
    buf: Vec<u8>,
    last_seen: Instant,
}

/// Single-owner table of partially received ClientHellos
#[derive(Debug)]
pub struct FlowTable {
    flows: HashMap<FlowKey, FlowState>,
    cap: usize,
    ttl: Duration,
}

/// Outcome of looking for a Server Name in a byte buffer
enum Scan {
    Found(String),
    Encrypted,
    Pending,
}

fn scan(buf: &[u8]) -> Scan {
    match tls::parse_client_hello(buf) {
        Some(hello) => match hello.server_name(buf) {
            Some(name) => Scan::Found(name.to_owned()),
            // The extension list is complete and still has no SNI
            None if hello.ech && extensions_complete(buf, &hello) => Scan::Encrypted,
            None => Scan::Pending,
        },
        None => Scan::Pending,
    }
}

fn extensions_complete(buf: &[u8], hello: &tls::ClientHello) -> bool {
    let at = hello.extensions_start;
    match buf.get(at..at + 2) {
        Some(len) => buf.len() >= at + 2 + usize::from(u16::from_be_bytes([len[0], len[1]])),
        None => false,
    }
}

fn starts_handshake(chunk: &[u8]) -> bool {
    chunk.first() == Some(&CONTENT_HANDSHAKE) && chunk.get(1).map_or(true, |&v| v == 0x03)
}

impl FlowTable {
    /// Table with the default cap and TTL
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_BUFFER_CAP, DEFAULT_TTL)
    }

    /// Table with custom limits
    pub fn with_limits(cap: usize, ttl: Duration) -> Self {
        Self {
            flows: HashMap::new(),
            cap,
            ttl,
        }
    }

    /// Feed the next payload chunk of a flow.
    ///
    /// Returns the Server Name once it can be extracted; the flow entry is
    /// dropped at that point. A chunk that completes a ClientHello on its
    /// own never allocates an entry. Bytes beyond the cap are discarded.
    pub fn feed(&mut self, key: FlowKey, chunk: &[u8], now: Instant) -> Option<String> {
        if chunk.is_empty() {
            return None;
        }

        if let Some(state) = self.flows.get_mut(&key) {
            let room = self.cap.saturating_sub(state.buf.len());
            state.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
            state.last_seen = now;
            return match scan(&state.buf) {
                Scan::Found(name) => {
                    self.flows.remove(&key);
                    Some(name)
                }
                Scan::Encrypted => {
                    trace!(?key, "ECH without SNI, giving up on flow");
                    self.flows.remove(&key);
                    None
                }
                Scan::Pending => None,
            };
        }

        match scan(chunk) {
            Scan::Found(name) => Some(name),
            Scan::Encrypted => None,
            Scan::Pending if starts_handshake(chunk) => {
                let mut buf = Vec::with_capacity(self.cap.min(chunk.len() * 2));
                buf.extend_from_slice(&chunk[..chunk.len().min(self.cap)]);
                trace!(?key, bytes = buf.len(), "buffering partial ClientHello");
                self.flows.insert(
                    key,
                    FlowState {
                        buf,
                        last_seen: now,
                    },
                );
                None
            }
            Scan::Pending => None,
        }
    }

    /// Drop entries idle for longer than the TTL. Returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.flows.len();
        let ttl = self.ttl;
        self.flows
            .retain(|_, state| now.saturating_duration_since(state.last_seen) < ttl);
        before - self.flows.len()
    }

    /// Forget a flow
    pub fn remove(&mut self, key: &FlowKey) {
        self.flows.remove(key);
    }

    /// Number of buffered flows
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// True if nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

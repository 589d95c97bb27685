//! Platform-agnostic traits for packet interception
//!
//! The worker pool only needs a source of intercepted packets that accepts
//! a verdict for each one. NFQUEUE implements it on Linux; tests use an
//! in-memory queue.

use crate::Result;
use dpishift_core::Verdict;

/// Kernel packet queue interface
pub trait PacketQueue: Send {
    /// One intercepted packet, exposing its IP bytes
    type Packet: AsRef<[u8]>;

    /// Queue number
    fn number(&self) -> u16;

    /// Receive the next packet, or `None` if nothing is pending.
    ///
    /// Must not block.
    fn recv(&mut self) -> Result<Option<Self::Packet>>;

    /// Settle a packet previously returned by [`recv`](Self::recv)
    fn verdict(&mut self, packet: Self::Packet, verdict: Verdict) -> Result<()>;
}

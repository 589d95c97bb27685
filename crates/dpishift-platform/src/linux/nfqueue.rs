//! NFQUEUE packet queue
//!
//! Safe wrapper around one bound netfilter queue using the `nfq` crate.
//! The netlink socket is switched to non-blocking mode so a worker thread
//! can notice shutdown between packets.

use crate::error::{PlatformError, Result};
use crate::traits::PacketQueue;
use dpishift_core::Verdict;
use std::io::ErrorKind;
use tracing::info;

/// A packet held by the kernel until its verdict is issued
pub struct NfPacket(nfq::Message);

impl AsRef<[u8]> for NfPacket {
    fn as_ref(&self) -> &[u8] {
        self.0.get_payload()
    }
}

/// One bound NFQUEUE
///
/// # Example
///
/// ```rust,ignore
/// use dpishift_platform::linux::NfQueue;
/// use dpishift_platform::PacketQueue;
///
/// let mut queue = NfQueue::open(537)?;
/// while let Some(packet) = queue.recv()? {
///     queue.verdict(packet, dpishift_core::Verdict::Accept)?;
/// }
/// ```
pub struct NfQueue {
    queue: nfq::Queue,
    number: u16,
}

impl NfQueue {
    /// Open the netlink socket and bind queue `number`.
    ///
    /// Fails open: if the queue overflows the kernel accepts packets
    /// instead of dropping them.
    ///
    /// # Errors
    /// Returns [`PlatformError::PermissionDenied`] without `CAP_NET_ADMIN`.
    pub fn open(number: u16) -> Result<Self> {
        let mut queue = nfq::Queue::open().map_err(|e| PlatformError::queue_bind(number, e))?;
        queue
            .bind(number)
            .map_err(|e| PlatformError::queue_bind(number, e))?;
        queue
            .set_fail_open(number, true)
            .map_err(|e| PlatformError::queue_bind(number, e))?;
        queue.set_nonblocking(true);
        info!(queue = number, "NFQUEUE bound");
        Ok(Self { queue, number })
    }
}

impl PacketQueue for NfQueue {
    type Packet = NfPacket;

    fn number(&self) -> u16 {
        self.number
    }

    fn recv(&mut self) -> Result<Option<NfPacket>> {
        match self.queue.recv() {
            Ok(msg) => Ok(Some(NfPacket(msg))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(None)
            }
            Err(source) => Err(PlatformError::Recv {
                queue: self.number,
                source,
            }),
        }
    }

    fn verdict(&mut self, packet: NfPacket, verdict: Verdict) -> Result<()> {
        let NfPacket(mut msg) = packet;
        match verdict {
            Verdict::Accept => msg.set_verdict(nfq::Verdict::Accept),
            Verdict::Drop => msg.set_verdict(nfq::Verdict::Drop),
            Verdict::Replace(bytes) => {
                msg.set_payload(bytes);
                msg.set_verdict(nfq::Verdict::Accept);
            }
        }
        self.queue.verdict(msg).map_err(|source| PlatformError::Verdict {
            queue: self.number,
            source,
        })
    }
}

impl std::fmt::Debug for NfQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NfQueue")
            .field("number", &self.number)
            .finish_non_exhaustive()
    }
}

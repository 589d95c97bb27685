//! Linux platform implementation

mod nfqueue;
mod raw_socket;

pub use nfqueue::{NfPacket, NfQueue};
pub use raw_socket::RawSender;

//! Connection tracking
//!
//! Remembers which rule set an outbound flow was rewritten under so the
//! later packets of the same 5-tuple, in either direction, can be handled
//! without re-matching.

mod dns;
mod tracker;

pub use dns::DnsNat;
pub use tracker::{ConnInfo, ConnTracker, IncomingAction, Tracked};

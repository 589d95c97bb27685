//! dpishift Platform Layer
//!
//! Packet interception and injection for the engine in `dpishift-core`.
//!
//! ## Supported Platforms
//!
//! - **Linux**: NFQUEUE for interception, `IPPROTO_RAW` sockets with
//!   `SO_MARK` for injection
//!
//! The [`WorkerPool`] itself only depends on [`PacketQueue`], so it runs
//! against any queue implementation.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
pub use error::{PlatformError, Result};

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::{NfQueue, RawSender};

// Platform-agnostic traits
mod traits;
pub use traits::PacketQueue;

mod pool;
pub use pool::{serve, WorkerPool};

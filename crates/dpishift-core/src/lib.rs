//! # dpishift Core
//!
//! Platform-independent core of the dpishift DPI evasion engine.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Packet parsing and construction** - bounds-checked views, checksums,
//!   segment builders
//! - **Protocol extractors** - Server Name from TLS ClientHellos, QUIC
//!   Initials and DNS queries
//! - **Rule matching** - domain, CIDR and port lookups over rule sets,
//!   swappable at runtime
//! - **Flow reassembly and connection tracking** - per-flow state between
//!   packets
//! - **Evasion strategies** - pure builders of packet plans, and their
//!   executor
//! - **Engine** - per-queue workers tying the above together
//!
//! ## Example
//!
//! ```rust,no_run
//! use dpishift_core::{Config, Engine, Verdict};
//! # use dpishift_core::strategies::PacketSender;
//! # struct Null;
//! # impl PacketSender for Null {
//! #     fn send(&self, _: &[u8], _: std::net::IpAddr) -> dpishift_core::Result<()> { Ok(()) }
//! # }
//! # fn main() -> dpishift_core::Result<()> {
//! # let runtime = tokio::runtime::Runtime::new()?;
//! # let packet: Vec<u8> = Vec::new();
//! let config = Config::load("config.toml")?;
//! let engine = Engine::new(&config, std::sync::Arc::new(Null))?;
//! let mut worker = engine.worker(config.engine.queue_start);
//!
//! // For every packet the kernel hands over:
//! match worker.handle(&packet, runtime.handle()) {
//!     Verdict::Accept => { /* accept */ }
//!     Verdict::Drop => { /* drop, the plan is already running */ }
//!     Verdict::Replace(_rewritten) => { /* accept with new payload */ }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod conntrack;
pub mod engine;
pub mod error;
pub mod flow;
pub mod matcher;
pub mod packet;
pub mod sni;
pub mod strategies;

// Re-exports for convenience
pub use config::{Config, EngineConfig, FragStrategy, RuleSet};
pub use conntrack::{ConnTracker, DnsNat};
pub use engine::{Decision, Engine, SweepReport, Verdict, Worker, WorkerStats};
pub use error::{Error, Result};
pub use flow::FlowTable;
pub use matcher::{MatcherHandle, SuffixSet};
pub use packet::{FlowKey, PacketInfo};
pub use strategies::{Emission, EmissionKind, PacketSender, Plan};

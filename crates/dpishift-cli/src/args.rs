//! Command-line argument parsing

use crate::commands::Command;
use clap::{Parser, ValueEnum};

/// dpishift - DPI evasion engine
///
/// Rewrites the first packets of TLS and QUIC connections, delivered through
/// NFQUEUE, so that passive DPI cannot classify them.
#[derive(Parser, Debug)]
#[command(name = "dpishift")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format for logs
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Log file path
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<String>,

    /// Run in quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text
    Text,
    /// JSON format
    Json,
    /// Compact format
    Compact,
}

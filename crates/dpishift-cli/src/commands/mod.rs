//! CLI commands

pub mod check;
pub mod config;
pub mod run;

use clap::Subcommand;

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the NFQUEUE range (main command)
    Run(run::RunArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show which rule set a hostname or address matches
    Check(check::CheckArgs),
}

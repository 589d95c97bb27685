//! dpishift CLI
//!
//! Command-line interface for the NFQUEUE DPI evasion engine.

mod args;
mod commands;
mod logging;
mod reload;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use args::Args;

fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(&args)?;

    let result = run(args);

    if let Err(ref e) = result {
        error!("Fatal error: {:#}", e);
    }

    result
}

fn run(args: Args) -> Result<()> {
    match args.command {
        commands::Command::Run(run_args) => commands::run::execute(run_args),
        commands::Command::Config(config_args) => commands::config::execute(config_args),
        commands::Command::Check(check_args) => commands::check::execute(check_args),
    }
}

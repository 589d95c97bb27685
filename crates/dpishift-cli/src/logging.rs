//! Logging initialization

use anyhow::{Context, Result};
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::args::{Args, LogFormat};

/// Initialize logging based on CLI arguments
pub fn init(args: &Args) -> Result<()> {
    let level = if args.quiet {
        Level::ERROR
    } else {
        match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    // RUST_LOG wins over -v
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let file = args
        .log_file
        .as_ref()
        .map(|path| {
            std::fs::File::create(path).with_context(|| format!("Failed to create log file: {path}"))
        })
        .transpose()?;

    match args.log_format {
        LogFormat::Text => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .with_target(args.verbose >= 2)
                    .with_thread_names(args.verbose >= 2)
                    .with_file(args.verbose >= 3)
                    .with_line_number(args.verbose >= 3),
            );
            match file {
                Some(file) => subscriber
                    .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                    .init(),
                None => subscriber.init(),
            }
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json());
            match file {
                Some(file) => subscriber
                    .with(fmt::layer().json().with_writer(Mutex::new(file)))
                    .init(),
                None => subscriber.init(),
            }
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact())
                .init();
        }
    }

    Ok(())
}

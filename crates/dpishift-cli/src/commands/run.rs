//! Run command - serve the NFQUEUE range

use anyhow::{Context, Result};
use clap::Args;
use dpishift_core::config::Config;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::config::{find_config_file, load};

/// How often the main thread checks for shutdown and config changes
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Run command arguments
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Configuration file (default: search the standard locations)
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// First NFQUEUE number
    #[arg(long, value_name = "NUM")]
    pub queue: Option<u16>,

    /// Number of queues / worker threads
    #[arg(long, value_name = "N")]
    pub threads: Option<u16>,

    /// Firewall mark for injected packets (decimal or 0x-prefixed hex)
    #[arg(long, value_name = "MARK", value_parser = parse_mark)]
    pub mark: Option<u32>,

    /// Do not reload rule sets when the config file changes
    #[arg(long)]
    pub no_reload: bool,

    /// Validate the configuration and exit without binding queues
    #[arg(long)]
    pub dry_run: bool,
}

fn parse_mark(s: &str) -> std::result::Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid mark '{s}': {e}"))
}

/// Execute the run command
pub fn execute(args: RunArgs) -> Result<()> {
    info!("Starting dpishift...");

    let path = args.config.clone().or_else(find_config_file);
    let config = load_config(&args, path.as_deref())?;
    info!(
        sets = config.active_sets().count(),
        queues = ?config.engine.queues(),
        mark = format_args!("{:#x}", config.engine.mark),
        "Loaded configuration"
    );

    if args.dry_run {
        warn!("Dry run mode - queues will not be bound");
        info!("Configuration validated successfully");
        return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("dpishift-rt")
        .build()
        .context("Failed to start async runtime")?;

    let watch_path = path.filter(|_| !args.no_reload);
    serve(&config, watch_path, &runtime, &running)?;

    runtime.shutdown_timeout(Duration::from_secs(1));
    info!("dpishift stopped");
    Ok(())
}

/// Load the file if there is one, then apply command-line overrides
fn load_config(args: &RunArgs, path: Option<&std::path::Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load(path)?,
        None => {
            warn!("No configuration file found, running with defaults and no rule sets");
            Config::default()
        }
    };

    if let Some(queue) = args.queue {
        config.engine.queue_start = queue;
    }
    if let Some(threads) = args.threads {
        config.engine.threads = threads;
    }
    if let Some(mark) = args.mark {
        config.engine.mark = mark;
    }

    config
        .validate()
        .context("Configuration validation failed")?;
    Ok(config)
}

#[cfg(target_os = "linux")]
fn serve(
    config: &Config,
    watch_path: Option<PathBuf>,
    runtime: &tokio::runtime::Runtime,
    running: &AtomicBool,
) -> Result<()> {
    use crate::reload::ConfigWatcher;
    use dpishift_core::Engine;
    use dpishift_platform::{RawSender, WorkerPool};

    let sender = RawSender::open(config.engine.mark).context("Failed to open raw sockets")?;
    let engine = Engine::new(config, Arc::new(sender)).context("Failed to build engine")?;
    let pool = WorkerPool::start(&engine, runtime.handle()).context("Failed to bind NFQUEUE")?;

    let mut watcher = watch_path.map(|path| {
        info!(path = %path.display(), "Watching configuration for rule set changes");
        ConfigWatcher::new(path, config.engine.clone())
    });

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(POLL_INTERVAL);
        let Some(sets) = watcher.as_mut().and_then(ConfigWatcher::poll) else {
            continue;
        };
        match engine.replace_rule_sets(&sets) {
            Ok(()) => info!(sets = sets.len(), "Rule sets reloaded"),
            Err(e) => warn!(error = %e, "Reload rejected, keeping current rule sets"),
        }
    }

    let stats = pool.shutdown();
    let packets: u64 = stats.iter().map(|(_, s)| s.packets).sum();
    let rewritten: u64 = stats.iter().map(|(_, s)| s.rewritten).sum();
    info!(packets, rewritten, "Worker pool stopped");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn serve(
    _config: &Config,
    _watch_path: Option<PathBuf>,
    _runtime: &tokio::runtime::Runtime,
    _running: &AtomicBool,
) -> Result<()> {
    anyhow::bail!("NFQUEUE interception is only available on Linux")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(config: Option<PathBuf>) -> RunArgs {
        RunArgs {
            config,
            queue: None,
            threads: None,
            mark: None,
            no_reload: false,
            dry_run: true,
        }
    }

    #[test]
    fn test_parse_mark() {
        assert_eq!(parse_mark("32768"), Ok(32768));
        assert_eq!(parse_mark("0x8000"), Ok(0x8000));
        assert_eq!(parse_mark("0XfF"), Ok(0xff));
        assert!(parse_mark("0xzz").is_err());
        assert!(parse_mark("-1").is_err());
    }

    #[test]
    fn test_overrides_applied() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nqueue_start = 100\nthreads = 8").unwrap();

        let mut run = args(Some(file.path().to_path_buf()));
        run.threads = Some(2);
        run.mark = Some(0x10);
        let config = load_config(&run, run.config.as_deref()).unwrap();
        assert_eq!(config.engine.queue_start, 100);
        assert_eq!(config.engine.threads, 2);
        assert_eq!(config.engine.mark, 0x10);
    }

    #[test]
    fn test_override_validated() {
        let mut run = args(None);
        run.mark = Some(0);
        assert!(load_config(&run, None).is_err());
    }

    #[test]
    fn test_dry_run_succeeds() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[sets]]\nid = \"a\"").unwrap();
        assert!(execute(args(Some(file.path().to_path_buf()))).is_ok());
    }
}

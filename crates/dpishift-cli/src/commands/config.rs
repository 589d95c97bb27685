//! Config command - configuration management

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use dpishift_core::config::{Config, FragStrategy, RuleSet};
use std::path::{Path, PathBuf};
use tracing::info;

/// System-wide configuration file
const SYSTEM_CONFIG: &str = "/etc/dpishift/config.toml";

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show {
        /// Config file to show (default: detect, else built-in defaults)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Generate a starter configuration file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "dpishift.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Config file to validate
        file: PathBuf,
    },

    /// Show config file locations
    Paths,
}

/// Execute config command
pub fn execute(args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Show { file } => show_config(file),
        ConfigAction::Generate { output } => generate_config(&output),
        ConfigAction::Validate { file } => validate_config(&file),
        ConfigAction::Paths => {
            show_paths();
            Ok(())
        }
    }
}

/// Load and validate a configuration file
pub fn load(path: &Path) -> Result<Config> {
    let config = Config::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn show_config(file: Option<PathBuf>) -> Result<()> {
    let config = match file.or_else(find_config_file) {
        Some(path) => load(&path)?,
        None => Config::default(),
    };
    let toml_str = config.to_toml().context("Failed to serialize config")?;
    println!("{toml_str}");
    Ok(())
}

/// Defaults plus one example rule set
fn starter_config() -> Config {
    let mut set = RuleSet::for_domains("example", &["example.com", "example.org"]);
    set.name = "Example rule set".to_string();
    set.fragmentation.strategy = FragStrategy::Combo;
    Config {
        sets: vec![set],
        ..Config::default()
    }
}

fn generate_config(output: &Path) -> Result<()> {
    let toml_str = starter_config()
        .to_toml()
        .context("Failed to serialize config")?;
    let content = format!(
        "# dpishift configuration\n\
         # [engine] holds runtime settings; each [[sets]] entry is a rule set.\n\
         # Rule sets are matched in order, the first claim wins.\n\n\
         {toml_str}"
    );

    std::fs::write(output, content)
        .with_context(|| format!("Failed to write config to {}", output.display()))?;

    info!(path = %output.display(), "Generated config file");
    println!("Configuration file generated: {}", output.display());
    Ok(())
}

fn validate_config(file: &Path) -> Result<()> {
    let config = load(file)?;

    println!("{} Configuration is valid", "✓".green());
    println!("  Queues: {:?}", config.engine.queues());
    println!("  Mark: {:#x}", config.engine.mark);
    println!("  Rule sets: {}", config.sets.len());
    for set in &config.sets {
        let state = if set.enabled {
            "enabled".green()
        } else {
            "disabled".yellow()
        };
        println!(
            "    {} [{}] {} domains, {} networks, strategy {}",
            set.id,
            state,
            set.targets.sni_domains.len(),
            set.targets.ip.len(),
            set.fragmentation.strategy.as_str()
        );
    }
    Ok(())
}

fn show_paths() {
    println!("Configuration file search paths:");
    println!();
    for (i, path) in search_paths().iter().enumerate() {
        println!("  {}. {}", i + 1, path.display());
    }
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("dpishift.toml"), PathBuf::from("config.toml")];
    if let Some(dirs) = directories::ProjectDirs::from("", "", "dpishift") {
        paths.push(dirs.config_dir().join("config.toml"));
    }
    paths.push(PathBuf::from(SYSTEM_CONFIG));
    paths
}

/// First existing file among the search paths
pub fn find_config_file() -> Option<PathBuf> {
    search_paths().into_iter().find(|path| path.exists())
}

//! Configuration management for dpishift
//!
//! A TOML file with one `[engine]` table and any number of `[[sets]]`
//! rule sets. Everything has a default, so an empty file is a valid
//! (if useless) configuration.

mod rules;

pub use rules::*;

use crate::error::{Error, Result};
use crate::matcher::SuffixSet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine runtime settings
    pub engine: EngineConfig,
    /// Rule sets, in priority order (first claim wins)
    pub sets: Vec<RuleSet>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| Error::ConfigNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(Error::from)
    }

    /// Validate the configuration.
    ///
    /// Also compiles the matcher once so bad CIDRs and regexes surface at
    /// load time instead of being skipped at runtime.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;

        let mut ids = HashSet::new();
        for set in &self.sets {
            if !ids.insert(set.id.as_str()) {
                return Err(Error::config_value(
                    "sets.id",
                    format!("duplicate rule set id '{}'", set.id),
                ));
            }
            set.validate()?;
        }

        SuffixSet::build(&self.sets, self.engine.cache_capacity)?;
        Ok(())
    }

    /// Serialize to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Enabled rule sets
    pub fn active_sets(&self) -> impl Iterator<Item = &RuleSet> {
        self.sets.iter().filter(|s| s.enabled)
    }
}

/// Engine runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// First NFQUEUE number
    pub queue_start: u16,
    /// Worker count; queues `queue_start..queue_start + threads`
    pub threads: u16,
    /// SO_MARK put on injected packets so the firewall skips them
    pub mark: u32,
    /// Link MTU that mutated packets must fit
    pub mtu: usize,
    /// Per-flow reassembly cap in bytes
    pub flow_buffer_cap: usize,
    /// Flow reassembly entry lifetime
    pub flow_ttl_secs: u64,
    /// Connection tracker idle lifetime
    pub conn_ttl_secs: u64,
    /// Interval of the conntrack / DNS NAT sweep task
    pub sweep_interval_secs: u64,
    /// Capacity of each matcher cache
    pub cache_capacity: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_start: 537,
            threads: 4,
            mark: 0x8000,
            mtu: 1500,
            flow_buffer_cap: 8 * 1024,
            flow_ttl_secs: 10,
            conn_ttl_secs: 120,
            sweep_interval_secs: 5,
            cache_capacity: 2000,
        }
    }
}

impl EngineConfig {
    /// Validate value ranges
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::config_value("engine.threads", "must be at least 1"));
        }
        if u32::from(self.queue_start) + u32::from(self.threads) > u32::from(u16::MAX) + 1 {
            return Err(Error::config_value(
                "engine.queue_start",
                "queue range exceeds 65535",
            ));
        }
        if self.mark == 0 {
            return Err(Error::config_value(
                "engine.mark",
                "must be non-zero, injected packets would loop back into the queue",
            ));
        }
        if !(576..=9000).contains(&self.mtu) {
            return Err(Error::config_value("engine.mtu", "must be between 576 and 9000"));
        }
        if self.flow_buffer_cap < 512 {
            return Err(Error::config_value(
                "engine.flow_buffer_cap",
                "must be at least 512 bytes",
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::config_value(
                "engine.sweep_interval_secs",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Flow reassembly TTL
    pub fn flow_ttl(&self) -> Duration {
        Duration::from_secs(self.flow_ttl_secs)
    }

    /// Connection tracker TTL
    pub fn conn_ttl(&self) -> Duration {
        Duration::from_secs(self.conn_ttl_secs)
    }

    /// Sweep task interval
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// NFQUEUE numbers served by the pool
    pub fn queues(&self) -> std::ops::Range<u16> {
        let end = u32::from(self.queue_start) + u32::from(self.threads);
        self.queue_start..u16::try_from(end).unwrap_or(u16::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========== Default Config Tests ===========

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.sets.is_empty());
        assert_eq!(config.engine.mark, 0x8000);
        assert_eq!(config.engine.flow_buffer_cap, 8192);
        assert_eq!(config.engine.cache_capacity, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_queue_range() {
        let engine = EngineConfig {
            queue_start: 100,
            threads: 3,
            ..EngineConfig::default()
        };
        assert_eq!(engine.queues().collect::<Vec<_>>(), vec![100, 101, 102]);
    }

    // =========== Validation Tests ===========

    #[test]
    fn test_validation_engine() {
        let mut config = Config::default();
        config.engine.threads = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.mark = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.mtu = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_duplicate_ids() {
        let config = Config {
            sets: vec![
                RuleSet::for_domains("a", &["x.com"]),
                RuleSet::for_domains("a", &["y.com"]),
            ],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_bad_cidr() {
        let mut set = RuleSet::for_domains("a", &[]);
        set.targets.ip.push("10.0.0.0/33".to_string());
        let config = Config {
            sets: vec![set],
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidCidr { .. })
        ));
    }

    // =========== TOML Tests ===========

    #[test]
    fn test_toml_roundtrip() {
        let config = Config {
            sets: vec![RuleSet::for_domains("yt", &["youtube.com", "regexp:^rr\\d+"])],
            ..Config::default()
        };
        let toml_str = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_toml_parse_minimal() {
        let config = Config::from_toml(
            r#"
            [engine]
            queue_start = 200
            threads = 2

            [[sets]]
            id = "yt"
            name = "YouTube"
            [sets.targets]
            sni_domains = ["youtube.com", "googlevideo.com"]
            ip = ["142.250.0.0/15"]
            [sets.fragmentation]
            strategy = "combo"
            [sets.fragmentation.combo]
            shuffle = "reverse"
            [sets.tcp.desync]
            mode = "full"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.queue_start, 200);
        assert_eq!(config.engine.mark, 0x8000);
        assert_eq!(config.sets.len(), 1);
        let set = &config.sets[0];
        assert_eq!(set.fragmentation.strategy, FragStrategy::Combo);
        assert_eq!(set.fragmentation.combo.shuffle, ShuffleMode::Reverse);
        assert_eq!(set.tcp.desync.mode, DesyncMode::Full);
        assert!(set.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parse_invalid() {
        assert!(Config::from_toml("[engine\nthreads = ").is_err());
        assert!(Config::from_toml("[engine]\nthreads = \"four\"").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/dpishift.toml"),
            Err(Error::ConfigNotFound { .. })
        ));
    }
}

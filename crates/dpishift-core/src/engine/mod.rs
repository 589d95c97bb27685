//! The packet engine
//!
//! [`Engine`] owns the state shared by every worker: the live matcher, the
//! connection tracker, the DNS NAT table and the raw sender. Each kernel
//! queue gets its own [`Worker`], which adds a private flow table and turns
//! intercepted packets into verdicts and plans.

mod worker;

pub use worker::{Decision, Verdict, Worker, WorkerStats};

use crate::config::{Config, EngineConfig, RuleSet};
use crate::conntrack::{ConnTracker, DnsNat};
use crate::error::Result;
use crate::matcher::MatcherHandle;
use crate::strategies::PacketSender;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

struct Shared {
    config: EngineConfig,
    matcher: MatcherHandle,
    conntrack: ConnTracker,
    dns_nat: DnsNat,
    sender: Arc<dyn PacketSender>,
}

/// Entries removed by one [`Engine::sweep`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle connections dropped from the tracker
    pub connections: usize,
    /// Expired DNS redirects
    pub dns: usize,
}

/// Shared engine state. Cloning is cheap; clones see the same state.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Build an engine from a validated configuration
    ///
    /// # Arguments
    /// * `config` - engine options and the initial rule sets
    /// * `sender` - where plans are injected
    pub fn new(config: &Config, sender: Arc<dyn PacketSender>) -> Result<Self> {
        config.validate()?;
        let engine = &config.engine;
        let matcher = MatcherHandle::from_rule_sets(&config.sets, engine.cache_capacity)?;
        info!(
            sets = matcher.load().sets().len(),
            queues = ?engine.queues(),
            "engine ready"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                config: engine.clone(),
                matcher,
                conntrack: ConnTracker::with_ttl(engine.conn_ttl()),
                dns_nat: DnsNat::new(),
                sender,
            }),
        })
    }

    /// A worker for one queue, with its own flow table
    pub fn worker(&self, queue: u16) -> Worker {
        Worker::new(queue, Arc::clone(&self.shared))
    }

    /// Atomically install a new rule set list.
    ///
    /// In-flight lookups finish on the old matcher. Flows already being
    /// tracked keep the rule set they were registered with.
    pub fn replace_rule_sets(&self, sets: &[RuleSet]) -> Result<()> {
        for set in sets {
            set.validate()?;
        }
        self.shared.matcher.replace(sets)
    }

    /// Expire idle connections and stale DNS redirects
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let report = SweepReport {
            connections: self.shared.conntrack.sweep(now),
            dns: self.shared.dns_nat.sweep(now),
        };
        if report != SweepReport::default() {
            debug!(
                connections = report.connections,
                dns = report.dns,
                "swept shared state"
            );
        }
        report
    }

    /// Engine options
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Live matcher handle
    pub fn matcher(&self) -> &MatcherHandle {
        &self.shared.matcher
    }

    /// Connection tracker
    pub fn conntrack(&self) -> &ConnTracker {
        &self.shared.conntrack
    }

    /// DNS redirect table
    pub fn dns_nat(&self) -> &DnsNat {
        &self.shared.dns_nat
    }

    /// Raw sender plans are injected through
    pub fn sender(&self) -> Arc<dyn PacketSender> {
        Arc::clone(&self.shared.sender)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.shared.config)
            .field("connections", &self.shared.conntrack.len())
            .field("dns_redirects", &self.shared.dns_nat.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::MockPacketSender;

    fn engine(sets: Vec<RuleSet>) -> Engine {
        let config = Config {
            sets,
            ..Config::default()
        };
        Engine::new(&config, Arc::new(MockPacketSender::new())).unwrap()
    }

    #[test]
    fn test_new_builds_matcher() {
        let e = engine(vec![RuleSet::for_domains("a", &["example.com"])]);
        assert!(e.matcher().load().match_sni("www.example.com").is_some());
        assert!(e.conntrack().is_empty());
    }

    #[test]
    fn test_replace_rule_sets() {
        let e = engine(vec![RuleSet::for_domains("a", &["old.com"])]);
        e.replace_rule_sets(&[RuleSet::for_domains("b", &["new.com"])])
            .unwrap();
        let m = e.matcher().load();
        assert!(m.match_sni("old.com").is_none());
        assert_eq!(m.match_sni("new.com").unwrap().id, "b");
    }

    #[test]
    fn test_replace_rejects_invalid_and_keeps_old() {
        let e = engine(vec![RuleSet::for_domains("a", &["old.com"])]);
        let mut bad = RuleSet::for_domains("b", &[]);
        bad.targets.ip = vec!["not-a-network".to_string()];
        assert!(e.replace_rule_sets(&[bad]).is_err());
        assert!(e.matcher().load().match_sni("old.com").is_some());
    }

    #[test]
    fn test_sweep_empty() {
        let e = engine(Vec::new());
        assert_eq!(e.sweep(Instant::now()), SweepReport::default());
    }
}

//! Atomically swappable matcher generation

use super::SuffixSet;
use crate::config::RuleSet;
use crate::error::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

/// Shared handle to the live matcher.
///
/// Workers `load()` a generation per packet; `replace()` publishes a new
/// one without blocking them. In-flight lookups finish on the generation
/// they loaded.
#[derive(Debug)]
pub struct MatcherHandle {
    current: ArcSwap<SuffixSet>,
    cache_capacity: u64,
}

impl MatcherHandle {
    /// Wrap an already built matcher
    pub fn new(matcher: SuffixSet, cache_capacity: u64) -> Self {
        Self {
            current: ArcSwap::from_pointee(matcher),
            cache_capacity,
        }
    }

    /// Build from rule sets
    pub fn from_rule_sets(sets: &[RuleSet], cache_capacity: u64) -> Result<Self> {
        Ok(Self::new(SuffixSet::build(sets, cache_capacity)?, cache_capacity))
    }

    /// Current generation
    pub fn load(&self) -> Arc<SuffixSet> {
        self.current.load_full()
    }

    /// Build and publish a new generation. On error the old one stays live.
    pub fn replace(&self, sets: &[RuleSet]) -> Result<()> {
        let next = SuffixSet::build(sets, self.cache_capacity)?;
        let count = next.sets().len();
        self.current.store(Arc::new(next));
        info!(sets = count, "rule sets replaced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_swaps_generation() {
        let handle =
            MatcherHandle::from_rule_sets(&[RuleSet::for_domains("a", &["old.com"])], 10).unwrap();
        let before = handle.load();
        assert!(before.match_sni("old.com").is_some());

        handle
            .replace(&[RuleSet::for_domains("b", &["new.com"])])
            .unwrap();
        let after = handle.load();
        assert!(after.match_sni("old.com").is_none());
        assert_eq!(after.match_sni("new.com").unwrap().id, "b");

        // Readers holding the old generation are unaffected
        assert!(before.match_sni("old.com").is_some());
    }

    #[test]
    fn test_failed_replace_keeps_old() {
        let handle =
            MatcherHandle::from_rule_sets(&[RuleSet::for_domains("a", &["old.com"])], 10).unwrap();
        let mut bad = RuleSet::for_domains("b", &[]);
        bad.targets.ip.push("not-a-cidr".into());
        assert!(handle.replace(&[bad]).is_err());
        assert!(handle.load().match_sni("old.com").is_some());
    }
}

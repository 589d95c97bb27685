//! Rule matcher
//!
//! Resolves a Server Name, destination address or UDP port to at most one
//! [`RuleSet`]. A [`SuffixSet`] is built once per configuration generation
//! and is read-only afterwards; [`MatcherHandle`] swaps whole generations
//! atomically.

mod handle;
mod trie;

pub use handle::MatcherHandle;
pub use trie::PrefixTrie;

use crate::config::{parse_port_range, RuleSet};
use crate::error::{Error, Result};
use ipnet::IpNet;
use moka::sync::Cache;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Prefix marking a regular expression in a domain list
pub const REGEX_PREFIX: &str = "regexp:";

/// Cached lookup outcome; `None` is a cached negative
type Cached = Option<Arc<RuleSet>>;

/// Compiled matcher over a list of rule sets
pub struct SuffixSet {
    sets: Vec<Arc<RuleSet>>,
    domains: HashMap<String, usize>,
    regexes: Vec<(Regex, usize)>,
    v4: PrefixTrie,
    v6: PrefixTrie,
    ports: Vec<(u16, u16, usize)>,
    domain_cache: Cache<String, Cached>,
    regex_cache: Cache<String, Cached>,
    ip_cache: Cache<IpAddr, Cached>,
}

impl std::fmt::Debug for SuffixSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuffixSet")
            .field("sets", &self.sets.len())
            .field("domains", &self.domains.len())
            .field("regexes", &self.regexes.len())
            .field("ports", &self.ports.len())
            .finish_non_exhaustive()
    }
}

fn normalize_domain(raw: &str) -> String {
    let d = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    let d = d.strip_prefix("*.").unwrap_or(&d);
    d.strip_prefix('.').unwrap_or(d).to_string()
}

fn parse_net(raw: &str) -> Result<IpNet> {
    let raw = raw.trim();
    raw.parse::<IpNet>()
        .or_else(|_| raw.parse::<IpAddr>().map(IpNet::from))
        .map_err(|e| Error::InvalidCidr {
            cidr: raw.to_string(),
            reason: e.to_string(),
        })
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        v4 @ IpAddr::V4(_) => v4,
    }
}

impl SuffixSet {
    /// An empty matcher
    pub fn empty() -> Self {
        Self::with_capacity(1)
    }

    fn with_capacity(cache_capacity: u64) -> Self {
        Self {
            sets: Vec::new(),
            domains: HashMap::new(),
            regexes: Vec::new(),
            v4: PrefixTrie::v4(),
            v6: PrefixTrie::v6(),
            ports: Vec::new(),
            domain_cache: Cache::new(cache_capacity),
            regex_cache: Cache::new(cache_capacity),
            ip_cache: Cache::new(cache_capacity),
        }
    }

    /// Compile enabled rule sets, in order. The first set claiming a
    /// domain, network or port keeps it.
    pub fn build(sets: &[RuleSet], cache_capacity: u64) -> Result<Self> {
        let mut matcher = Self::with_capacity(cache_capacity.max(1));

        for set in sets.iter().filter(|s| s.enabled) {
            let idx = matcher.sets.len();
            matcher.sets.push(Arc::new(set.clone()));

            for raw in &set.targets.sni_domains {
                if let Some(pattern) = raw.trim().strip_prefix(REGEX_PREFIX) {
                    let re = Regex::new(pattern).map_err(|e| Error::InvalidRegex {
                        pattern: pattern.to_string(),
                        reason: e.to_string(),
                    })?;
                    matcher.regexes.push((re, idx));
                    continue;
                }
                let domain = normalize_domain(raw);
                if !domain.is_empty() {
                    matcher.domains.entry(domain).or_insert(idx);
                }
            }

            for raw in &set.targets.ip {
                match parse_net(raw)? {
                    net @ IpNet::V4(_) => matcher.v4.insert(net, idx),
                    net @ IpNet::V6(_) => matcher.v6.insert(net, idx),
                }
            }

            for raw in &set.udp.dport_filter {
                let (lo, hi) = parse_port_range(raw)?;
                matcher.ports.push((lo, hi, idx));
            }
        }

        debug!(
            sets = matcher.sets.len(),
            domains = matcher.domains.len(),
            regexes = matcher.regexes.len(),
            ports = matcher.ports.len(),
            "matcher built"
        );
        Ok(matcher)
    }

    /// Rule sets this matcher was built from
    pub fn sets(&self) -> &[Arc<RuleSet>] {
        &self.sets
    }

    /// True if no rule set is active
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Any rule set has DNS redirect enabled
    pub fn has_dns_redirect(&self) -> bool {
        self.sets.iter().any(|s| s.dns.enabled)
    }

    fn suffix_lookup(&self, name: &str) -> Cached {
        let mut candidate = name;
        loop {
            if let Some(&idx) = self.domains.get(candidate) {
                return Some(Arc::clone(&self.sets[idx]));
            }
            candidate = candidate.split_once('.')?.1;
        }
    }

    fn regex_lookup(&self, name: &str) -> Cached {
        self.regexes
            .iter()
            .find(|(re, _)| re.is_match(name))
            .map(|(_, idx)| Arc::clone(&self.sets[*idx]))
    }

    /// Match a Server Name: exact, then parent domains, then regexes
    pub fn match_sni(&self, name: &str) -> Option<Arc<RuleSet>> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        if name.is_empty() {
            return None;
        }

        if !self.domains.is_empty() {
            let hit = match self.domain_cache.get(&name) {
                Some(cached) => cached,
                None => {
                    let found = self.suffix_lookup(&name);
                    self.domain_cache.insert(name.clone(), found.clone());
                    found
                }
            };
            if hit.is_some() {
                return hit;
            }
        }

        if self.regexes.is_empty() {
            return None;
        }
        match self.regex_cache.get(&name) {
            Some(cached) => cached,
            None => {
                let found = self.regex_lookup(&name);
                self.regex_cache.insert(name, found.clone());
                found
            }
        }
    }

    /// Match a destination address (longest prefix)
    pub fn match_ip(&self, ip: IpAddr) -> Option<Arc<RuleSet>> {
        if self.v4.is_empty() && self.v6.is_empty() {
            return None;
        }
        let ip = canonical_ip(ip);
        if let Some(cached) = self.ip_cache.get(&ip) {
            return cached;
        }
        let idx = match ip {
            IpAddr::V4(_) => self.v4.lookup(ip),
            IpAddr::V6(_) => self.v6.lookup(ip),
        };
        let found = idx.map(|i| Arc::clone(&self.sets[i]));
        self.ip_cache.insert(ip, found.clone());
        found
    }

    /// Match a UDP destination port
    pub fn match_udp_port(&self, port: u16) -> Option<Arc<RuleSet>> {
        self.ports
            .iter()
            .find(|(lo, hi, _)| (*lo..=*hi).contains(&port))
            .map(|(_, _, idx)| Arc::clone(&self.sets[*idx]))
    }
}

impl Default for SuffixSet {
    fn default() -> Self {
        Self::empty()
    }
}

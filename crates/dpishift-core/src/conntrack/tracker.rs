//! Shared per-flow state

use crate::config::{IncomingMode, RuleSet};
use crate::packet::{FlowKey, Protocol};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default idle lifetime of a tracked flow
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// State kept for a rewritten flow, keyed by its outbound 5-tuple
#[derive(Debug, Clone)]
pub struct ConnInfo {
    /// Rule set the flow was rewritten under
    pub rule_set: Arc<RuleSet>,
    /// Last packet in either direction
    pub last_seen: Instant,
    /// Outbound payload bytes
    pub sent_bytes: u64,
    /// Outbound packets
    pub sent_packets: u32,
    /// Inbound payload bytes
    pub received_bytes: u64,
    /// Inbound byte count that triggers the next incoming action
    pub threshold: u64,
    /// A fake RST has already been injected
    pub reset_sent: bool,
}

/// Result of an outbound lookup
#[derive(Debug, Clone)]
pub enum Tracked {
    /// Still inside the rule set's inspection budget
    Active(Arc<RuleSet>),
    /// Budget used up; pass everything through
    Exhausted,
}

/// What to inject in response to inbound data
#[derive(Debug, Clone)]
pub enum IncomingAction {
    /// Checksum-corrupted fake data toward the server
    Fake(Arc<RuleSet>),
    /// One low-TTL fake RST
    Reset(Arc<RuleSet>),
}

/// Connection tracker shared by all workers.
///
/// One mutex over one map: a flow's two directions can land on different
/// queues, and every operation here is a short map update.
#[derive(Debug)]
pub struct ConnTracker {
    conns: Mutex<HashMap<FlowKey, ConnInfo>>,
    ttl: Duration,
}

fn random_threshold(rule_set: &RuleSet) -> u64 {
    let opts = &rule_set.tcp.incoming;
    let lo = u64::from(opts.min_kb.min(opts.max_kb)) * 1024;
    let hi = u64::from(opts.max_kb.max(opts.min_kb)) * 1024;
    rand::thread_rng().gen_range(lo..=hi)
}

impl ConnTracker {
    /// Tracker with the default TTL
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Tracker with a custom idle TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Start tracking an outbound flow. An existing entry is left alone.
    pub fn register(&self, key: FlowKey, rule_set: Arc<RuleSet>, now: Instant) {
        let mut conns = self.conns.lock();
        conns.entry(key).or_insert_with(|| {
            debug!(?key, set = %rule_set.id, "tracking flow");
            ConnInfo {
                threshold: random_threshold(&rule_set),
                rule_set,
                last_seen: now,
                sent_bytes: 0,
                sent_packets: 0,
                received_bytes: 0,
                reset_sent: false,
            }
        });
    }

    /// Account an outbound packet of `bytes` payload.
    ///
    /// TCP flows stay active until `conn_bytes_limit` bytes were sent, UDP
    /// flows until `conn_packets_limit` datagrams.
    pub fn outbound(&self, key: &FlowKey, bytes: usize, now: Instant) -> Option<Tracked> {
        let mut conns = self.conns.lock();
        let info = conns.get_mut(key)?;
        info.last_seen = now;

        let tcp = &info.rule_set.tcp;
        let within = match key.protocol {
            Protocol::Udp => info.sent_packets < info.rule_set.udp.conn_packets_limit,
            _ => info.sent_bytes < tcp.conn_bytes_limit,
        };
        info.sent_bytes += bytes as u64;
        info.sent_packets = info.sent_packets.saturating_add(1);

        Some(if within {
            Tracked::Active(Arc::clone(&info.rule_set))
        } else {
            Tracked::Exhausted
        })
    }

    /// Account an inbound packet. `key` is the inbound 5-tuple.
    pub fn inbound(&self, key: &FlowKey, bytes: usize, now: Instant) -> Option<IncomingAction> {
        let mut conns = self.conns.lock();
        let info = conns.get_mut(&key.reversed())?;
        info.last_seen = now;
        info.received_bytes += bytes as u64;

        if info.received_bytes < info.threshold {
            return None;
        }
        match info.rule_set.tcp.incoming.mode {
            IncomingMode::Off => None,
            IncomingMode::Fake => {
                info.threshold = info.received_bytes + random_threshold(&info.rule_set);
                Some(IncomingAction::Fake(Arc::clone(&info.rule_set)))
            }
            IncomingMode::Reset if !info.reset_sent => {
                info.reset_sent = true;
                Some(IncomingAction::Reset(Arc::clone(&info.rule_set)))
            }
            IncomingMode::Reset => None,
        }
    }

    /// Copy of a flow's state
    pub fn get(&self, key: &FlowKey) -> Option<ConnInfo> {
        self.conns.lock().get(key).cloned()
    }

    /// Stop tracking a flow
    pub fn remove(&self, key: &FlowKey) {
        self.conns.lock().remove(key);
    }

    /// Drop flows idle longer than the TTL. Returns how many.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut conns = self.conns.lock();
        let before = conns.len();
        conns.retain(|_, info| now.saturating_duration_since(info.last_seen) < self.ttl);
        before - conns.len()
    }

    /// Number of tracked flows
    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    /// True if nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.conns.lock().is_empty()
    }
}

impl Default for ConnTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(protocol: Protocol) -> FlowKey {
        FlowKey::new(
            protocol,
            "10.0.0.1:40000".parse().unwrap(),
            "1.2.3.4:443".parse().unwrap(),
        )
    }

    fn set_with(mode: IncomingMode) -> Arc<RuleSet> {
        let mut set = RuleSet::for_domains("t", &["example.com"]);
        set.tcp.conn_bytes_limit = 100;
        set.udp.conn_packets_limit = 2;
        set.tcp.incoming.mode = mode;
        set.tcp.incoming.min_kb = 1;
        set.tcp.incoming.max_kb = 1;
        Arc::new(set)
    }

    #[test]
    fn test_untracked_flow() {
        let tracker = ConnTracker::new();
        let now = Instant::now();
        assert!(tracker.outbound(&key(Protocol::Tcp), 10, now).is_none());
        assert!(tracker.inbound(&key(Protocol::Tcp).reversed(), 10, now).is_none());
    }

    #[test]
    fn test_tcp_byte_budget() {
        let tracker = ConnTracker::new();
        let now = Instant::now();
        let k = key(Protocol::Tcp);
        tracker.register(k, set_with(IncomingMode::Off), now);

        assert!(matches!(tracker.outbound(&k, 60, now), Some(Tracked::Active(_))));
        assert!(matches!(tracker.outbound(&k, 60, now), Some(Tracked::Active(_))));
        assert!(matches!(tracker.outbound(&k, 60, now), Some(Tracked::Exhausted)));
        assert_eq!(tracker.get(&k).unwrap().sent_bytes, 180);
    }

    #[test]
    fn test_udp_packet_budget() {
        let tracker = ConnTracker::new();
        let now = Instant::now();
        let k = key(Protocol::Udp);
        tracker.register(k, set_with(IncomingMode::Off), now);

        assert!(matches!(tracker.outbound(&k, 1200, now), Some(Tracked::Active(_))));
        assert!(matches!(tracker.outbound(&k, 1200, now), Some(Tracked::Active(_))));
        assert!(matches!(tracker.outbound(&k, 1200, now), Some(Tracked::Exhausted)));
    }

    #[test]
    fn test_incoming_reset_once() {
        let tracker = ConnTracker::new();
        let now = Instant::now();
        let k = key(Protocol::Tcp);
        tracker.register(k, set_with(IncomingMode::Reset), now);
        let inbound = k.reversed();

        assert!(tracker.inbound(&inbound, 500, now).is_none());
        assert!(matches!(
            tracker.inbound(&inbound, 600, now),
            Some(IncomingAction::Reset(_))
        ));
        assert!(tracker.inbound(&inbound, 5000, now).is_none());
    }

    #[test]
    fn test_incoming_fake_rearms() {
        let tracker = ConnTracker::new();
        let now = Instant::now();
        let k = key(Protocol::Tcp);
        tracker.register(k, set_with(IncomingMode::Fake), now);
        let inbound = k.reversed();

        assert!(matches!(
            tracker.inbound(&inbound, 1024, now),
            Some(IncomingAction::Fake(_))
        ));
        assert!(tracker.inbound(&inbound, 100, now).is_none());
        assert!(matches!(
            tracker.inbound(&inbound, 1000, now),
            Some(IncomingAction::Fake(_))
        ));
    }

    #[test]
    fn test_sweep() {
        let tracker = ConnTracker::with_ttl(Duration::from_secs(120));
        let start = Instant::now();
        tracker.register(key(Protocol::Tcp), set_with(IncomingMode::Off), start);
        assert_eq!(tracker.sweep(start + Duration::from_secs(60)), 0);
        assert_eq!(tracker.sweep(start + Duration::from_secs(121)), 1);
        assert!(tracker.is_empty());
    }
}

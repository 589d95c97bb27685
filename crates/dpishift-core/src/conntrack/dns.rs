//! DNS redirect NAT
//!
//! When a query is rewritten toward another resolver, the client still
//! expects the answer from the resolver it asked. This table remembers the
//! original destination per client source port.

use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Default lifetime of a redirected query
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct NatEntry {
    original: SocketAddr,
    redirected_to: IpAddr,
    created: Instant,
}

/// Client port to original resolver mapping
#[derive(Debug)]
pub struct DnsNat {
    queries: DashMap<u16, NatEntry>,
    timeout: Duration,
}

impl DnsNat {
    /// Table with the default 5 s timeout
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TTL)
    }

    /// Table with a custom timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            queries: DashMap::new(),
            timeout,
        }
    }

    /// Record a redirected query
    ///
    /// # Arguments
    /// * `src_port` - client source port of the query
    /// * `original` - resolver the client addressed
    /// * `redirected_to` - resolver the query was rewritten to
    pub fn track_query(&self, src_port: u16, original: SocketAddr, redirected_to: IpAddr) {
        self.queries.insert(
            src_port,
            NatEntry {
                original,
                redirected_to,
                created: Instant::now(),
            },
        );
    }

    /// Original resolver for a response from `from` to `dst_port`.
    ///
    /// Only answers coming from the resolver the query was redirected to
    /// are rewritten.
    pub fn get_original(&self, dst_port: u16, from: IpAddr) -> Option<SocketAddr> {
        let entry = self.queries.get(&dst_port)?;
        if entry.created.elapsed() >= self.timeout {
            drop(entry);
            self.queries.remove(&dst_port);
            return None;
        }
        (entry.redirected_to == from).then_some(entry.original)
    }

    /// Forget a query
    pub fn remove(&self, src_port: u16) {
        self.queries.remove(&src_port);
    }

    /// Drop expired entries. Returns how many.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.queries.len();
        self.queries
            .retain(|_, entry| now.saturating_duration_since(entry.created) < self.timeout);
        before.saturating_sub(self.queries.len())
    }

    /// Number of pending queries
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// True if no query is pending
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

impl Default for DnsNat {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const ISP_DNS: &str = "192.168.1.1:53";
    const SECURE_DNS: IpAddr = IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9));

    #[test]
    fn test_track_and_get() {
        let nat = DnsNat::new();
        nat.track_query(12345, ISP_DNS.parse().unwrap(), SECURE_DNS);
        assert_eq!(
            nat.get_original(12345, SECURE_DNS),
            Some(ISP_DNS.parse().unwrap())
        );
    }

    #[test]
    fn test_foreign_responder_ignored() {
        let nat = DnsNat::new();
        nat.track_query(12345, ISP_DNS.parse().unwrap(), SECURE_DNS);
        assert_eq!(nat.get_original(12345, "8.8.8.8".parse().unwrap()), None);
    }

    #[test]
    fn test_missing_entry() {
        let nat = DnsNat::new();
        assert_eq!(nat.get_original(59999, SECURE_DNS), None);
    }

    #[test]
    fn test_expired_entry() {
        let nat = DnsNat::with_timeout(Duration::from_millis(10));
        nat.track_query(12345, ISP_DNS.parse().unwrap(), SECURE_DNS);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(nat.get_original(12345, SECURE_DNS), None);
        assert!(nat.is_empty());
    }

    #[test]
    fn test_sweep() {
        let nat = DnsNat::with_timeout(Duration::from_secs(5));
        nat.track_query(1, ISP_DNS.parse().unwrap(), SECURE_DNS);
        nat.track_query(2, ISP_DNS.parse().unwrap(), SECURE_DNS);
        assert_eq!(nat.len(), 2);
        assert_eq!(nat.sweep(Instant::now()), 0);
        assert_eq!(nat.sweep(Instant::now() + Duration::from_secs(6)), 2);
        assert!(nat.is_empty());
    }
}

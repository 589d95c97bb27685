//! Per-queue packet classification

use super::Shared;
use crate::config::{QuicFilter, RuleSet};
use crate::conntrack::Tracked;
use crate::flow::FlowTable;
use crate::packet::{ports, rewrite_address, Endpoint, PacketInfo, Protocol};
use crate::sni::{self, dns, quic, tls};
use crate::strategies::udp::{udp_action, UdpAction};
use crate::strategies::{self, incoming_plan, syn_plan, tls_plan, Plan};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, trace};

/// How often a worker expires its flow table
const FLOW_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Kernel verdict for the intercepted packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Let the original continue
    Accept,
    /// Discard the original
    Drop,
    /// Let a rewritten copy continue in place of the original
    Replace(Vec<u8>),
}

/// Outcome of classifying one packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// What the kernel should do with the original
    pub verdict: Verdict,
    /// Packets to inject, if any
    pub plan: Option<Plan>,
}

impl Decision {
    /// Leave the packet alone
    pub fn accept() -> Self {
        Self {
            verdict: Verdict::Accept,
            plan: None,
        }
    }

    /// Discard the packet without replacement
    pub fn drop() -> Self {
        Self {
            verdict: Verdict::Drop,
            plan: None,
        }
    }

    /// Drop the original; `plan` carries its data
    pub fn inject(plan: Plan) -> Self {
        Self {
            verdict: Verdict::Drop,
            plan: Some(plan),
        }
    }

    /// Let the original through and inject `plan` alongside it
    pub fn accept_with(plan: Plan) -> Self {
        Self {
            verdict: Verdict::Accept,
            plan: Some(plan),
        }
    }

    /// Pass a rewritten packet on
    pub fn replace(packet: Vec<u8>) -> Self {
        Self {
            verdict: Verdict::Replace(packet),
            plan: None,
        }
    }

    /// A plan that only re-sends the original becomes a plain accept
    fn settle(self, original: &[u8]) -> Self {
        match &self.plan {
            Some(plan) if plan.is_passthrough(original) => Self::accept(),
            _ => self,
        }
    }
}

/// Per-worker counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    /// Packets seen
    pub packets: u64,
    /// Packets that failed to parse
    pub malformed: u64,
    /// Originals dropped and replaced by a plan
    pub rewritten: u64,
    /// Originals dropped outright
    pub dropped: u64,
    /// Inbound packets that triggered injected fakes
    pub incoming: u64,
    /// DNS packets redirected or translated back
    pub dns_rewritten: u64,
}

/// Classifies packets from one kernel queue.
///
/// Owns its flow table; everything else is shared with the other workers
/// through the engine.
pub struct Worker {
    queue: u16,
    flows: FlowTable,
    shared: Arc<Shared>,
    last_sweep: Instant,
    stats: WorkerStats,
}

impl Worker {
    pub(super) fn new(queue: u16, shared: Arc<Shared>) -> Self {
        let flows = FlowTable::with_limits(shared.config.flow_buffer_cap, shared.config.flow_ttl());
        Self {
            queue,
            flows,
            shared,
            last_sweep: Instant::now(),
            stats: WorkerStats::default(),
        }
    }

    /// Queue number this worker serves
    pub fn queue(&self) -> u16 {
        self.queue
    }

    /// Counters since start
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Flows waiting for more ClientHello bytes
    pub fn pending_flows(&self) -> usize {
        self.flows.len()
    }

    /// Classify a packet, spawn its plan on `runtime` and return the
    /// verdict. Also expires the flow table once a second.
    pub fn handle(&mut self, data: &[u8], runtime: &Handle) -> Verdict {
        let now = Instant::now();
        let decision = self.classify(data, now);
        if let Some(plan) = decision.plan {
            strategies::spawn(runtime, plan, Arc::clone(&self.shared.sender));
        }
        self.maybe_sweep(now);
        decision.verdict
    }

    /// Expire stale flow entries if the sweep interval has passed
    pub fn maybe_sweep(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_sweep) < FLOW_SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;
        let removed = self.flows.sweep(now);
        if removed > 0 {
            trace!(queue = self.queue, removed, "flow table swept");
        }
    }

    /// Decide what to do with one intercepted packet.
    ///
    /// Anything that does not parse, or is not ours, is accepted.
    pub fn classify(&mut self, data: &[u8], now: Instant) -> Decision {
        self.stats.packets += 1;
        let info = match PacketInfo::parse(data) {
            Ok(info) => info,
            Err(e) => {
                self.stats.malformed += 1;
                trace!(queue = self.queue, error = %e, "passing unparseable packet");
                return Decision::accept();
            }
        };

        let decision = match info.protocol {
            Protocol::Tcp => self.classify_tcp(&info, now),
            Protocol::Udp => self.classify_udp(&info, now),
            Protocol::Other(_) => Decision::accept(),
        }
        .settle(info.bytes());

        match (&decision.verdict, &decision.plan) {
            (Verdict::Drop, Some(_)) => self.stats.rewritten += 1,
            (Verdict::Drop, None) => self.stats.dropped += 1,
            (Verdict::Accept, Some(_)) => self.stats.incoming += 1,
            (Verdict::Replace(_), _) => self.stats.dns_rewritten += 1,
            (Verdict::Accept, None) => {}
        }
        decision
    }

    // =========== TCP ===========

    fn classify_tcp(&mut self, info: &PacketInfo<'_>, now: Instant) -> Decision {
        if info.dst_port == ports::HTTPS {
            if info.flags.is_syn_only() {
                return self.on_syn(info);
            }
            if info.payload_len > 0 {
                return self.on_tls_data(info, now);
            }
        } else if info.src_port == ports::HTTPS && info.payload_len > 0 {
            return self.on_inbound(info, now);
        }
        Decision::accept()
    }

    fn on_syn(&self, info: &PacketInfo<'_>) -> Decision {
        match self.shared.matcher.load().match_ip(info.dst) {
            Some(set) if set.tcp.syn_fake => {
                Decision::inject(syn_plan(info, &set, self.shared.config.mtu))
            }
            _ => Decision::accept(),
        }
    }

    fn on_tls_data(&mut self, info: &PacketInfo<'_>, now: Instant) -> Decision {
        let key = info.flow_key();
        let mtu = self.shared.config.mtu;

        match self.shared.conntrack.outbound(&key, info.payload_len, now) {
            Some(Tracked::Exhausted) => return Decision::accept(),
            Some(Tracked::Active(set)) => {
                // Only a retransmitted or repeated ClientHello is rewritten
                // again; the rest of the stream passes.
                return if tls::parse_client_hello(info.payload()).is_some() {
                    Decision::inject(tls_plan(info, &set, mtu))
                } else {
                    Decision::accept()
                };
            }
            None => {}
        }

        let matcher = self.shared.matcher.load();
        let set = match self.flows.feed(key, info.payload(), now) {
            Some(name) => {
                let set = matcher.match_sni(&name).or_else(|| matcher.match_ip(info.dst));
                if set.is_none() {
                    trace!(sni = %name, "no rule set");
                }
                set
            }
            // ECH or an unreadable hello: only the destination can match
            None if tls::find_client_hello(info.payload()).is_some() => {
                matcher.match_ip(info.dst)
            }
            None => None,
        };
        let Some(set) = set else {
            return Decision::accept();
        };

        self.flows.remove(&key);
        self.shared.conntrack.register(key, Arc::clone(&set), now);
        self.shared.conntrack.outbound(&key, info.payload_len, now);
        debug!(
            queue = self.queue,
            set = %set.id,
            dst = %info.dst_addr(),
            strategy = set.fragmentation.strategy.as_str(),
            "rewriting ClientHello"
        );
        Decision::inject(tls_plan(info, &set, mtu))
    }

    fn on_inbound(&self, info: &PacketInfo<'_>, now: Instant) -> Decision {
        let key = info.flow_key();
        let Some(action) = self.shared.conntrack.inbound(&key, info.payload_len, now) else {
            return Decision::accept();
        };
        match incoming_plan(info, &action) {
            Some(plan) => {
                debug!(queue = self.queue, server = %info.src_addr(), ?action, "incoming threshold crossed");
                Decision::accept_with(plan)
            }
            None => Decision::accept(),
        }
    }

    // =========== UDP ===========

    fn classify_udp(&mut self, info: &PacketInfo<'_>, now: Instant) -> Decision {
        if info.dst_port == ports::DNS {
            return self.on_dns_query(info);
        }
        if info.src_port == ports::DNS {
            return self.on_dns_response(info);
        }

        let key = info.flow_key();
        match self.shared.conntrack.outbound(&key, info.payload_len, now) {
            Some(Tracked::Exhausted) => return Decision::accept(),
            Some(Tracked::Active(set)) => return self.udp_decision(info, &set),
            None => {}
        }

        let Some(set) = self.match_udp(info) else {
            return Decision::accept();
        };
        self.shared.conntrack.register(key, Arc::clone(&set), now);
        self.shared.conntrack.outbound(&key, info.payload_len, now);
        debug!(queue = self.queue, set = %set.id, dst = %info.dst_addr(), "matched datagram");
        self.udp_decision(info, &set)
    }

    /// QUIC Initial by Server Name, any Initial for `filter_quic = all`,
    /// STUN, then destination port ranges
    fn match_udp(&self, info: &PacketInfo<'_>) -> Option<Arc<RuleSet>> {
        let matcher = self.shared.matcher.load();
        let payload = info.payload();

        if info.dst_port == ports::QUIC && quic::is_initial(payload) {
            let quic_sets = || {
                matcher
                    .sets()
                    .iter()
                    .filter(|s| s.udp.filter_quic != QuicFilter::Disabled)
            };
            if quic_sets().any(|s| s.udp.filter_quic == QuicFilter::Parse) {
                let by_name = quic::extract_sni(payload)
                    .and_then(|name| matcher.match_sni(&name))
                    .filter(|s| s.udp.filter_quic != QuicFilter::Disabled);
                if by_name.is_some() {
                    return by_name;
                }
            }
            if let Some(set) = quic_sets().find(|s| s.udp.filter_quic == QuicFilter::All) {
                return Some(Arc::clone(set));
            }
        }

        if sni::is_stun(payload) {
            if let Some(set) = matcher.sets().iter().find(|s| s.udp.filter_stun) {
                return Some(Arc::clone(set));
            }
        }

        matcher.match_udp_port(info.dst_port)
    }

    fn udp_decision(&self, info: &PacketInfo<'_>, set: &RuleSet) -> Decision {
        match udp_action(info, set, self.shared.config.mtu) {
            UdpAction::Drop => Decision::drop(),
            UdpAction::Inject(plan) => Decision::inject(plan),
        }
    }

    // =========== DNS ===========

    fn on_dns_query(&self, info: &PacketInfo<'_>) -> Decision {
        let matcher = self.shared.matcher.load();
        if !matcher.has_dns_redirect() {
            return Decision::accept();
        }
        let Some(name) = dns::extract_qname(info.payload()) else {
            return Decision::accept();
        };
        let Some(target) = matcher
            .match_sni(&name)
            .filter(|s| s.dns.enabled)
            .and_then(|s| s.dns.target_dns)
            .filter(|t| t.is_ipv6() == info.is_ipv6() && *t != info.dst)
        else {
            return Decision::accept();
        };

        let mut packet = info.bytes().to_vec();
        if let Err(e) = rewrite_address(&mut packet, Endpoint::Destination, target) {
            trace!(error = %e, "DNS redirect failed");
            return Decision::accept();
        }
        self.shared
            .dns_nat
            .track_query(info.src_port, info.dst_addr(), target);
        debug!(%name, from = %info.dst, to = %target, "redirecting DNS query");
        Decision::replace(packet)
    }

    fn on_dns_response(&self, info: &PacketInfo<'_>) -> Decision {
        if !dns::is_response(info.payload()) {
            return Decision::accept();
        }
        let Some(original) = self.shared.dns_nat.get_original(info.dst_port, info.src) else {
            return Decision::accept();
        };
        let mut packet = info.bytes().to_vec();
        if let Err(e) = rewrite_address(&mut packet, Endpoint::Source, original.ip()) {
            trace!(error = %e, "DNS reverse translation failed");
            return Decision::accept();
        }
        trace!(resolver = %original, "restoring DNS response source");
        Decision::replace(packet)
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("queue", &self.queue)
            .field("flows", &self.flows.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

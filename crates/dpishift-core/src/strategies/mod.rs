//! DPI evasion strategies
//!
//! Every strategy is a pure function from an intercepted packet and its
//! matched [`RuleSet`] to a [`Plan`]: the ordered packets to inject, each
//! with the delay to wait before sending it. Plans are executed off the
//! verdict path by [`executor::spawn`].
//!
//! A strategy that cannot safely rewrite a packet returns `None`, and the
//! caller falls back to re-sending the original unchanged.

mod combo;
mod common;
mod desync;
mod disorder;
pub mod executor;
mod fake;
mod fragment;
mod incoming;
mod overlap;
mod sender;
pub mod sni_mutation;
mod syn;
pub mod udp;

pub use executor::{execute, spawn};
pub use incoming::incoming_plan;
pub use sender::PacketSender;
#[cfg(test)]
pub use sender::MockPacketSender;
pub use syn::syn_plan;

use crate::config::{FragStrategy, RuleSet};
use crate::packet::PacketInfo;
use crate::sni::tls::{self, ClientHello};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, trace};

/// Whether an emitted packet carries real stream data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmissionKind {
    /// Data the server must receive
    Real,
    /// Decoy meant only for the inspector
    Fake,
}

/// One packet of a [`Plan`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission {
    /// Complete IP packet
    pub packet: Vec<u8>,
    /// Wait before sending
    pub delay: Duration,
    /// Real or decoy
    pub kind: EmissionKind,
    /// Checksum deliberately broken
    pub corrupted: bool,
}

impl Emission {
    /// A real packet, sent immediately
    pub fn real(packet: Vec<u8>) -> Self {
        Self {
            packet,
            delay: Duration::ZERO,
            kind: EmissionKind::Real,
            corrupted: false,
        }
    }

    /// A real copy of an intercepted packet with its checksums recomputed
    pub fn resend(packet: &[u8]) -> Self {
        let mut packet = packet.to_vec();
        if let Err(e) = crate::packet::fix_checksums(&mut packet) {
            trace!(error = %e, "resending with original checksums");
        }
        Self::real(packet)
    }

    /// A decoy with valid checksums
    pub fn fake(packet: Vec<u8>) -> Self {
        Self {
            kind: EmissionKind::Fake,
            ..Self::real(packet)
        }
    }

    /// A decoy whose TCP/UDP checksum is broken so the server drops it
    pub fn corrupted(mut packet: Vec<u8>) -> Self {
        let corrupted = crate::packet::corrupt_l4_checksum(&mut packet).is_ok();
        Self {
            corrupted,
            ..Self::fake(packet)
        }
    }

    /// Set the delay before this emission
    #[must_use]
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// True for real data
    pub fn is_real(&self) -> bool {
        self.kind == EmissionKind::Real
    }
}

/// A fully built TCP segment and the sequence number it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Complete IP packet
    pub packet: Vec<u8>,
    /// TCP sequence number
    pub seq: u32,
}

impl From<Segment> for Emission {
    fn from(segment: Segment) -> Self {
        Emission::real(segment.packet)
    }
}

/// Ordered packets to inject toward `dst`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Destination for the raw sender
    pub dst: IpAddr,
    /// Packets in sending order
    pub emissions: Vec<Emission>,
}

impl Plan {
    /// Empty plan
    pub fn new(dst: IpAddr) -> Self {
        Self {
            dst,
            emissions: Vec::new(),
        }
    }

    /// Re-send `packet` unchanged
    pub fn passthrough(packet: &[u8], dst: IpAddr) -> Self {
        Self {
            dst,
            emissions: vec![Emission::real(packet.to_vec())],
        }
    }

    /// Append one emission
    pub fn push(&mut self, emission: Emission) {
        self.emissions.push(emission);
    }

    /// Append several emissions
    pub fn extend(&mut self, emissions: impl IntoIterator<Item = Emission>) {
        self.emissions.extend(emissions);
    }

    /// Number the IPv4 datagrams of the plan `id0`, `id0 + 1`, ... in
    /// sending order. Fragments of the one fragmented datagram share a value.
    pub fn stamp_ids(&mut self, id0: u16) {
        let mut next = id0;
        let mut fragment_id = None;
        for emission in &mut self.emissions {
            let fragment = crate::packet::is_fragment(&emission.packet);
            let id = match fragment_id {
                Some(id) if fragment => id,
                _ => {
                    let id = next;
                    next = next.wrapping_add(1);
                    if fragment {
                        fragment_id = Some(id);
                    }
                    id
                }
            };
            if let Err(e) = crate::packet::set_ipv4_id(&mut emission.packet, id) {
                trace!(error = %e, "IP id left as is");
            }
        }
    }

    /// Real emissions in sending order
    pub fn real(&self) -> impl Iterator<Item = &Emission> {
        self.emissions.iter().filter(|e| e.is_real())
    }

    /// Decoy emissions in sending order
    pub fn fakes(&self) -> impl Iterator<Item = &Emission> {
        self.emissions.iter().filter(|e| !e.is_real())
    }

    /// True if the plan only re-sends `original` as is
    pub fn is_passthrough(&self, original: &[u8]) -> bool {
        self.emissions.len() == 1
            && self.emissions[0].is_real()
            && self.emissions[0].packet == original
    }

    /// Number of packets
    pub fn len(&self) -> usize {
        self.emissions.len()
    }

    /// True if nothing will be sent
    pub fn is_empty(&self) -> bool {
        self.emissions.is_empty()
    }
}

/// Inputs shared by the split strategies
pub(crate) struct SplitInput<'a, 'p> {
    pub info: &'a PacketInfo<'p>,
    pub set: &'a RuleSet,
    /// ClientHello offsets relative to the payload
    pub hello: Option<&'a ClientHello>,
}

impl SplitInput<'_, '_> {
    pub fn len(&self) -> usize {
        self.info.payload_len
    }

    /// Offset of the SNI extension header, if inside the payload
    pub fn pre_ext(&self) -> Option<usize> {
        self.hello
            .and_then(|h| h.sni_ext)
            .filter(|&p| p > 0 && p < self.len())
    }

    /// SNI value range, if fully inside the payload
    pub fn sni(&self) -> Option<std::ops::Range<usize>> {
        self.hello
            .and_then(|h| h.sni.clone())
            .filter(|r| r.start > 0 && r.end <= self.len() && !r.is_empty())
    }
}

/// Run one fragmentation strategy. `None` means "send unchanged".
pub(crate) fn fragment_with(strategy: FragStrategy, input: &SplitInput<'_, '_>) -> Option<Vec<Emission>> {
    match strategy {
        FragStrategy::None => None,
        FragStrategy::Tcp => fragment::tcp(input),
        FragStrategy::Ip => fragment::ip(input),
        FragStrategy::Tls => fragment::tls_record(input),
        FragStrategy::Oob => fragment::oob(input),
        FragStrategy::FirstByte => fragment::first_byte(input),
        FragStrategy::ExtSplit => fragment::ext_split(input),
        FragStrategy::Combo => combo::combo(input),
        FragStrategy::Disorder => disorder::disorder(input),
        FragStrategy::Hybrid => combo::hybrid(input),
        FragStrategy::Overlap => overlap::overlap(input),
    }
}

/// Build the plan for an outbound packet that carries a matched ClientHello.
///
/// Order: SNI mutation rewrites the packet, then desync, window and
/// duplicate-ACK fakes, fake ClientHellos, and finally the fragmentation
/// strategy carrying the real data.
pub fn tls_plan(info: &PacketInfo<'_>, set: &RuleSet, mtu: usize) -> Plan {
    let dst = info.dst;
    if info.payload_len == 0 || !info.is_tcp() {
        return Plan::passthrough(info.bytes(), dst);
    }

    let mutated = sni_mutation::apply(info, set, mtu);
    let reparsed = mutated.as_deref().and_then(|p| PacketInfo::parse(p).ok());
    let current = reparsed.as_ref().unwrap_or(info);

    let mut plan = Plan::new(dst);
    plan.extend(desync::desync(current, set));
    plan.extend(desync::window(current, set));
    plan.extend(desync::dup_ack(current, set));
    plan.extend(fake::fake_hellos(current, set, mtu));

    let payload = current.payload();
    let hello = tls::parse_client_hello(payload);
    let input = SplitInput {
        info: current,
        set,
        hello: hello.as_ref(),
    };
    let strategy = set.fragmentation.strategy;
    match fragment_with(strategy, &input) {
        Some(emissions) => {
            debug!(
                set = %set.id,
                strategy = strategy.as_str(),
                packets = emissions.len(),
                "fragmented"
            );
            plan.extend(emissions);
        }
        None => {
            trace!(strategy = strategy.as_str(), "strategy declined, sending whole");
            plan.push(Emission::resend(current.bytes()));
        }
    }
    plan.stamp_ids(info.id0);
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{verify_checksums, PacketBuilder, TcpFlags};
    use crate::sni::ClientHelloBuilder;

    pub(crate) fn hello_packet(host: &str) -> Vec<u8> {
        PacketBuilder::tcp(
            "10.0.0.1:40000".parse().unwrap(),
            "1.2.3.4:443".parse().unwrap(),
        )
        .seq(1_000_000)
        .ack(777)
        .flags(TcpFlags::ACK | TcpFlags::PSH)
        .payload(&ClientHelloBuilder::new(host).build())
        .build()
        .unwrap()
    }

    #[test]
    fn test_emission_constructors() {
        let raw = hello_packet("example.com");
        let e = Emission::corrupted(raw.clone());
        assert!(e.corrupted);
        assert!(!e.is_real());
        assert!(!verify_checksums(&e.packet));

        let r = Emission::real(raw.clone()).after(Duration::from_millis(5));
        assert!(r.is_real());
        assert_eq!(r.delay, Duration::from_millis(5));
        assert!(Plan::passthrough(&raw, "1.2.3.4".parse().unwrap()).is_passthrough(&raw));
    }

    #[test]
    fn test_tls_plan_none_strategy_passes_through() {
        let raw = hello_packet("example.com");
        let info = PacketInfo::parse(&raw).unwrap();
        let mut set = RuleSet::for_domains("x", &["example.com"]);
        set.fragmentation.strategy = FragStrategy::None;
        set.faking.sni = false;
        let plan = tls_plan(&info, &set, 1500);
        assert!(plan.is_passthrough(&raw));
    }

    #[test]
    fn test_tls_plan_fakes_precede_real_data() {
        let raw = hello_packet("example.com");
        let info = PacketInfo::parse(&raw).unwrap();
        let mut set = RuleSet::for_domains("x", &["example.com"]);
        set.faking.sni = true;
        set.faking.count = 2;
        set.tcp.dup_ack_count = 1;
        let plan = tls_plan(&info, &set, 1500);

        let first_real = plan.emissions.iter().position(Emission::is_real).unwrap();
        assert_eq!(first_real, 3);
        assert!(plan.emissions[first_real..].iter().all(Emission::is_real));
    }

    fn ipv4_id(packet: &[u8]) -> u16 {
        u16::from_be_bytes([packet[4], packet[5]])
    }

    #[test]
    fn test_tls_plan_ids_follow_sending_order() {
        let raw = hello_packet("example.com");
        let info = PacketInfo::parse(&raw).unwrap();
        let mut set = RuleSet::for_domains("x", &["example.com"]);
        set.faking.count = 2;
        set.tcp.dup_ack_count = 1;
        let plan = tls_plan(&info, &set, 1500);

        let ids: Vec<u16> = plan.emissions.iter().map(|e| ipv4_id(&e.packet)).collect();
        let expected: Vec<u16> = (0..plan.len())
            .map(|n| info.id0.wrapping_add(u16::try_from(n).unwrap()))
            .collect();
        assert_eq!(ids, expected);
        assert!(plan.real().all(|e| verify_checksums(&e.packet)));
    }

    #[test]
    fn test_tls_plan_fragments_share_id_and_carry_fixed_checksum() {
        let mut raw = hello_packet("example.com");
        let valid = raw[36..38].to_vec();
        raw[36] = 0;
        raw[37] = 0;
        let info = PacketInfo::parse(&raw).unwrap();
        let mut set = RuleSet::for_domains("x", &["example.com"]);
        set.fragmentation.strategy = FragStrategy::Ip;
        set.faking.count = 1;
        let plan = tls_plan(&info, &set, 1500);

        assert_eq!(plan.len(), 3);
        let [fake, first, second] = [0, 1, 2].map(|i| &plan.emissions[i].packet);
        assert_eq!(ipv4_id(fake), info.id0);
        assert_eq!(ipv4_id(first), info.id0.wrapping_add(1));
        assert_eq!(ipv4_id(second), ipv4_id(first));
        assert_eq!(first[36..38], valid[..]);
        assert_eq!(crate::packet::internet_checksum(&first[..20]), 0);
        assert_eq!(crate::packet::internet_checksum(&second[..20]), 0);
    }
}

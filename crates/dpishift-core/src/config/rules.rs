//! Rule sets: the per-target evasion policy
//!
//! A [`RuleSet`] names its targets (domains, networks, UDP ports) and the
//! options of every strategy family. The engine only ever reads them; a
//! configuration change builds a new matcher from a new list.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// A named evasion policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    /// Stable identifier
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Disabled sets are skipped when building the matcher
    pub enabled: bool,
    /// TCP-level options
    pub tcp: TcpOptions,
    /// UDP / QUIC options
    pub udp: UdpOptions,
    /// Fragmentation strategy and its parameters
    pub fragmentation: FragmentationOptions,
    /// Fake ClientHello injection
    pub faking: FakingOptions,
    /// What this set applies to
    pub targets: Targets,
    /// Plaintext DNS redirect
    pub dns: DnsOptions,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            name: "default".to_string(),
            enabled: true,
            tcp: TcpOptions::default(),
            udp: UdpOptions::default(),
            fragmentation: FragmentationOptions::default(),
            faking: FakingOptions::default(),
            targets: Targets::default(),
            dns: DnsOptions::default(),
        }
    }
}

impl RuleSet {
    /// A set with default options targeting `domains`
    pub fn for_domains(id: &str, domains: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            targets: Targets {
                sni_domains: domains.iter().map(|d| (*d).to_string()).collect(),
                ip: Vec::new(),
            },
            ..Self::default()
        }
    }

    /// Decoded custom fake payload, if one is configured
    pub fn custom_payload(&self) -> Result<Option<Vec<u8>>> {
        if self.faking.payload != FakePayload::Custom || self.faking.custom_payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(hex::decode(self.faking.custom_payload.trim())?))
    }

    /// Check option ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let key = |field: &str| format!("sets.{}.{field}", self.id);

        if self.id.is_empty() {
            return Err(Error::config_value("sets.id", "must not be empty"));
        }
        for (field, ttl) in [
            ("faking.ttl", self.faking.ttl),
            ("tcp.syn_ttl", self.tcp.syn_ttl),
            ("tcp.desync.ttl", self.tcp.desync.ttl),
            ("tcp.incoming.fake_ttl", self.tcp.incoming.fake_ttl),
        ] {
            if ttl == 0 {
                return Err(Error::config_value(key(field), "TTL must be 1-255"));
            }
        }
        if self.tcp.incoming.min_kb > self.tcp.incoming.max_kb {
            return Err(Error::config_value(
                key("tcp.incoming"),
                "min_kb must not exceed max_kb",
            ));
        }
        let disorder = &self.fragmentation.disorder;
        if disorder.min_jitter_us > disorder.max_jitter_us {
            return Err(Error::config_value(
                key("fragmentation.disorder"),
                "min_jitter_us must not exceed max_jitter_us",
            ));
        }
        if !self.fragmentation.oob_char.is_ascii() {
            return Err(Error::config_value(
                key("fragmentation.oob_char"),
                "must be an ASCII character",
            ));
        }
        for range in &self.udp.dport_filter {
            parse_port_range(range)?;
        }
        if self.dns.enabled && self.dns.target_dns.is_none() {
            return Err(Error::config_value(
                key("dns.target_dns"),
                "required when DNS redirect is enabled",
            ));
        }
        self.custom_payload()?;
        Ok(())
    }
}

/// Parse a `"lo-hi"` or `"port"` entry of a port filter
pub fn parse_port_range(range: &str) -> Result<(u16, u16)> {
    let bad = || Error::config_value("udp.dport_filter", format!("invalid port range '{range}'"));
    let range = range.trim();
    let (lo, hi) = match range.split_once('-') {
        Some((lo, hi)) => (lo.trim(), hi.trim()),
        None => (range, range),
    };
    let lo: u16 = lo.parse().map_err(|_| bad())?;
    let hi: u16 = hi.parse().map_err(|_| bad())?;
    if lo == 0 || lo > hi {
        return Err(bad());
    }
    Ok((lo, hi))
}

/// TCP-level options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpOptions {
    /// Outbound bytes after which a rewritten flow is no longer inspected
    pub conn_bytes_limit: u64,
    /// Delay between the two halves of a split, in milliseconds
    pub seg2_delay_ms: u64,
    /// Send a fake SYN before the real one
    pub syn_fake: bool,
    /// Length of the fake SYN payload (0 = a full fake ClientHello)
    pub syn_fake_len: usize,
    /// TTL of the fake SYN
    pub syn_ttl: u8,
    /// Fake RST/FIN/ACK bursts
    pub desync: DesyncOptions,
    /// Fake window-update packets
    pub window: WindowOptions,
    /// Number of low-TTL duplicate ACKs (0 = off)
    pub dup_ack_count: u8,
    /// Reaction to inbound volume thresholds
    pub incoming: IncomingOptions,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            conn_bytes_limit: 4096,
            seg2_delay_ms: 0,
            syn_fake: false,
            syn_fake_len: 0,
            syn_ttl: 3,
            desync: DesyncOptions::default(),
            window: WindowOptions::default(),
            dup_ack_count: 0,
            incoming: IncomingOptions::default(),
        }
    }
}

/// Desync burst options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesyncOptions {
    /// Which control packets to forge
    pub mode: DesyncMode,
    /// TTL of the forged packets
    pub ttl: u8,
    /// Packets per kind
    pub count: u8,
}

impl Default for DesyncOptions {
    fn default() -> Self {
        Self {
            mode: DesyncMode::Off,
            ttl: 3,
            count: 3,
        }
    }
}

/// Desync mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesyncMode {
    /// No desync
    Off,
    /// Fake RSTs
    Rst,
    /// Fake FINs
    Fin,
    /// Fake ACKs
    Ack,
    /// RST + FIN + ACK
    Combo,
    /// Combo with spread sequence offsets and bogus acks
    Full,
}

/// Window manipulation options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowOptions {
    /// How window values are chosen
    pub mode: WindowMode,
    /// Values used by `oscillate` and `escalate`
    pub values: Vec<u16>,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            mode: WindowMode::Off,
            values: vec![0, 1460, 8192, 65535],
        }
    }
}

/// Window manipulation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    /// Disabled
    Off,
    /// Alternate between the configured values
    Oscillate,
    /// Advertise a zero window
    Zero,
    /// Random windows
    Random,
    /// Configured values sorted ascending
    Escalate,
}

/// Inbound threshold options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncomingOptions {
    /// Reaction when the threshold is crossed
    pub mode: IncomingMode,
    /// Lower bound of the random threshold, KiB
    pub min_kb: u32,
    /// Upper bound of the random threshold, KiB
    pub max_kb: u32,
    /// TTL of injected packets
    pub fake_ttl: u8,
    /// Number of fakes in `fake` mode
    pub fake_count: u8,
}

impl Default for IncomingOptions {
    fn default() -> Self {
        Self {
            mode: IncomingMode::Off,
            min_kb: 14,
            max_kb: 20,
            fake_ttl: 3,
            fake_count: 3,
        }
    }
}

/// Inbound threshold reaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncomingMode {
    /// Disabled
    Off,
    /// Checksum-corrupted fakes toward the server
    Fake,
    /// One low-TTL fake RST
    Reset,
}

/// UDP / QUIC options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpOptions {
    /// What to do with matched datagrams
    pub mode: UdpMode,
    /// Fakes sent before the original in `fake` mode
    pub fake_count: u8,
    /// Minimum size of a fake datagram payload
    pub fake_len: usize,
    /// How fakes are kept away from the server
    pub faking: UdpFaking,
    /// QUIC detection
    pub filter_quic: QuicFilter,
    /// Match STUN messages
    pub filter_stun: bool,
    /// Destination port ranges (`"lo-hi"` or `"port"`)
    pub dport_filter: Vec<String>,
    /// Datagrams per flow that are processed
    pub conn_packets_limit: u32,
}

impl Default for UdpOptions {
    fn default() -> Self {
        Self {
            mode: UdpMode::Fake,
            fake_count: 6,
            fake_len: 64,
            faking: UdpFaking::None,
            filter_quic: QuicFilter::Disabled,
            filter_stun: false,
            dport_filter: Vec::new(),
            conn_packets_limit: 8,
        }
    }
}

/// UDP handling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UdpMode {
    /// Send fakes, then the original
    Fake,
    /// Drop the datagram
    Drop,
}

/// UDP fake protection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UdpFaking {
    /// Fakes are sent as-is
    None,
    /// Low TTL
    Ttl,
    /// Corrupted UDP checksum
    Checksum,
}

/// QUIC detection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuicFilter {
    /// Ignore QUIC
    Disabled,
    /// Every Initial matches
    All,
    /// Decrypt the Initial and match its Server Name
    Parse,
}

/// Fragmentation options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentationOptions {
    /// Strategy (unknown names load as `tcp`)
    pub strategy: FragStrategy,
    /// Split offset into the payload
    pub sni_position: usize,
    /// Send the second half first
    pub reverse_order: bool,
    /// Split in the middle of the Server Name instead
    pub middle_sni: bool,
    /// Split offset into the TLS record body
    pub tls_record_position: usize,
    /// Offset of the out-of-band byte
    pub oob_position: usize,
    /// Value of the out-of-band byte
    pub oob_char: char,
    /// `combo` parameters
    pub combo: ComboOptions,
    /// `disorder` parameters
    pub disorder: DisorderOptions,
    /// `overlap` parameters
    pub overlap: OverlapOptions,
    /// ClientHello mutation
    pub sni_mutation: SniMutationOptions,
}

impl Default for FragmentationOptions {
    fn default() -> Self {
        Self {
            strategy: FragStrategy::Tcp,
            sni_position: 1,
            reverse_order: false,
            middle_sni: false,
            tls_record_position: 1,
            oob_position: 1,
            oob_char: 'x',
            combo: ComboOptions::default(),
            disorder: DisorderOptions::default(),
            overlap: OverlapOptions::default(),
            sni_mutation: SniMutationOptions::default(),
        }
    }
}

/// Fragmentation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FragStrategy {
    /// TCP segmentation
    Tcp,
    /// IPv4 fragmentation
    Ip,
    /// Split into two TLS records
    Tls,
    /// Out-of-band byte between two segments
    Oob,
    /// Multi-point split with shuffling and decoys
    Combo,
    /// Jittered multi-way split
    Disorder,
    /// Split before the server_name extension
    ExtSplit,
    /// One byte, then the rest
    FirstByte,
    /// Pick combo/disorder/extsplit/firstbyte from what the packet offers
    Hybrid,
    /// Overlapping decoy over the Server Name
    Overlap,
    /// Forward the payload unsplit
    None,
}

impl FragStrategy {
    /// All strategies, in declaration order
    pub const ALL: [FragStrategy; 11] = [
        Self::Tcp,
        Self::Ip,
        Self::Tls,
        Self::Oob,
        Self::Combo,
        Self::Disorder,
        Self::ExtSplit,
        Self::FirstByte,
        Self::Hybrid,
        Self::Overlap,
        Self::None,
    ];

    /// Configuration name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ip => "ip",
            Self::Tls => "tls",
            Self::Oob => "oob",
            Self::Combo => "combo",
            Self::Disorder => "disorder",
            Self::ExtSplit => "extsplit",
            Self::FirstByte => "firstbyte",
            Self::Hybrid => "hybrid",
            Self::Overlap => "overlap",
            Self::None => "none",
        }
    }

    /// Look up a strategy by configuration name
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }
}

impl From<String> for FragStrategy {
    fn from(name: String) -> Self {
        Self::from_name(&name).unwrap_or_else(|| {
            tracing::warn!(strategy = %name, "unknown fragmentation strategy, using tcp");
            Self::Tcp
        })
    }
}

impl From<FragStrategy> for String {
    fn from(s: FragStrategy) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for FragStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `combo` parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComboOptions {
    /// Split after the first byte
    pub first_byte_split: bool,
    /// Split before the server_name extension
    pub ext_split: bool,
    /// Emission order of the pieces
    pub shuffle: ShuffleMode,
    /// Delay after the first emitted piece, milliseconds
    pub first_delay_ms: u64,
    /// Upper bound of random delay between later pieces, microseconds
    pub jitter_max_us: u64,
    /// Send a low-TTL decoy ClientHello first
    pub decoy: bool,
    /// Names used for the decoy (random pick)
    pub decoy_snis: Vec<String>,
    /// Length of a low-TTL garbage prefix sent just before `seq0` (0 = off)
    pub seq_overlap: usize,
}

impl Default for ComboOptions {
    fn default() -> Self {
        Self {
            first_byte_split: true,
            ext_split: true,
            shuffle: ShuffleMode::Middle,
            first_delay_ms: 100,
            jitter_max_us: 2000,
            decoy: false,
            decoy_snis: vec!["ya.ru".to_string(), "vk.com".to_string()],
            seq_overlap: 0,
        }
    }
}

/// Emission order of split pieces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShuffleMode {
    /// In order
    None,
    /// First and last stay, the middle is shuffled
    Middle,
    /// Fully random
    Full,
    /// Last piece first
    Reverse,
}

/// `disorder` parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisorderOptions {
    /// Emission order
    pub shuffle: DisorderShuffle,
    /// Minimum delay between pieces, microseconds
    pub min_jitter_us: u64,
    /// Maximum delay between pieces, microseconds
    pub max_jitter_us: u64,
}

impl Default for DisorderOptions {
    fn default() -> Self {
        Self {
            shuffle: DisorderShuffle::Full,
            min_jitter_us: 1000,
            max_jitter_us: 3000,
        }
    }
}

/// `disorder` emission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisorderShuffle {
    /// Fully random
    Full,
    /// Reverse order
    Reverse,
}

/// `overlap` parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlapOptions {
    /// Decoy names written over the real one (random pick)
    pub fake_snis: Vec<String>,
}

impl Default for OverlapOptions {
    fn default() -> Self {
        Self {
            fake_snis: vec!["ya.ru".to_string(), "vk.com".to_string()],
        }
    }
}

/// ClientHello mutation options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SniMutationOptions {
    /// Which mutations to apply
    pub mode: SniMutationMode,
    /// Extra names for `duplicate`
    pub fake_snis: Vec<String>,
    /// GREASE extensions to insert
    pub grease_count: u8,
    /// Bytes of padding extension
    pub padding_size: usize,
}

impl Default for SniMutationOptions {
    fn default() -> Self {
        Self {
            mode: SniMutationMode::Off,
            fake_snis: vec!["ya.ru".to_string()],
            grease_count: 3,
            padding_size: 256,
        }
    }
}

/// ClientHello mutation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SniMutationMode {
    /// No mutation
    Off,
    /// Extra server_name extensions with fake names
    Duplicate,
    /// GREASE extensions
    Grease,
    /// Padding extension
    Padding,
    /// Shuffle non-critical extensions
    Reorder,
    /// Extra TLS 1.3 extensions
    Advanced,
    /// Everything
    Full,
}

/// Fake ClientHello injection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FakingOptions {
    /// Send fakes before the real data
    pub sni: bool,
    /// TTL of the fakes
    pub ttl: u8,
    /// How fakes are kept away from the server
    pub strategy: FakingStrategy,
    /// Sequence offset used by `pastseq`
    pub seq_offset: u32,
    /// Number of fakes
    pub count: u8,
    /// Fake payload source
    pub payload: FakePayload,
    /// Hex payload for `custom`
    pub custom_payload: String,
    /// Length of `random` payloads
    pub payload_len: usize,
    /// Server Name carried by `default` fakes
    pub decoy_sni: String,
}

impl Default for FakingOptions {
    fn default() -> Self {
        Self {
            sni: true,
            ttl: 8,
            strategy: FakingStrategy::PastSeq,
            seq_offset: 10000,
            count: 1,
            payload: FakePayload::Default,
            custom_payload: String::new(),
            payload_len: 512,
            decoy_sni: "www.google.com".to_string(),
        }
    }
}

/// Fake protection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FakingStrategy {
    /// Low TTL only
    Ttl,
    /// Sequence number already acknowledged by the server
    PastSeq,
    /// Random sequence number
    RandSeq,
    /// Corrupted TCP checksum
    TcpCheck,
    /// TCP MD5 signature option
    Md5Sum,
}

/// Fake payload source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FakePayload {
    /// Synthetic ClientHello for `decoy_sni`
    Default,
    /// Random bytes
    Random,
    /// `custom_payload`
    Custom,
}

/// Target lists, already expanded from any geo categories
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Targets {
    /// Domains; a `regexp:` prefix marks a regular expression
    pub sni_domains: Vec<String>,
    /// CIDRs or bare addresses
    pub ip: Vec<String>,
}

/// Plaintext DNS redirect
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsOptions {
    /// Redirect matching queries
    pub enabled: bool,
    /// Resolver queries are redirected to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_dns: Option<IpAddr>,
}

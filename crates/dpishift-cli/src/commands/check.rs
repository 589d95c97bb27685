//! Check command - offline rule set lookup
//!
//! Answers "what would the engine do for this host?" without binding any
//! queue: which rule set claims it and, optionally, the packet plan a
//! synthetic ClientHello for it would produce.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use dpishift_core::config::{Config, RuleSet};
use dpishift_core::packet::{PacketBuilder, PacketInfo, TcpFlags};
use dpishift_core::sni::ClientHelloBuilder;
use dpishift_core::strategies::{tls_plan, EmissionKind, Plan};
use dpishift_core::SuffixSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use super::config::{find_config_file, load};

/// Client address of synthetic packets
const SAMPLE_SRC: &str = "192.0.2.1:40000";
/// Server address used when the target is a hostname
const SAMPLE_DST: &str = "198.51.100.1:443";

/// Check command arguments
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Configuration file (default: search the standard locations)
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Show the packet plan for a synthetic ClientHello
    #[arg(short, long)]
    pub plan: bool,

    /// Hostnames or IP addresses to look up
    #[arg(required = true)]
    pub targets: Vec<String>,
}

/// Execute check command
pub fn execute(args: CheckArgs) -> Result<()> {
    let config = match args.config.or_else(find_config_file) {
        Some(path) => load(&path)?,
        None => Config::default(),
    };
    let matcher = SuffixSet::build(&config.sets, config.engine.cache_capacity)
        .context("Failed to build matcher")?;

    for target in &args.targets {
        let Some(set) = lookup(&matcher, target) else {
            println!("{} {target}: no rule set", "✗".red());
            continue;
        };
        println!(
            "{} {target}: set '{}' ({}), strategy {}",
            "✓".green(),
            set.id,
            set.name,
            set.fragmentation.strategy.as_str()
        );
        if args.plan {
            let plan = sample_plan(target, &set, config.engine.mtu)?;
            print_plan(&plan);
        }
    }
    Ok(())
}

/// The rule set a hostname or address would be handled by
pub fn lookup(matcher: &SuffixSet, target: &str) -> Option<Arc<RuleSet>> {
    match target.parse::<IpAddr>() {
        Ok(ip) => matcher.match_ip(ip),
        Err(_) => matcher.match_sni(&target.to_ascii_lowercase()),
    }
}

/// Plan for a ClientHello naming `target` (or addressed to it, for an IP)
pub fn sample_plan(target: &str, set: &RuleSet, mtu: usize) -> Result<Plan> {
    let (host, dst) = match target.parse::<IpAddr>() {
        Ok(ip) => ("sample.invalid", SocketAddr::new(ip, 443)),
        Err(_) => (target, SAMPLE_DST.parse().context("sample address")?),
    };
    let src: SocketAddr = match dst {
        SocketAddr::V4(_) => SAMPLE_SRC.parse().context("sample address")?,
        SocketAddr::V6(_) => "[2001:db8::1]:40000".parse().context("sample address")?,
    };

    let packet = PacketBuilder::tcp(src, dst)
        .seq(1)
        .ack(1)
        .flags(TcpFlags::ACK | TcpFlags::PSH)
        .payload(&ClientHelloBuilder::new(host).build())
        .build()
        .context("Failed to build sample packet")?;
    let info = PacketInfo::parse(&packet).context("Failed to parse sample packet")?;
    Ok(tls_plan(&info, set, mtu))
}

fn print_plan(plan: &Plan) {
    for (i, emission) in plan.emissions.iter().enumerate() {
        let kind = match emission.kind {
            EmissionKind::Real => "real".green(),
            EmissionKind::Fake => "fake".yellow(),
        };
        let detail = match PacketInfo::parse(&emission.packet) {
            Ok(info) if info.is_tcp() => format!(
                "seq +{} len {} ttl {}",
                info.seq0.wrapping_sub(1),
                info.payload_len,
                info.ttl
            ),
            Ok(info) => format!("len {}", info.payload_len),
            Err(_) => "ip fragment".to_string(),
        };
        println!(
            "    {i:>2}. {kind} {} bytes, {detail}{}{}",
            emission.packet.len(),
            if emission.corrupted { ", corrupted" } else { "" },
            if emission.delay.is_zero() {
                String::new()
            } else {
                format!(", after {} ms", emission.delay.as_millis())
            }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpishift_core::config::FragStrategy;

    fn matcher() -> SuffixSet {
        let mut by_ip = RuleSet::for_domains("net", &[]);
        by_ip.targets.ip = vec!["203.0.113.0/24".to_string()];
        SuffixSet::build(&[RuleSet::for_domains("web", &["example.com"]), by_ip], 100).unwrap()
    }

    #[test]
    fn test_lookup_host_and_ip() {
        let m = matcher();
        assert_eq!(lookup(&m, "WWW.Example.com").unwrap().id, "web");
        assert_eq!(lookup(&m, "203.0.113.7").unwrap().id, "net");
        assert!(lookup(&m, "other.org").is_none());
        assert!(lookup(&m, "198.51.100.1").is_none());
    }

    #[test]
    fn test_sample_plan_splits() {
        let mut set = RuleSet::for_domains("web", &["example.com"]);
        set.faking.sni = false;
        set.fragmentation.strategy = FragStrategy::Tcp;
        let plan = sample_plan("www.example.com", &set, 1500).unwrap();
        assert_eq!(plan.real().count(), 2);
        assert_eq!(plan.fakes().count(), 0);

        let plan = sample_plan("203.0.113.7", &set, 1500).unwrap();
        assert_eq!(plan.dst, "203.0.113.7".parse::<IpAddr>().unwrap());
    }
}

//! Binary prefix trie for longest-prefix CIDR lookups

use ipnet::IpNet;
use std::net::IpAddr;

#[derive(Debug, Clone, Default)]
struct Node {
    children: [Option<u32>; 2],
    value: Option<usize>,
}

/// Longest-prefix-match table over one address family.
///
/// Addresses are handled as left-aligned `u128`s so the same code serves
/// IPv4 (32 significant bits) and IPv6 (128).
#[derive(Debug, Clone)]
pub struct PrefixTrie {
    nodes: Vec<Node>,
    width: u8,
}

impl PrefixTrie {
    /// Trie for IPv4 prefixes
    pub fn v4() -> Self {
        Self::with_width(32)
    }

    /// Trie for IPv6 prefixes
    pub fn v6() -> Self {
        Self::with_width(128)
    }

    fn with_width(width: u8) -> Self {
        Self {
            nodes: vec![Node::default()],
            width,
        }
    }

    fn bits(addr: IpAddr) -> u128 {
        match addr {
            IpAddr::V4(v4) => u128::from(u32::from(v4)) << 96,
            IpAddr::V6(v6) => u128::from(v6),
        }
    }

    fn bit(bits: u128, depth: u8) -> usize {
        usize::from((bits >> (127 - u32::from(depth))) & 1 == 1)
    }

    /// Insert a prefix. An existing value for the exact same prefix is kept.
    pub fn insert(&mut self, net: IpNet, value: usize) {
        let bits = Self::bits(net.network());
        let len = net.prefix_len().min(self.width);
        let mut node = 0usize;
        for depth in 0..len {
            let b = Self::bit(bits, depth);
            node = match self.nodes[node].children[b] {
                Some(next) => next as usize,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(Node::default());
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        self.nodes[node].children[b] = Some(next as u32);
                    }
                    next
                }
            };
        }
        self.nodes[node].value.get_or_insert(value);
    }

    /// Value of the longest prefix containing `addr`
    pub fn lookup(&self, addr: IpAddr) -> Option<usize> {
        let bits = Self::bits(addr);
        let mut node = 0usize;
        let mut best = self.nodes[0].value;
        for depth in 0..self.width {
            match self.nodes[node].children[Self::bit(bits, depth)] {
                Some(next) => node = next as usize,
                None => break,
            }
            if let Some(v) = self.nodes[node].value {
                best = Some(v);
            }
        }
        best
    }

    /// True if nothing was inserted
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1 && self.nodes[0].value.is_none()
    }
}

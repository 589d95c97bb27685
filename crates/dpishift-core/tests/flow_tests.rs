//! Integration tests for the flow reassembler

use dpishift_core::packet::{FlowKey, Protocol};
use dpishift_core::sni::{self, ClientHelloBuilder};
use dpishift_core::FlowTable;
use proptest::prelude::*;
use std::time::{Duration, Instant};

fn key(port: u16) -> FlowKey {
    FlowKey::new(
        Protocol::Tcp,
        format!("192.168.1.20:{port}").parse().unwrap(),
        "93.184.216.34:443".parse().unwrap(),
    )
}

#[test]
fn test_max_ru_split_mid_extension() {
    let hello = ClientHelloBuilder::new("max.ru").build();
    let parsed = sni::parse_client_hello(&hello).unwrap();
    // Cut inside the server_name extension, two bytes into the name
    let cut = parsed.sni.unwrap().start + 2;

    let mut table = FlowTable::new();
    let now = Instant::now();
    assert!(table.feed(key(1), &hello[..cut], now).is_none());
    assert_eq!(table.feed(key(1), &hello[cut..], now).as_deref(), Some("max.ru"));
    assert!(table.is_empty());
}

#[test]
fn test_entry_expires_without_name() {
    let hello = ClientHelloBuilder::new("slow.example").build();
    let mut table = FlowTable::with_limits(4096, Duration::from_secs(10));
    let start = Instant::now();
    table.feed(key(1), &hello[..30], start);

    assert_eq!(table.sweep(start + Duration::from_secs(11)), 1);
    // The tail alone no longer starts a record
    assert!(table
        .feed(key(1), &hello[30..], start + Duration::from_secs(12))
        .is_none());
}

#[test]
fn test_ech_without_sni_released() {
    let mut builder = ClientHelloBuilder::new("unused.example");
    builder.extensions_mut().retain(|(ty, _)| *ty != 0x0000);
    let hello = builder.extension(0xfe0d, vec![1; 64]).build();

    let mut table = FlowTable::new();
    assert!(table.feed(key(1), &hello, Instant::now()).is_none());
    assert!(table.is_empty());
}

proptest! {
    #[test]
    fn prop_chunked_feed_matches_whole(
        host in "[a-z]{1,12}(\\.[a-z]{1,8}){1,3}",
        cuts in prop::collection::vec(1usize..400, 1..6),
    ) {
        let hello = ClientHelloBuilder::new(&host).build();
        let whole = sni::extract_sni(&hello);
        prop_assert_eq!(whole.as_deref(), Some(host.as_str()));

        let mut bounds: Vec<usize> = cuts.into_iter().filter(|&c| c < hello.len()).collect();
        bounds.push(0);
        bounds.push(hello.len());
        bounds.sort_unstable();
        bounds.dedup();

        let mut table = FlowTable::new();
        let now = Instant::now();
        let found = bounds
            .windows(2)
            .find_map(|w| table.feed(key(7), &hello[w[0]..w[1]], now));
        prop_assert_eq!(found, whole);
    }
}

//! Scenario 6 end-to-end: two probes sharing one UDP listen address via
//! disjoint `accept-from-host` sets. A datagram from a host neither probe
//! claims must never reach either source, while datagrams from a claimed
//! host land on the right one — driven through the real config parser and
//! the real listener fabric, with actual loopback sockets.

use std::net::UdpSocket;
use std::path::Path;
use std::time::Duration;

use flowpack::config::{parse_config, FileLoader};
use flowpack::supervisor::Collector;

struct OneFile(&'static str);

impl FileLoader for OneFile {
    fn load(&self, path: &Path) -> std::io::Result<String> {
        if path == Path::new("main.conf") {
            Ok(self.0.to_string())
        } else {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such config file"))
        }
    }
}

/// A minimal well-formed NetFlow v5 datagram: one record, all zeroed
/// fields except what `decode_packet` itself validates.
fn nfv5_packet() -> Vec<u8> {
    let mut buf = vec![0u8; 24 + 48];
    buf[0..2].copy_from_slice(&5u16.to_be_bytes()); // version
    buf[2..4].copy_from_slice(&1u16.to_be_bytes()); // count
    buf[4..8].copy_from_slice(&100_000u32.to_be_bytes()); // SysUptime
    buf[8..12].copy_from_slice(&1_600_000_000u32.to_be_bytes()); // unix_secs
    // record: src_addr 10.0.0.1, dst_addr 10.0.0.2, protocol tcp, ports
    buf[24..28].copy_from_slice(&0x0A000001u32.to_be_bytes());
    buf[28..32].copy_from_slice(&0x0A000002u32.to_be_bytes());
    buf[24 + 16..24 + 20].copy_from_slice(&5u32.to_be_bytes()); // dPkts
    buf[24 + 20..24 + 24].copy_from_slice(&500u32.to_be_bytes()); // dOctets
    buf[24 + 24..24 + 28].copy_from_slice(&10_000u32.to_be_bytes()); // First
    buf[24 + 28..24 + 32].copy_from_slice(&20_000u32.to_be_bytes()); // Last
    buf[24 + 32..24 + 34].copy_from_slice(&1024u16.to_be_bytes()); // srcport
    buf[24 + 34..24 + 36].copy_from_slice(&80u16.to_be_bytes()); // dstport
    buf[24 + 38] = 6; // protocol tcp
    buf
}

fn config(port: u16) -> String {
    format!(
        r#"
        probe P1 netflow-v5
            protocol udp
            listen-as-host 127.0.0.1
            listen-on-port {port}
            accept-from-host 127.0.0.1
        end probe

        probe P2 netflow-v5
            protocol udp
            listen-as-host 127.0.0.1
            listen-on-port {port}
            accept-from-host 127.0.0.2
        end probe

        sensor S1
            source-network external
            destination-network internal
            probes netflow-v5 P1
        end sensor

        sensor S2
            source-network external
            destination-network internal
            probes netflow-v5 P2
        end sensor
        "#
    )
}

#[test]
fn unclaimed_peer_never_reaches_either_source() {
    // A fixed, uncommon loopback port: low risk of a real collision, and
    // picking one up front lets both probes share it in the config text.
    let port = 18995;
    let config_text = config(port);
    let loader = OneFile(Box::leak(config_text.into_boxed_str()));

    let registry = parse_config(Path::new("main.conf"), &loader, |name| match name {
        "S1" => Some(1),
        "S2" => Some(2),
        _ => None,
    })
    .expect("config should parse cleanly");

    let collector = Collector::start(registry).expect("collector should start");

    let p1 = collector.registry.probe_by_name("P1").unwrap();
    let p2 = collector.registry.probe_by_name("P2").unwrap();

    // 127.0.0.3 is claimed by neither probe's accept-from-host: the
    // datagram must be dropped by both.
    let unknown = UdpSocket::bind("127.0.0.3:0").expect("bind unknown-host client socket");
    unknown
        .send_to(&nfv5_packet(), ("127.0.0.1", port))
        .expect("send datagram from unclaimed host");
    std::thread::sleep(Duration::from_millis(600));

    // 127.0.0.2 is P2's accept-from-host.
    let p2_client = UdpSocket::bind("127.0.0.2:0").expect("bind P2 client socket");
    p2_client
        .send_to(&nfv5_packet(), ("127.0.0.1", port))
        .expect("send datagram from P2's claimed host");
    std::thread::sleep(Duration::from_millis(600));

    let record = collector
        .next_record(p2)
        .expect("P2 should have received the datagram from its claimed host");
    assert_eq!(record.packets, 5);
    assert_eq!(record.bytes, 500);

    // P1's source must not have received anything from either datagram: a
    // non-blocking peek via a short-lived poll is not available on
    // `Source`, so stop the collector and confirm the ring drains to
    // `Stopped` with nothing buffered instead.
    collector.stop();
    assert!(matches!(
        collector.next_record(p1),
        Err(flowpack::SourceError::Stopped)
    ));
}

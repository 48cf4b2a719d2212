//! Drives the full C7 → file-mode source decode → C6 pipeline end to end:
//! parse a probe/group/sensor config, decode a file-backed NFv5 record
//! through the resulting `Source`, and classify it against two sensors —
//! one that accepts it, one that discards it via an ipblock-based filter.

use std::io::Write;
use std::path::Path;

use flowpack::config::{parse_config, FileLoader};
use flowpack::supervisor::Collector;
use flowpack::classifier::{classify, SensorOutcome};

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

fn nfv5_packet() -> Vec<u8> {
    let mut buf = vec![0u8; 24 + 48];
    buf[0..2].copy_from_slice(&5u16.to_be_bytes());
    buf[2..4].copy_from_slice(&1u16.to_be_bytes());
    buf[4..8].copy_from_slice(&100_000u32.to_be_bytes());
    buf[8..12].copy_from_slice(&1_600_000_000u32.to_be_bytes());
    buf[24..28].copy_from_slice(&0x0A000001u32.to_be_bytes()); // src 10.0.0.1
    buf[28..32].copy_from_slice(&0xC0A80001u32.to_be_bytes()); // dst 192.168.0.1
    buf[24 + 16..24 + 20].copy_from_slice(&5u32.to_be_bytes());
    buf[24 + 20..24 + 24].copy_from_slice(&500u32.to_be_bytes());
    buf[24 + 24..24 + 28].copy_from_slice(&10_000u32.to_be_bytes());
    buf[24 + 28..24 + 32].copy_from_slice(&20_000u32.to_be_bytes());
    buf[24 + 38] = 6;
    buf
}

#[test]
fn accept_and_discard_sensors_diverge_on_the_same_record() {
    let record_file = tempfile::NamedTempFile::new().expect("create temp record file");
    record_file.as_file().write_all(&nfv5_packet()).expect("write record bytes");

    let config_text = format!(
        r#"
        group GSRC
            ipblocks 10.0.0.x
        end group

        probe P0 netflow-v5
            protocol udp
            read-from-file "{path}"
        end probe

        sensor ACCEPT
            external-ipblocks @GSRC
            destination-network internal
            probes netflow-v5 P0
        end sensor

        sensor REJECT
            external-ipblocks @GSRC
            destination-network internal
            discard-when source @GSRC
            probes netflow-v5 P0
        end sensor
        "#,
        path = record_file.path().display()
    );
    let loader = OneFile(Box::leak(config_text.into_boxed_str()));

    let registry = parse_config(Path::new("main.conf"), &loader, |name| match name {
        "ACCEPT" => Some(1),
        "REJECT" => Some(2),
        _ => None,
    })
    .expect("config should parse cleanly");

    let collector = Collector::start(registry).expect("collector should start");
    let probe_id = collector.registry.probe_by_name("P0").unwrap();

    let record = collector
        .next_record(probe_id)
        .expect("file source should decode its one record");

    let probe = collector.registry.probe(probe_id);
    let outcomes = classify(&record, probe, &collector.registry);
    assert_eq!(outcomes.len(), 2);

    let accept_sensor = collector.registry.sensor_by_name("ACCEPT").unwrap();
    let reject_sensor = collector.registry.sensor_by_name("REJECT").unwrap();

    let accept_outcome = outcomes.iter().find(|(id, _)| *id == accept_sensor).unwrap().1;
    let reject_outcome = outcomes.iter().find(|(id, _)| *id == reject_sensor).unwrap().1;

    assert!(matches!(accept_outcome, SensorOutcome::Accepted { .. }));
    assert_eq!(reject_outcome, SensorOutcome::Discarded);
}

//! C3: NetFlow v5 datagram decoding and per-engine session state.
//!
//! Wire format per §6: a fixed 24-byte header followed by 1..30 48-byte
//! records, network byte order throughout. Decoding is two-phase: the
//! datagram is validated as a whole (`decode_packet`), then each record is
//! reconstructed against the engine's running session state
//! (`Session::ingest_record`), which is where sequence tracking and
//! timestamp rollover reconstruction happen.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

use crate::error::{BadPacketReason, BadRecordReason};
use crate::flow::{FlowEndReason, FlowRecord, InterfaceValue, TcpFlags};
use crate::ratelimit::RateLimitedLog;

const HEADER_LEN: usize = 24;
const RECORD_LEN: usize = 48;
const MAX_RECORDS: usize = 30;

/// A 64-bit millisecond clock that can represent values at or beyond the
/// 32-bit wraparound point a raw `SysUptime`/`First`/`Last` field hits
/// every ~49.7 days.
type Ms64 = i64;

const TWO_POW_32: i64 = 1 << 32;

/// A validated, still-raw NetFlow v5 header.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub count: u16,
    pub sys_uptime_ms: u32,
    pub unix_secs: u32,
    pub unix_nsecs: u32,
    pub flow_sequence: u32,
    pub engine_type: u8,
    pub engine_id: u8,
    pub sampling_interval: u16,
}

/// One still-raw flow record, exactly as laid out on the wire.
#[derive(Debug, Clone, Copy)]
pub struct RawRecord {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub next_hop: u32,
    pub input: u16,
    pub output: u16,
    pub d_pkts: u32,
    pub d_octets: u32,
    pub first: u32,
    pub last: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_flags: u8,
    pub protocol: u8,
    pub tos: u8,
}

/// Parses and validates a datagram's framing, per §4.3 "Datagram
/// validation". Does not yet touch per-record content.
pub fn decode_packet(buf: &[u8]) -> Result<(Header, Vec<RawRecord>), BadPacketReason> {
    if buf.len() < HEADER_LEN {
        return Err(BadPacketReason::HeaderTooShort);
    }
    let version = u16::from_be_bytes([buf[0], buf[1]]);
    if version != 5 {
        return Err(BadPacketReason::BadVersion);
    }
    let count = u16::from_be_bytes([buf[2], buf[3]]);
    if count == 0 {
        return Err(BadPacketReason::ZeroRecordCount);
    }
    if count as usize > MAX_RECORDS {
        return Err(BadPacketReason::RecordCountTooLarge);
    }
    let expected_len = HEADER_LEN + count as usize * RECORD_LEN;
    if buf.len() != expected_len {
        return Err(BadPacketReason::LengthMismatch);
    }

    let header = Header {
        count,
        sys_uptime_ms: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
        unix_secs: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
        unix_nsecs: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        flow_sequence: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        engine_type: buf[20],
        engine_id: buf[21],
        sampling_interval: u16::from_be_bytes(buf[22..24].try_into().unwrap()),
    };

    let mut records = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let r = &buf[HEADER_LEN + i * RECORD_LEN..HEADER_LEN + (i + 1) * RECORD_LEN];
        records.push(RawRecord {
            src_addr: u32::from_be_bytes(r[0..4].try_into().unwrap()),
            dst_addr: u32::from_be_bytes(r[4..8].try_into().unwrap()),
            next_hop: u32::from_be_bytes(r[8..12].try_into().unwrap()),
            input: u16::from_be_bytes(r[12..14].try_into().unwrap()),
            output: u16::from_be_bytes(r[14..16].try_into().unwrap()),
            d_pkts: u32::from_be_bytes(r[16..20].try_into().unwrap()),
            d_octets: u32::from_be_bytes(r[20..24].try_into().unwrap()),
            first: u32::from_be_bytes(r[24..28].try_into().unwrap()),
            last: u32::from_be_bytes(r[28..32].try_into().unwrap()),
            src_port: u16::from_be_bytes(r[32..34].try_into().unwrap()),
            dst_port: u16::from_be_bytes(r[34..36].try_into().unwrap()),
            // r[36] is the padding byte.
            tcp_flags: r[37],
            protocol: r[38],
            tos: r[39],
        });
    }
    Ok((header, records))
}

/// Key identifying one independent export pipeline from a single exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineKey {
    pub engine_type: u8,
    pub engine_id: u8,
}

impl EngineKey {
    pub fn from_header(header: &Header) -> Self {
        EngineKey {
            engine_type: header.engine_type,
            engine_id: header.engine_id,
        }
    }
}

/// Thresholds governing sequence-gap classification (§4.3). Exposed as
/// configuration per the spec's open question: they encode a legacy
/// assumption of ~1k flows/s and a real deployment may need to retune them.
#[derive(Debug, Clone, Copy)]
pub struct SequenceThresholds {
    pub gap: u32,
    pub late: u32,
}

impl Default for SequenceThresholds {
    fn default() -> Self {
        SequenceThresholds {
            gap: 3_600_000,
            late: 60_000,
        }
    }
}

/// Router-reboot detection threshold, in ms, default 1000 per §4.3.
const REBOOT_THRESHOLD_MS: i64 = 1_000;

/// 45-day deviation threshold (ms) used to decide whether `First`/`Last`
/// appear to have rolled over relative to `sysUptime`.
const ROLLOVER_DEVIATION_MS: i64 = 45 * 24 * 60 * 60 * 1000;

#[derive(Debug)]
struct EngineState {
    expected_next: u32,
    router_boot_ms: Ms64,
    last_seen_uptime_ms: u32,
    seeded: bool,
}

/// Per-source NFv5 session: one `EngineState` per `(engine_type,
/// engine_id)` plus the rate-limited bad-packet/bad-record logging and
/// aggregate counters described in §7.
pub struct Session {
    engines: Mutex<HashMap<EngineKey, EngineState>>,
    thresholds: SequenceThresholds,
    bad_packet_log: Mutex<RateLimitedLog<BadPacketReason>>,
    stats: Mutex<SessionStats>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub bad_packets: u64,
    pub bad_records: u64,
    pub missing: u64,
}

impl Default for Session {
    fn default() -> Self {
        Session::new(SequenceThresholds::default())
    }
}

impl Session {
    pub fn new(thresholds: SequenceThresholds) -> Self {
        Session {
            engines: Mutex::new(HashMap::new()),
            thresholds,
            bad_packet_log: Mutex::new(RateLimitedLog::new()),
            stats: Mutex::new(SessionStats::default()),
        }
    }

    pub fn stats(&self) -> SessionStats {
        *self.stats.lock().expect("session stats mutex poisoned")
    }

    /// Snapshots and zeroes the stats, as `SourceLogStatsAndClear` does for
    /// the whole source (§6 CLI surface / (expansion) Supplemented
    /// features).
    pub fn take_stats(&self) -> SessionStats {
        let mut stats = self.stats.lock().expect("session stats mutex poisoned");
        std::mem::take(&mut *stats)
    }

    /// Decodes a whole datagram: validates framing, then folds every
    /// record through the owning engine's session state. Bad-packet
    /// rejections are absorbed here (never raised to the caller) per §7's
    /// propagation policy; only well-formed, well-ordered flow records are
    /// returned.
    pub fn ingest_packet(&self, buf: &[u8]) -> Vec<FlowRecord> {
        match decode_packet(buf) {
            Ok((header, records)) => {
                if let Some((prev, count)) =
                    self.bad_packet_log.lock().expect("poisoned").clear()
                {
                    tracing::info!(reason = prev.as_str(), count, "bad packets recovered");
                }
                let mut out = Vec::with_capacity(records.len());
                for raw in records {
                    if let Some(rec) = self.ingest_record(&header, raw) {
                        out.push(rec);
                    }
                }
                out
            }
            Err(reason) => {
                self.stats.lock().expect("poisoned").bad_packets += 1;
                match self.bad_packet_log.lock().expect("poisoned").record(reason) {
                    crate::ratelimit::Transition::First => {
                        tracing::warn!(reason = reason.as_str(), "bad NetFlow v5 packet");
                    }
                    crate::ratelimit::Transition::Changed {
                        previous,
                        previous_count,
                    } => {
                        tracing::warn!(
                            reason = previous.as_str(),
                            count = previous_count,
                            "bad NetFlow v5 packets (aggregate)"
                        );
                        tracing::warn!(reason = reason.as_str(), "bad NetFlow v5 packet");
                    }
                    crate::ratelimit::Transition::Repeat => {}
                }
                Vec::new()
            }
        }
    }

    fn ingest_record(&self, header: &Header, raw: RawRecord) -> Option<FlowRecord> {
        let engine_key = EngineKey::from_header(header);
        let now_ms: Ms64 =
            i64::from(header.unix_secs) * 1000 + i64::from(header.unix_nsecs) / 1_000_000;
        let router_boot_ms = now_ms - i64::from(header.sys_uptime_ms);

        let mut engines = self.engines.lock().expect("engine map mutex poisoned");
        let engine = engines.entry(engine_key).or_insert_with(|| EngineState {
            expected_next: header.flow_sequence,
            router_boot_ms,
            last_seen_uptime_ms: header.sys_uptime_ms,
            seeded: true,
        });

        if engine.seeded && (router_boot_ms - engine.router_boot_ms).abs() > REBOOT_THRESHOLD_MS {
            tracing::info!(
                engine_type = engine_key.engine_type,
                engine_id = engine_key.engine_id,
                previous_boot_ms = engine.router_boot_ms,
                new_boot_ms = router_boot_ms,
                "router reboot detected"
            );
            engine.router_boot_ms = router_boot_ms;
            engine.expected_next = header.flow_sequence;
        }
        engine.last_seen_uptime_ms = header.sys_uptime_ms;

        track_sequence(
            engine,
            header.flow_sequence,
            u32::from(header.count),
            self.thresholds,
            &mut self.stats.lock().expect("poisoned"),
        );

        let router_boot_ms = engine.router_boot_ms;
        drop(engines);

        self.finish_record(router_boot_ms, header, raw)
    }

    fn finish_record(
        &self,
        router_boot_ms: Ms64,
        header: &Header,
        raw: RawRecord,
    ) -> Option<FlowRecord> {
        let (first, last) = reconstruct_rollover(header.sys_uptime_ms, raw.first, raw.last);

        if let Err(reason) = validate_record(&raw, first, last) {
            self.stats.lock().expect("poisoned").bad_records += 1;
            tracing::debug!(reason = reason.as_str(), "bad NetFlow v5 record");
            return None;
        }

        let (mut src_port, mut dst_port) = (raw.src_port, raw.dst_port);
        if raw.protocol == 1 && dst_port == 0 {
            // ICMP: some exporters place type/code in the source port with
            // a zero destination port; byte-swap the pair to correct it.
            std::mem::swap(&mut src_port, &mut dst_port);
        }

        Some(FlowRecord {
            src_ip: IpAddr::V4(Ipv4Addr::from(raw.src_addr)),
            dst_ip: IpAddr::V4(Ipv4Addr::from(raw.dst_addr)),
            src_port,
            dst_port,
            protocol: raw.protocol,
            tcp_flags: TcpFlags {
                all: raw.tcp_flags,
                initial: raw.tcp_flags,
                session: raw.tcp_flags,
            },
            input_iface: InterfaceValue::Snmp(u32::from(raw.input)),
            output_iface: InterfaceValue::Snmp(u32::from(raw.output)),
            packets: u64::from(raw.d_pkts),
            bytes: u64::from(raw.d_octets),
            start_ms: router_boot_ms + first,
            duration_ms: (last - first) as u32,
            next_hop: if raw.next_hop == 0 {
                None
            } else {
                Some(IpAddr::V4(Ipv4Addr::from(raw.next_hop)))
            },
            tcp_state: 0,
            sensor_tag: None,
            application: None,
            end_reason: FlowEndReason::Unknown,
        })
    }
}

/// Reconstructs `(First, Last)` across 32-bit millisecond rollover, per
/// §4.3. Both inputs are raw wire values; output is in the same ms-since-
/// boot space but may exceed `u32::MAX`.
fn reconstruct_rollover(sys_uptime_ms: u32, first: u32, last: u32) -> (Ms64, Ms64) {
    let mut first = i64::from(first);
    let mut last = i64::from(last);

    if last < first {
        last += TWO_POW_32;
    }

    let uptime = i64::from(sys_uptime_ms);
    let deviation = uptime - first;
    if deviation < -ROLLOVER_DEVIATION_MS {
        // `First` looks like it rolled over ahead of `sysUptime`.
        first += TWO_POW_32;
        last += TWO_POW_32;
    } else if deviation > ROLLOVER_DEVIATION_MS {
        // `sysUptime` looks like it rolled over relative to `First`.
        first -= TWO_POW_32;
        last -= TWO_POW_32;
    }

    (first, last)
}

fn validate_record(raw: &RawRecord, first: Ms64, last: Ms64) -> Result<(), BadRecordReason> {
    if raw.d_pkts == 0 {
        return Err(BadRecordReason::ZeroPackets);
    }
    if raw.d_octets == 0 {
        return Err(BadRecordReason::ZeroBytes);
    }
    if u64::from(raw.d_pkts) > u64::from(raw.d_octets) {
        return Err(BadRecordReason::MorePacketsThanBytes);
    }
    if first > last {
        return Err(BadRecordReason::EndBeforeStart);
    }
    Ok(())
}

/// Updates `engine.expected_next` and `stats.missing` for one packet's
/// worth of records, per the six-way sequence classification in §4.3.
///
/// `diff` is always computed as a plain, non-wrapping distance between the
/// two sequence numbers on whichever side is numerically ahead; "close to
/// the wrap" means `2^32 - diff` is small, i.e. the *other* interpretation
/// of the same two numbers (as if one of them had wrapped) would be a much
/// shorter, more plausible distance.
fn track_sequence(
    engine: &mut EngineState,
    sequence: u32,
    count: u32,
    thresholds: SequenceThresholds,
    stats: &mut SessionStats,
) {
    let expected = engine.expected_next;
    if sequence == expected {
        engine.expected_next = expected.wrapping_add(count);
        return;
    }

    let gap = i64::from(thresholds.gap);
    let late = i64::from(thresholds.late);

    if sequence > expected {
        let diff = i64::from(sequence) - i64::from(expected);
        if diff < gap {
            // Ordinary forward gap: some packets were lost.
            stats.missing += diff as u64;
            engine.expected_next = sequence.wrapping_add(count);
        } else if TWO_POW_32 - diff < late {
            // `sequence` is actually a straggler from just before the
            // counter wrapped; `expected_next` has already moved past it.
            stats.missing = stats.missing.saturating_sub(u64::from(count));
        } else {
            // Gap too large to be loss or lateness: assume exporter restart.
            engine.expected_next = sequence.wrapping_add(count);
        }
        return;
    }

    let diff = i64::from(expected) - i64::from(sequence);
    if diff < late {
        // A recent duplicate/reordered packet.
        stats.missing = stats.missing.saturating_sub(u64::from(count));
    } else if TWO_POW_32 - diff < gap {
        // `expected_next` was close to the wrap and `sequence` is the
        // continuation just after it; the real gap is the short way round.
        stats.missing += (TWO_POW_32 - diff) as u64;
        engine.expected_next = sequence.wrapping_add(count);
    } else {
        engine.expected_next = sequence.wrapping_add(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_packet(
        sys_uptime_ms: u32,
        unix_secs: u32,
        unix_nsecs: u32,
        sequence: u32,
        engine_type: u8,
        engine_id: u8,
        records: &[RawRecord],
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + records.len() * RECORD_LEN);
        buf.extend_from_slice(&5u16.to_be_bytes());
        buf.extend_from_slice(&(records.len() as u16).to_be_bytes());
        buf.extend_from_slice(&sys_uptime_ms.to_be_bytes());
        buf.extend_from_slice(&unix_secs.to_be_bytes());
        buf.extend_from_slice(&unix_nsecs.to_be_bytes());
        buf.extend_from_slice(&sequence.to_be_bytes());
        buf.push(engine_type);
        buf.push(engine_id);
        buf.extend_from_slice(&0u16.to_be_bytes());
        for r in records {
            buf.extend_from_slice(&r.src_addr.to_be_bytes());
            buf.extend_from_slice(&r.dst_addr.to_be_bytes());
            buf.extend_from_slice(&r.next_hop.to_be_bytes());
            buf.extend_from_slice(&r.input.to_be_bytes());
            buf.extend_from_slice(&r.output.to_be_bytes());
            buf.extend_from_slice(&r.d_pkts.to_be_bytes());
            buf.extend_from_slice(&r.d_octets.to_be_bytes());
            buf.extend_from_slice(&r.first.to_be_bytes());
            buf.extend_from_slice(&r.last.to_be_bytes());
            buf.extend_from_slice(&r.src_port.to_be_bytes());
            buf.extend_from_slice(&r.dst_port.to_be_bytes());
            buf.push(0); // pad
            buf.push(r.tcp_flags);
            buf.push(r.protocol);
            buf.push(r.tos);
            buf.extend_from_slice(&0u16.to_be_bytes()); // src_as
            buf.extend_from_slice(&0u16.to_be_bytes()); // dst_as
            buf.push(0); // src_mask
            buf.push(0); // dst_mask
            buf.extend_from_slice(&0u16.to_be_bytes()); // pad2
        }
        buf
    }

    fn sample_raw() -> RawRecord {
        RawRecord {
            src_addr: 0x0A000001,
            dst_addr: 0x0A000002,
            next_hop: 0,
            input: 1,
            output: 2,
            d_pkts: 5,
            d_octets: 500,
            first: 10_000,
            last: 20_000,
            src_port: 1024,
            dst_port: 80,
            tcp_flags: 0,
            protocol: 6,
            tos: 0,
        }
    }

    #[test]
    fn scenario_1_well_formed_packet() {
        let buf = build_packet(100_000, 1_600_000_000, 0, 0, 0, 1, &[sample_raw()]);
        let session = Session::default();
        let records = session.ingest_packet(&buf);
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.start_ms, 1_599_999_910_000);
        assert_eq!(rec.duration_ms, 10_000);
        assert_eq!(rec.packets, 5);
        assert_eq!(rec.bytes, 500);
        assert_eq!(rec.protocol, 6);
        assert_eq!(rec.src_port, 1024);
        assert_eq!(rec.dst_port, 80);
    }

    #[test]
    fn scenario_2_rollover_within_flow() {
        let mut raw = sample_raw();
        raw.first = 0xFFFFF000;
        raw.last = 0x00001000;
        let buf = build_packet(0xFFFFF000, 1_600_000_000, 0, 0, 0, 1, &[raw]);
        let session = Session::default();
        let records = session.ingest_packet(&buf);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].duration_ms, 0x2000);
    }

    #[test]
    fn scenario_3_sequence_gap_counts_missing() {
        let session = Session::default();
        let buf_a = build_packet(100_000, 1_600_000_000, 0, 100, 0, 1, &[sample_raw(); 10]);
        session.ingest_packet(&buf_a);
        assert_eq!(session.stats().missing, 0);

        let buf_b = build_packet(110_000, 1_600_000_010, 0, 130, 0, 1, &[sample_raw(); 10]);
        session.ingest_packet(&buf_b);
        assert_eq!(session.stats().missing, 20);
    }

    #[test]
    fn scenario_4_router_reboot_reseeds_sequence() {
        let session = Session::default();
        let buf_a = build_packet(900_000, 1000, 0, 500, 0, 1, &[sample_raw()]);
        session.ingest_packet(&buf_a);

        // unix=1001s, sysUptime=1000ms -> router_boot ~= 1000s, an 900s jump.
        let buf_b = build_packet(1_000, 1001, 0, 900, 0, 1, &[sample_raw()]);
        session.ingest_packet(&buf_b);

        let engines = session.engines.lock().unwrap();
        let engine = engines
            .get(&EngineKey {
                engine_type: 0,
                engine_id: 1,
            })
            .unwrap();
        assert_eq!(engine.expected_next, 900u32.wrapping_add(1));
    }

    #[test]
    fn bad_version_is_rejected_without_panicking() {
        let mut buf = build_packet(0, 0, 0, 0, 0, 0, &[sample_raw()]);
        buf[1] = 4; // version field low byte -> version 4
        let session = Session::default();
        assert!(session.ingest_packet(&buf).is_empty());
        assert_eq!(session.stats().bad_packets, 1);
    }

    #[test]
    fn zero_record_count_is_rejected() {
        assert_eq!(
            decode_packet(&[0, 5, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(BadPacketReason::ZeroRecordCount)
        );
    }

    #[test]
    fn icmp_port_swap_applied_when_dst_port_zero() {
        let mut raw = sample_raw();
        raw.protocol = 1;
        raw.src_port = 0x0803; // type 8, code 3
        raw.dst_port = 0;
        let buf = build_packet(100_000, 1_600_000_000, 0, 0, 0, 1, &[raw]);
        let session = Session::default();
        let records = session.ingest_packet(&buf);
        assert_eq!(records[0].src_port, 0);
        assert_eq!(records[0].dst_port, 0x0803);
    }
}

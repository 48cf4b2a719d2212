//! C6: for each decoded record, decide which sensor(s) consuming its probe
//! claim it, assign a source/destination network, and apply discard
//! filters in order.

use crate::flow::FlowRecord;
use crate::group::GroupKind;
use crate::network::NetworkId;
use crate::probe::{InterfaceValueKind, Probe};
use crate::registry::Registry;
use crate::sensor::{Decider, Filter, FilterSide, Polarity, Sensor, SensorId};

/// Which side of the flow a decider/filter test is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Source,
    Destination,
}

/// Outcome of classifying one record against one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorOutcome {
    /// The record survived and is bound for the downstream packer, tagged
    /// with the decided source/destination networks (the sensor itself is
    /// the caller's own lookup key, see `classify`'s return tuple).
    Accepted {
        source_network: NetworkId,
        dest_network: NetworkId,
    },
    /// Neither side could be classified onto any network.
    Ignored,
    /// A side was classified but a discard filter rejected the record.
    Discarded,
}

/// Classifies `record` (arriving on `probe`) against every sensor in
/// `probe.sensors`, in registration order, returning one outcome per
/// sensor.
pub fn classify(
    record: &FlowRecord,
    probe: &Probe,
    registry: &Registry,
) -> Vec<(SensorId, SensorOutcome)> {
    probe
        .sensors
        .iter()
        .map(|&sensor_id| {
            let sensor = registry.sensor(sensor_id);
            (sensor_id, classify_for_sensor(record, probe, sensor, registry))
        })
        .collect()
}

fn classify_for_sensor(
    record: &FlowRecord,
    probe: &Probe,
    sensor: &Sensor,
    registry: &Registry,
) -> SensorOutcome {
    let source_network = sensor
        .fixed_source_network
        .or_else(|| decide_network(record, probe, sensor, registry, Side::Source));
    let dest_network = sensor
        .fixed_dest_network
        .or_else(|| decide_network(record, probe, sensor, registry, Side::Destination));

    let (Some(source_network), Some(dest_network)) = (source_network, dest_network) else {
        return SensorOutcome::Ignored;
    };

    for filter in &sensor.filters {
        if filter_matches(filter, record, probe, registry) {
            let survives = match filter.polarity {
                Polarity::DiscardWhen => false,
                Polarity::DiscardUnless => true,
            };
            if !survives {
                return SensorOutcome::Discarded;
            }
        } else if filter.polarity == Polarity::DiscardUnless {
            return SensorOutcome::Discarded;
        }
    }

    SensorOutcome::Accepted {
        source_network,
        dest_network,
    }
}

/// Decides `side`'s network for `record` against `sensor`, honoring
/// registration order as the tie-break when multiple networks' deciders
/// would match (§4.5: "the one declared first in configuration wins").
fn decide_network(
    record: &FlowRecord,
    probe: &Probe,
    sensor: &Sensor,
    registry: &Registry,
    side: Side,
) -> Option<NetworkId> {
    for &(network, ref decider) in &sensor.deciders {
        if decider_matches(decider, sensor, network, record, probe, registry, side) {
            return Some(network);
        }
    }
    None
}

#[allow(clippy::too_many_arguments)]
fn decider_matches(
    decider: &Decider,
    sensor: &Sensor,
    network: NetworkId,
    record: &FlowRecord,
    probe: &Probe,
    registry: &Registry,
    side: Side,
) -> bool {
    match decider {
        Decider::Unset => false,
        Decider::Interface(group) => match interface_of(record, probe, side) {
            Some(idx) => registry.group(*group).contains_interface(idx).unwrap_or(false),
            None => false,
        },
        Decider::Ipblock(group) | Decider::Ipset(group) => {
            let ip = ip_of(record, side);
            registry.group(*group).contains_ip(ip).unwrap_or(false)
        }
        Decider::RemainderInterface => match (sensor.remainder_group(network), interface_of(record, probe, side)) {
            (Some(g), Some(idx)) => g.contains_interface(idx).unwrap_or(false),
            _ => false,
        },
        Decider::RemainderIpblock | Decider::RemainderIpset => {
            // Not materialized as a concrete group (see sensor::verify): a
            // record belongs to the remainder network iff no sibling
            // decider of the same kind claims it.
            let ip = ip_of(record, side);
            !sensor.deciders.iter().any(|(n, d)| {
                *n != network
                    && matches!(d, Decider::Ipblock(_) | Decider::Ipset(_))
                    && match d {
                        Decider::Ipblock(g) | Decider::Ipset(g) => {
                            registry.group(*g).contains_ip(ip).unwrap_or(false)
                        }
                        _ => false,
                    }
            })
        }
    }
}

fn interface_of(record: &FlowRecord, probe: &Probe, side: Side) -> Option<u32> {
    if !matches!(probe.interface_values, InterfaceValueKind::Snmp) {
        return None;
    }
    match side {
        Side::Source => record.input_iface.as_snmp(),
        Side::Destination => record.output_iface.as_snmp(),
    }
}

fn ip_of(record: &FlowRecord, side: Side) -> std::net::IpAddr {
    match side {
        Side::Source => record.src_ip,
        Side::Destination => record.dst_ip,
    }
}

fn filter_matches(filter: &Filter, record: &FlowRecord, probe: &Probe, registry: &Registry) -> bool {
    let group = registry.group(filter.group);
    let test_side = |side: Side| match group.kind() {
        GroupKind::Interface(_) => interface_of(record, probe, side)
            .map(|idx| group.contains_interface(idx).unwrap_or(false))
            .unwrap_or(false),
        GroupKind::Ipblock(_) | GroupKind::IpSet(_) => {
            group.contains_ip(ip_of(record, side)).unwrap_or(false)
        }
    };
    match filter.side {
        FilterSide::Source => test_side(Side::Source),
        FilterSide::Destination => test_side(Side::Destination),
        FilterSide::Any => test_side(Side::Source) || test_side(Side::Destination),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowEndReason, InterfaceValue, TcpFlags};
    use crate::group::{Group, GroupKind, InterfaceBitmap};
    use crate::probe::{CollectionSource, ProbeType, Transport};
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_record() -> FlowRecord {
        FlowRecord {
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)),
            src_port: 1234,
            dst_port: 80,
            protocol: 6,
            tcp_flags: TcpFlags::default(),
            input_iface: InterfaceValue::Snmp(1),
            output_iface: InterfaceValue::Snmp(2),
            packets: 5,
            bytes: 500,
            start_ms: 1_000,
            duration_ms: 10,
            next_hop: None,
            tcp_state: 0,
            sensor_tag: None,
            application: None,
            end_reason: FlowEndReason::Unknown,
        }
    }

    fn sample_probe(sensors: Vec<SensorId>) -> Probe {
        let mut probe = Probe::new(
            "p0".into(),
            ProbeType::NetflowV5,
            Transport::Udp,
            CollectionSource::ReadFromFile("x".into()),
            InterfaceValueKind::Snmp,
        );
        probe.sensors = sensors;
        probe
    }

    #[test]
    fn ignored_when_neither_side_decided() {
        let reg = Registry::new();
        let sensor = Sensor::new("S0".into());
        let mut reg = reg;
        let id = reg.insert_sensor(sensor);
        let probe = sample_probe(vec![id]);
        let outcomes = classify(&sample_record(), &probe, &reg);
        assert_eq!(outcomes[0].1, SensorOutcome::Ignored);
    }

    #[test]
    fn accepted_with_fixed_networks() {
        let mut reg = Registry::new();
        let mut sensor = Sensor::new("S0".into());
        sensor.fixed_source_network = Some(0);
        sensor.fixed_dest_network = Some(1);
        let id = reg.insert_sensor(sensor);
        let probe = sample_probe(vec![id]);
        let outcomes = classify(&sample_record(), &probe, &reg);
        assert_eq!(
            outcomes[0].1,
            SensorOutcome::Accepted {
                source_network: 0,
                dest_network: 1,
            }
        );
    }

    #[test]
    fn discard_when_drops_matching_record() {
        let mut reg = Registry::new();
        let mut bm = InterfaceBitmap::default();
        bm.insert(1).unwrap();
        let group_id = reg.insert_group(Group::new(None, GroupKind::Interface(bm)));
        let mut sensor = Sensor::new("S0".into());
        sensor.fixed_source_network = Some(0);
        sensor.fixed_dest_network = Some(1);
        sensor.filters.push(Filter {
            group: group_id,
            side: FilterSide::Source,
            polarity: Polarity::DiscardWhen,
        });
        let id = reg.insert_sensor(sensor);
        let probe = sample_probe(vec![id]);
        let outcomes = classify(&sample_record(), &probe, &reg);
        assert_eq!(outcomes[0].1, SensorOutcome::Discarded);
    }

    #[test]
    fn first_registered_decider_wins_on_tie() {
        let mut reg = Registry::new();
        let mut bm = InterfaceBitmap::default();
        bm.insert(1).unwrap();
        let g1 = reg.insert_group(Group::new(None, GroupKind::Interface(bm.clone())));
        let g2 = reg.insert_group(Group::new(None, GroupKind::Interface(bm)));
        let mut sensor = Sensor::new("S0".into());
        sensor.deciders.push((0, Decider::Interface(g1)));
        sensor.deciders.push((1, Decider::Interface(g2)));
        sensor.fixed_dest_network = Some(2);
        let id = reg.insert_sensor(sensor);
        let probe = sample_probe(vec![id]);
        let outcomes = classify(&sample_record(), &probe, &reg);
        assert_eq!(
            outcomes[0].1,
            SensorOutcome::Accepted {
                source_network: 0,
                dest_network: 2,
            }
        );
    }

    #[test]
    fn fixed_network_wins_over_a_decider_for_a_different_network() {
        let mut reg = Registry::new();
        let mut bm = InterfaceBitmap::default();
        bm.insert(1).unwrap();
        let group_id = reg.insert_group(Group::new(None, GroupKind::Interface(bm)));
        let mut sensor = Sensor::new("S0".into());
        sensor.fixed_source_network = Some(0);
        sensor.fixed_dest_network = Some(1);
        // A decider for a network other than the fixed source network: it
        // would also match this record's source side, but the fixed pin is
        // authoritative and must be checked first.
        sensor.deciders.push((2, Decider::Interface(group_id)));
        let id = reg.insert_sensor(sensor);
        let probe = sample_probe(vec![id]);
        let outcomes = classify(&sample_record(), &probe, &reg);
        assert_eq!(
            outcomes[0].1,
            SensorOutcome::Accepted {
                source_network: 0,
                dest_network: 1,
            }
        );
    }
}

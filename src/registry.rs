//! The process-wide registry of probes, sensors, groups and networks.
//!
//! Per the design notes, cyclic sensor↔probe references are modeled as
//! indices into append-only arena tables rather than owning references, and
//! the whole thing is a single concrete `Registry` value threaded through
//! every constructor so tests can spin up an isolated instance instead of
//! reaching for process globals.

use std::collections::HashMap;
use std::sync::Arc;

use crate::group::Group;
use crate::network::NetworkTable;
use crate::probe::{Probe, ProbeId};
use crate::sensor::{Sensor, SensorId};

/// Id for a group within a `Registry`. Stable for the registry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u32);

/// Append-only tables for probes, sensors, groups and networks.
///
/// Mutated only during parse/verify, single-threaded; after startup the
/// supervisor treats it as read-only and shares it behind an `Arc`.
#[derive(Debug, Default)]
pub struct Registry {
    probes: Vec<Probe>,
    probes_by_name: HashMap<String, ProbeId>,
    sensors: Vec<Sensor>,
    sensors_by_name: HashMap<String, SensorId>,
    groups: Vec<Arc<Group>>,
    groups_by_name: HashMap<String, GroupId>,
    pub networks: NetworkTable,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    // -- probes --------------------------------------------------------

    pub fn insert_probe(&mut self, probe: Probe) -> ProbeId {
        let id = ProbeId(self.probes.len() as u32);
        self.probes_by_name.insert(probe.name.clone(), id);
        self.probes.push(probe);
        id
    }

    pub fn probe(&self, id: ProbeId) -> &Probe {
        &self.probes[id.index()]
    }

    pub fn probe_mut(&mut self, id: ProbeId) -> &mut Probe {
        &mut self.probes[id.index()]
    }

    pub fn probe_by_name(&self, name: &str) -> Option<ProbeId> {
        self.probes_by_name.get(name).copied()
    }

    pub fn probes(&self) -> impl Iterator<Item = (ProbeId, &Probe)> {
        self.probes
            .iter()
            .enumerate()
            .map(|(i, p)| (ProbeId::from_index(i), p))
    }

    // -- sensors ---------------------------------------------------------

    pub fn insert_sensor(&mut self, sensor: Sensor) -> SensorId {
        let id = SensorId(self.sensors.len() as u32);
        self.sensors_by_name.insert(sensor.name.clone(), id);
        self.sensors.push(sensor);
        id
    }

    pub fn sensor(&self, id: SensorId) -> &Sensor {
        &self.sensors[id.index()]
    }

    pub fn sensor_mut(&mut self, id: SensorId) -> &mut Sensor {
        &mut self.sensors[id.index()]
    }

    pub fn sensor_by_name(&self, name: &str) -> Option<SensorId> {
        self.sensors_by_name.get(name).copied()
    }

    pub fn sensors(&self) -> impl Iterator<Item = (SensorId, &Sensor)> {
        self.sensors
            .iter()
            .enumerate()
            .map(|(i, s)| (SensorId::from_index(i), s))
    }

    // -- groups ------------------------------------------------------------

    pub fn insert_group(&mut self, group: Group) -> GroupId {
        let id = GroupId(self.groups.len() as u32);
        if let Some(name) = group.name.clone() {
            self.groups_by_name.insert(name, id);
        }
        self.groups.push(Arc::new(group));
        id
    }

    pub fn group(&self, id: GroupId) -> &Arc<Group> {
        &self.groups[id.index()]
    }

    pub fn group_by_name(&self, name: &str) -> Option<GroupId> {
        self.groups_by_name.get(name).copied()
    }
}

impl GroupId {
    fn index(self) -> usize {
        self.0 as usize
    }

    pub fn from_index(i: usize) -> Self {
        GroupId(i as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupKind;
    use crate::probe::{CollectionSource, InterfaceValueKind, Probe, ProbeType, Transport};

    #[test]
    fn probes_round_trip_by_name() {
        let mut reg = Registry::new();
        let probe = Probe::new(
            "p1".into(),
            ProbeType::NetflowV5,
            Transport::Udp,
            CollectionSource::ReadFromFile("x.dat".into()),
            InterfaceValueKind::Snmp,
        );
        let id = reg.insert_probe(probe);
        assert_eq!(reg.probe_by_name("p1"), Some(id));
        assert_eq!(reg.probe(id).name, "p1");
    }

    #[test]
    fn groups_keep_insertion_order_ids() {
        let mut reg = Registry::new();
        let a = reg.insert_group(Group::new(
            Some("g1".into()),
            GroupKind::Ipblock(Vec::new()),
        ));
        let b = reg.insert_group(Group::new(None, GroupKind::Ipblock(Vec::new())));
        assert_ne!(a, b);
        assert_eq!(reg.group_by_name("g1"), Some(a));
    }
}

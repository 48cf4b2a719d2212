//! Sensors: named classification targets, their per-network deciders and
//! ordered discard filters.

use crate::group::{Group, GroupKind};
use crate::network::NetworkId;
use crate::probe::ProbeId;
use crate::registry::{GroupId, Registry};

/// Id for a sensor within a `Registry`. Stable for the registry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SensorId(pub(crate) u32);

impl SensorId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(i: usize) -> Self {
        SensorId(i as u32)
    }

    /// The numeric id assigned by the site file; distinct from the
    /// in-registry arena index. Filled in at verification.
    pub fn site_id(self) -> Option<u32> {
        None
    }
}

/// A per-(sensor, network) rule deciding whether a record's source or
/// destination side belongs to that network. "Remainder" variants are
/// replaced by a concrete, materialized group at sensor verification.
#[derive(Debug, Clone)]
pub enum Decider {
    Unset,
    Interface(GroupId),
    Ipblock(GroupId),
    Ipset(GroupId),
    /// Complement of the sibling interface/ipblock/ipset deciders on this
    /// sensor, materialized during `Sensor::verify`.
    RemainderInterface,
    RemainderIpblock,
    RemainderIpset,
}

impl Decider {
    fn is_remainder(&self) -> bool {
        matches!(
            self,
            Decider::RemainderInterface | Decider::RemainderIpblock | Decider::RemainderIpset
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSide {
    Source,
    Destination,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    DiscardWhen,
    DiscardUnless,
}

/// One entry of a sensor's ordered filter list (§3 Filter). At most one
/// filter per (side, group kind) pair is enforced by the parser, not here.
#[derive(Debug, Clone)]
pub struct Filter {
    pub group: GroupId,
    pub side: FilterSide,
    pub polarity: Polarity,
}

/// A named classification target. Consumes records from one or more
/// probes; assigns each a source/destination network and runs discard
/// filters in order.
#[derive(Debug, Clone)]
pub struct Sensor {
    pub name: String,
    /// Numeric id resolved from the (external) site file; `None` until
    /// resolved, at which point verification requires it to be `Some`.
    pub numeric_id: Option<u32>,
    pub probes: Vec<ProbeId>,
    /// Deciders keyed by network id; a sensor may have at most one decider
    /// per network.
    pub deciders: Vec<(NetworkId, Decider)>,
    pub filters: Vec<Filter>,
    /// A fixed network pins this side's classification outright and is
    /// mutually exclusive with any decider for the same network.
    pub fixed_source_network: Option<NetworkId>,
    pub fixed_dest_network: Option<NetworkId>,
    materialized_remainders: Vec<(NetworkId, Group)>,
    verified: bool,
}

impl Sensor {
    pub fn new(name: String) -> Self {
        Sensor {
            name,
            numeric_id: None,
            probes: Vec::new(),
            deciders: Vec::new(),
            filters: Vec::new(),
            fixed_source_network: None,
            fixed_dest_network: None,
            materialized_remainders: Vec::new(),
            verified: false,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// The decider attached for `network`, if any.
    pub fn decider_for(&self, network: NetworkId) -> Option<&Decider> {
        self.deciders
            .iter()
            .find(|(n, _)| *n == network)
            .map(|(_, d)| d)
    }

    /// The materialized remainder group for `network`, if `decider_for`
    /// returned a `Remainder*` variant.
    pub fn remainder_group(&self, network: NetworkId) -> Option<&Group> {
        self.materialized_remainders
            .iter()
            .find(|(n, _)| *n == network)
            .map(|(_, g)| g)
    }

    /// Verifies the sensor: resolves its numeric id, checks fixed-network /
    /// decider mutual exclusion, and materializes every `Remainder*`
    /// decider against its siblings. `resolve_id` models the external site
    /// file lookup (§3: "resolved to a numeric id via the site file — if
    /// unresolvable, verify fails").
    pub fn verify(
        &mut self,
        registry: &Registry,
        resolve_id: impl Fn(&str) -> Option<u32>,
    ) -> Result<(), crate::error::ConfigError> {
        self.numeric_id = resolve_id(&self.name);
        let Some(_) = self.numeric_id else {
            return Err(crate::error::ConfigError::UnresolvableSensorId {
                sensor: self.name.clone(),
            });
        };

        if self.fixed_source_network.is_some()
            && self
                .deciders
                .iter()
                .any(|(n, _)| Some(*n) == self.fixed_source_network)
        {
            return Err(crate::error::ConfigError::DuplicateName {
                kind: "source-network decider".into(),
                name: self.name.clone(),
            });
        }
        if self.fixed_dest_network.is_some()
            && self
                .deciders
                .iter()
                .any(|(n, _)| Some(*n) == self.fixed_dest_network)
        {
            return Err(crate::error::ConfigError::DuplicateName {
                kind: "destination-network decider".into(),
                name: self.name.clone(),
            });
        }

        self.materialize_remainders(registry)?;
        self.verified = true;
        Ok(())
    }

    fn materialize_remainders(
        &mut self,
        registry: &Registry,
    ) -> Result<(), crate::error::ConfigError> {
        self.materialized_remainders.clear();
        let remainder_networks: Vec<NetworkId> = self
            .deciders
            .iter()
            .filter(|(_, d)| d.is_remainder())
            .map(|(n, _)| *n)
            .collect();

        for network in remainder_networks {
            let decider = self.decider_for(network).cloned().expect("just collected");
            let sibling_groups: Vec<&Group> = self
                .deciders
                .iter()
                .filter(|(n, _)| *n != network)
                .filter_map(|(_, d)| match d {
                    Decider::Interface(g) | Decider::Ipblock(g) | Decider::Ipset(g) => {
                        Some(registry.group(*g).as_ref())
                    }
                    _ => None,
                })
                .collect();

            let remainder = match decider {
                Decider::RemainderInterface => {
                    let universe = sibling_groups
                        .iter()
                        .filter_map(|g| match g.kind() {
                            GroupKind::Interface(bm) => Some(bm.clone()),
                            _ => None,
                        })
                        .fold(Default::default(), |acc: crate::group::InterfaceBitmap, bm| {
                            acc.union(&bm)
                        });
                    Group::remainder_interfaces(&sibling_groups, &universe)
                }
                Decider::RemainderIpblock | Decider::RemainderIpset => {
                    // Full-address-space complement of a CIDR/ipset list
                    // isn't representable as a finite set; the classifier
                    // resolves these remainders at classification time by
                    // testing non-membership in the union of siblings
                    // instead (see `Group::remainder_interfaces` doc and
                    // `classifier::classify_side`).
                    continue;
                }
                _ => unreachable!("filtered to remainder variants above"),
            };
            self.materialized_remainders.push((network, remainder));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{Group, GroupKind, InterfaceBitmap};

    fn registry_with_two_interface_groups() -> (Registry, GroupId, GroupId) {
        let mut reg = Registry::new();
        let mut bm_a = InterfaceBitmap::default();
        bm_a.insert(1).unwrap();
        let a = reg.insert_group(Group::new(None, GroupKind::Interface(bm_a)));
        let mut bm_b = InterfaceBitmap::default();
        bm_b.insert(2).unwrap();
        let b = reg.insert_group(Group::new(None, GroupKind::Interface(bm_b)));
        (reg, a, b)
    }

    #[test]
    fn verify_fails_without_site_id() {
        let reg = Registry::new();
        let mut sensor = Sensor::new("S0".into());
        assert!(sensor.verify(&reg, |_| None).is_err());
    }

    #[test]
    fn fixed_network_conflicts_with_decider() {
        let (reg, a, _b) = registry_with_two_interface_groups();
        let mut sensor = Sensor::new("S0".into());
        sensor.fixed_source_network = Some(0);
        sensor.deciders.push((0, Decider::Interface(a)));
        assert!(sensor.verify(&reg, |_| Some(1)).is_err());
    }

    #[test]
    fn remainder_interface_materializes_complement() {
        let (reg, a, _b) = registry_with_two_interface_groups();
        let mut sensor = Sensor::new("S0".into());
        sensor.deciders.push((0, Decider::Interface(a)));
        sensor.deciders.push((1, Decider::RemainderInterface));
        sensor.verify(&reg, |_| Some(1)).unwrap();
        let remainder = sensor.remainder_group(1).unwrap();
        assert!(!remainder.contains_interface(1).unwrap());
    }
}

//! Groups: reusable, freezable, immutable-once-frozen sets referenced by
//! sensors' deciders and filters. A group has one of three kinds
//! (interface bitmap, IP-wildcard list, IP set); each kind exposes the same
//! capability set, with "not applicable" (e.g. asking an interface group
//! whether it contains an IP) returning a typed error rather than panicking.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;
use snafu::Snafu;

/// Upper bound on SNMP interface indices tracked by an interface group.
/// SNMP ifIndex is formally a 32-bit value but real routers never approach
/// this; it bounds the bitmap's memory rather than rejecting legitimate
/// indices.
pub const MAX_INTERFACE_INDEX: u32 = 65_535;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum GroupError {
    #[snafu(display("operation not applicable to a group of kind {kind}"))]
    NotApplicable { kind: &'static str },
    #[snafu(display("cannot union groups of different kinds"))]
    KindMismatch,
    #[snafu(display("interface index {index} exceeds the maximum of {max}", max = MAX_INTERFACE_INDEX))]
    InterfaceOutOfRange { index: u32 },
    #[snafu(display("group is frozen and cannot be modified"))]
    Frozen,
}

/// One SiLK-style wildcard octet: an exact value, a closed range, or "any".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OctetMatch {
    Exact(u8),
    Range(u8, u8),
    Any,
}

impl OctetMatch {
    fn matches(self, v: u8) -> bool {
        match self {
            OctetMatch::Exact(e) => e == v,
            OctetMatch::Range(lo, hi) => v >= lo && v <= hi,
            OctetMatch::Any => true,
        }
    }
}

/// An IPv4-wildcard pattern (`10.0.0-127.x.1`) or a plain CIDR block,
/// either of which an `ipblock` group may contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpWildcard {
    V4([OctetMatch; 4]),
    Cidr(IpNet),
}

impl IpWildcard {
    pub fn matches(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (IpWildcard::V4(octets), IpAddr::V4(v4)) => {
                let b = v4.octets();
                (0..4).all(|i| octets[i].matches(b[i]))
            }
            (IpWildcard::Cidr(net), ip) => net.contains(&ip),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InterfaceBitmap {
    bits: HashSet<u32>,
}

impl InterfaceBitmap {
    pub fn insert(&mut self, index: u32) -> Result<(), GroupError> {
        if index > MAX_INTERFACE_INDEX {
            return Err(GroupError::InterfaceOutOfRange { index });
        }
        self.bits.insert(index);
        Ok(())
    }

    pub fn contains(&self, index: u32) -> bool {
        self.bits.contains(&index)
    }

    pub fn union(&self, other: &Self) -> Self {
        InterfaceBitmap {
            bits: self.bits.union(&other.bits).copied().collect(),
        }
    }

    pub fn complement_within(&self, universe: &Self) -> Self {
        InterfaceBitmap {
            bits: universe.bits.difference(&self.bits).copied().collect(),
        }
    }
}

/// A minimal in-crate stand-in for a real IP-set structure (the actual
/// matching primitive is an external collaborator per the spec's scope).
/// Backed by a flat list of CIDR blocks; a "union of several files" is
/// simply concatenation, since the format this would load from is also out
/// of scope here.
#[derive(Debug, Clone, Default)]
pub struct IpSet {
    blocks: Vec<IpNet>,
}

impl IpSet {
    pub fn from_blocks(blocks: Vec<IpNet>) -> Self {
        IpSet { blocks }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.blocks.iter().any(|b| b.contains(&ip))
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut blocks = self.blocks.clone();
        blocks.extend(other.blocks.iter().cloned());
        IpSet { blocks }
    }
}

// "Remainder" for ipblock/ipset groups is resolved by the classifier
// testing non-membership in the union of siblings, not by materializing an
// explicit complement set: full-address-space complement of a CIDR list
// isn't representable as a finite CIDR list in general. See
// `Group::remainder_interfaces` for the one kind (interface bitmaps) where
// a concrete, finite universe makes an explicit complement possible.

#[derive(Debug, Clone)]
pub enum GroupKind {
    Interface(InterfaceBitmap),
    Ipblock(Vec<IpWildcard>),
    IpSet(IpSet),
}

impl GroupKind {
    fn kind_name(&self) -> &'static str {
        match self {
            GroupKind::Interface(_) => "interface",
            GroupKind::Ipblock(_) => "ipblock",
            GroupKind::IpSet(_) => "ipset",
        }
    }
}

/// A named (optionally), frozen-once-built set. Cheaply cloned by sharing
/// the underlying data via the caller's chosen reference type (the
/// `Registry` stores groups behind an `Arc`).
#[derive(Debug, Clone)]
pub struct Group {
    pub name: Option<String>,
    kind: GroupKind,
    frozen: bool,
}

impl Group {
    pub fn new(name: Option<String>, kind: GroupKind) -> Self {
        Group {
            name,
            kind,
            frozen: false,
        }
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn kind(&self) -> &GroupKind {
        &self.kind
    }

    pub fn contains_interface(&self, index: u32) -> Result<bool, GroupError> {
        match &self.kind {
            GroupKind::Interface(bm) => Ok(bm.contains(index)),
            other => Err(GroupError::NotApplicable {
                kind: other.kind_name(),
            }),
        }
    }

    pub fn contains_ip(&self, ip: IpAddr) -> Result<bool, GroupError> {
        match &self.kind {
            GroupKind::Ipblock(list) => Ok(list.iter().any(|w| w.matches(ip))),
            GroupKind::IpSet(set) => Ok(set.contains(ip)),
            other => Err(GroupError::NotApplicable {
                kind: other.kind_name(),
            }),
        }
    }

    /// Embeds `other` by union; both groups must share a kind and neither
    /// may already be frozen.
    pub fn union(&mut self, other: &Group) -> Result<(), GroupError> {
        if self.frozen {
            return Err(GroupError::Frozen);
        }
        self.kind = match (&self.kind, &other.kind) {
            (GroupKind::Interface(a), GroupKind::Interface(b)) => GroupKind::Interface(a.union(b)),
            (GroupKind::Ipblock(a), GroupKind::Ipblock(b)) => {
                let mut merged = a.clone();
                merged.extend(b.iter().cloned());
                GroupKind::Ipblock(merged)
            }
            (GroupKind::IpSet(a), GroupKind::IpSet(b)) => GroupKind::IpSet(a.union(b)),
            _ => return Err(GroupError::KindMismatch),
        };
        Ok(())
    }

    /// Builds the "remainder" group for a sensor: the complement, within
    /// `universe`, of the union of `siblings`. Interface-kind only supports
    /// a concrete bitmap universe; ipblock/ipset remainders are resolved by
    /// the classifier testing non-membership in the union of siblings
    /// instead of materializing an explicit complement (see `IpSet::union`
    /// doc comment).
    pub fn remainder_interfaces(siblings: &[&Group], universe: &InterfaceBitmap) -> Group {
        let mut claimed = InterfaceBitmap::default();
        for s in siblings {
            if let GroupKind::Interface(bm) = &s.kind {
                claimed = claimed.union(bm);
            }
        }
        let mut g = Group::new(None, GroupKind::Interface(claimed.complement_within(universe)));
        g.freeze();
        g
    }
}

pub fn wildcard_from_parts(parts: &[&str]) -> Option<IpWildcard> {
    if parts.len() == 4 {
        let mut octets = [OctetMatch::Any; 4];
        for (i, p) in parts.iter().enumerate() {
            octets[i] = parse_octet(p)?;
        }
        return Some(IpWildcard::V4(octets));
    }
    None
}

fn parse_octet(p: &str) -> Option<OctetMatch> {
    if p == "x" || p == "X" {
        return Some(OctetMatch::Any);
    }
    if let Some((lo, hi)) = p.split_once('-') {
        return Some(OctetMatch::Range(lo.parse().ok()?, hi.parse().ok()?));
    }
    Some(OctetMatch::Exact(p.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn wildcard_matches_ranges_and_any() {
        let w = wildcard_from_parts(&["10", "0-1", "x", "5"]).unwrap();
        assert!(w.matches(IpAddr::V4(Ipv4Addr::new(10, 0, 200, 5))));
        assert!(w.matches(IpAddr::V4(Ipv4Addr::new(10, 1, 0, 5))));
        assert!(!w.matches(IpAddr::V4(Ipv4Addr::new(10, 2, 0, 5))));
        assert!(!w.matches(IpAddr::V4(Ipv4Addr::new(10, 0, 200, 6))));
    }

    #[test]
    fn interface_group_rejects_ip_query() {
        let g = Group::new(None, GroupKind::Interface(InterfaceBitmap::default()));
        assert_eq!(
            g.contains_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            Err(GroupError::NotApplicable { kind: "interface" })
        );
    }

    #[test]
    fn remainder_is_complement_of_siblings() {
        let mut universe = InterfaceBitmap::default();
        for i in 1..=4 {
            universe.insert(i).unwrap();
        }
        let mut a = Group::new(None, GroupKind::Interface(InterfaceBitmap::default()));
        if let GroupKind::Interface(bm) = &mut a.kind {
            bm.insert(1).unwrap();
        }
        let remainder = Group::remainder_interfaces(&[&a], &universe);
        assert!(!remainder.contains_interface(1).unwrap());
        assert!(remainder.contains_interface(2).unwrap());
        assert!(remainder.contains_interface(3).unwrap());
        assert!(remainder.contains_interface(4).unwrap());
    }
}

//! The protocol-independent flow record shape produced by every decoder
//! (NFv5, the IPFIX/NFv9/sFlow adapter, and file-mode readers) and consumed
//! by the classifier.

use std::net::IpAddr;

/// TCP flags observed across a flow, split the way SiLK-style collectors
/// track them: the logical OR of every packet's flags, the flags carried on
/// the very first packet, and the flags from every packet after the first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub all: u8,
    pub initial: u8,
    pub session: u8,
}

/// Why a flow ended, when the exporter reports it (IPFIX `flowEndReason`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowEndReason {
    #[default]
    Unknown,
    IdleTimeout,
    ActiveTimeout,
    EndOfFlow,
    ForcedEnd,
    LackOfResources,
}

/// Input/output interface labeling, as either an SNMP ifIndex or a VLAN id
/// depending on the probe's configured `interface-values` kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceValue {
    Snmp(u32),
    Vlan(u16),
}

impl InterfaceValue {
    pub fn as_snmp(self) -> Option<u32> {
        match self {
            InterfaceValue::Snmp(v) => Some(v),
            InterfaceValue::Vlan(_) => None,
        }
    }
}

/// The common internal flow record handed from a decoder into a source's
/// ring, and from there to the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRecord {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub tcp_flags: TcpFlags,
    pub input_iface: InterfaceValue,
    pub output_iface: InterfaceValue,
    pub packets: u64,
    pub bytes: u64,
    /// Absolute start time, milliseconds since the UNIX epoch.
    pub start_ms: i64,
    /// Flow duration in milliseconds.
    pub duration_ms: u32,
    pub next_hop: Option<IpAddr>,
    /// TCP connection state, when the exporter reports one; raw byte form.
    pub tcp_state: u8,
    /// Sensor id this record has been (or will be) classified onto; `None`
    /// until the classifier assigns it.
    pub sensor_tag: Option<u32>,
    pub application: Option<u16>,
    pub end_reason: FlowEndReason,
}

impl FlowRecord {
    pub fn end_ms(&self) -> i64 {
        self.start_ms + i64::from(self.duration_ms)
    }
}

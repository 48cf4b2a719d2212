//! Probes: named ingestion endpoints, their transport and collection
//! source, and the bitmask options that shape decoding and logging.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::sensor::SensorId;

/// Id for a probe within a `Registry`. Stable for the registry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId(pub(crate) u32);

impl ProbeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(i: usize) -> Self {
        ProbeId(i as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeType {
    NetflowV5,
    NetflowV9,
    Ipfix,
    Sflow,
    Silk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
    Sctp,
    Unset,
}

/// Exactly one of these backs a probe's collection source (§3 Probe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionSource {
    /// Resolved from a single host/port spec; may expand to several
    /// addresses (e.g. a hostname with both A and AAAA records).
    ListenSockaddr(Vec<SocketAddr>),
    ListenUnixPath(PathBuf),
    ReadFromFile(PathBuf),
    PollDirectory(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceValueKind {
    Snmp,
    Vlan,
}

/// Closed set of `log-flags` tokens (§4.6), packed as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogFlags(u16);

impl LogFlags {
    pub const NONE: LogFlags = LogFlags(0);
    pub const BAD: LogFlags = LogFlags(1 << 0);
    pub const MISSING: LogFlags = LogFlags(1 << 1);
    pub const SAMPLING: LogFlags = LogFlags(1 << 2);
    pub const RECORD_TIMESTAMPS: LogFlags = LogFlags(1 << 3);
    pub const FIREWALL_EVENT: LogFlags = LogFlags(1 << 4);
    pub const SHOW_TEMPLATES: LogFlags = LogFlags(1 << 5);
    /// `default` is the set a probe starts with absent any explicit flags.
    pub const DEFAULT: LogFlags = LogFlags(Self::BAD.0 | Self::MISSING.0);
    pub const ALL: LogFlags = LogFlags(
        Self::BAD.0
            | Self::MISSING.0
            | Self::SAMPLING.0
            | Self::RECORD_TIMESTAMPS.0
            | Self::FIREWALL_EVENT.0
            | Self::SHOW_TEMPLATES.0,
    );

    pub fn contains(self, flag: LogFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn insert(&mut self, flag: LogFlags) {
        self.0 |= flag.0;
    }

    /// Honors `SILK_IPFIX_PRINT_TEMPLATES`: OR `show-templates` into every
    /// probe's flags when set and non-zero (§6 Environment variables).
    pub fn with_env_show_templates(mut self) -> Self {
        if std::env::var("SILK_IPFIX_PRINT_TEMPLATES")
            .map(|v| v != "0" && !v.is_empty())
            .unwrap_or(false)
        {
            self.insert(LogFlags::SHOW_TEMPLATES);
        }
        self
    }
}

/// Closed set of `quirks` tokens (§4.6), packed as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Quirks(u8);

impl Quirks {
    pub const NONE: Quirks = Quirks(0);
    pub const FIREWALL_EVENT: Quirks = Quirks(1 << 0);
    pub const MISSING_IPS: Quirks = Quirks(1 << 1);
    pub const NF9_OUT_IS_REVERSE: Quirks = Quirks(1 << 2);
    pub const NF9_SYSUPTIME_SECONDS: Quirks = Quirks(1 << 3);
    pub const ZERO_PACKETS: Quirks = Quirks(1 << 4);

    pub fn contains(self, quirk: Quirks) -> bool {
        self.0 & quirk.0 == quirk.0
    }

    pub fn insert(&mut self, quirk: Quirks) {
        self.0 |= quirk.0;
    }
}

/// A named ingestion endpoint. Immutable once `verify`'d.
#[derive(Debug, Clone)]
pub struct Probe {
    pub name: String,
    pub probe_type: ProbeType,
    pub transport: Transport,
    pub source: CollectionSource,
    /// Array of sockaddr-arrays: each configured `accept-from-host` entry
    /// may itself resolve to several addresses.
    pub accept_from_host: Vec<Vec<SocketAddr>>,
    pub interface_values: InterfaceValueKind,
    pub log_flags: LogFlags,
    pub quirks: Quirks,
    /// Back-reference to every sensor consuming this probe, populated by
    /// the config parser as each sensor's `probes` clause is resolved.
    pub sensors: Vec<SensorId>,
    verified: bool,
}

impl Probe {
    pub fn new(
        name: String,
        probe_type: ProbeType,
        transport: Transport,
        source: CollectionSource,
        interface_values: InterfaceValueKind,
    ) -> Self {
        Probe {
            name,
            probe_type,
            transport,
            source,
            accept_from_host: Vec::new(),
            interface_values,
            log_flags: LogFlags::DEFAULT.with_env_show_templates(),
            quirks: Quirks::NONE,
            sensors: Vec::new(),
            verified: false,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Verifies internal consistency and marks the probe immutable.
    ///
    /// The spec's single-collection-source and network-registration checks
    /// live at the config-parser layer (the grammar only allows one source
    /// keyword per probe block); this method checks what can only be known
    /// once the whole probe is assembled.
    pub fn verify(&mut self) -> Result<(), crate::error::ConfigError> {
        if let CollectionSource::ListenSockaddr(addrs) = &self.source {
            if addrs.is_empty() {
                return Err(crate::error::ConfigError::MissingValue {
                    block: "probe".into(),
                    field: "listen-as-host/listen-on-port resolved to no addresses".into(),
                });
            }
        }
        self.verified = true;
        Ok(())
    }

    /// Whether this probe listens on the network (vs. reading a file or
    /// polling a directory) — i.e. whether C2 owns it.
    pub fn is_network_probe(&self) -> bool {
        matches!(
            self.source,
            CollectionSource::ListenSockaddr(_) | CollectionSource::ListenUnixPath(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_flags_default_excludes_sampling() {
        let flags = LogFlags::DEFAULT;
        assert!(flags.contains(LogFlags::BAD));
        assert!(!flags.contains(LogFlags::SAMPLING));
    }

    #[test]
    fn verify_rejects_empty_listen_set() {
        let mut probe = Probe::new(
            "p".into(),
            ProbeType::NetflowV5,
            Transport::Udp,
            CollectionSource::ListenSockaddr(Vec::new()),
            InterfaceValueKind::Snmp,
        );
        assert!(probe.verify().is_err());
    }
}

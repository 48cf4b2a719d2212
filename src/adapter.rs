//! C4: the contract the IPFIX / NetFlow v9 / sFlow adapter must satisfy.
//!
//! §4.4 explicitly delegates template-directed field decoding to an
//! external library; what's specified here is the *shape* around that
//! decoder: per-connection sessions, UDP multi-session demultiplexing keyed
//! by (peer, observation domain), a connection-accept callback, exporter
//! counter snapshots, and cooperative interrupt on teardown. `Decoder` is
//! the seam a real implementation plugs a library (or an RFC-conformant
//! decoder of its own) into; nothing in this crate calls a templated field
//! layout directly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::flow::FlowRecord;

/// Observation Domain id, carried in IPFIX/NFv9 headers; participates in
/// the UDP peer key alongside the peer address (§6).
pub type ObservationDomain = u32;

/// Per-connection snapshot of exporter-reported counters (§4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExporterStats {
    pub packets_total: u64,
    pub packets_dropped: u64,
    pub packets_ignored: u64,
    pub packets_not_sent: u64,
    pub expired_fragments: u64,
    pub flows_exported: u64,
    /// v9/sFlow only: computed from sequence gaps the decoder library
    /// reports; always zero for a decoder that doesn't track sequence.
    pub missing_packets: u64,
}

/// A decoded record plus the wire-format detail the classifier can't
/// infer from the common `FlowRecord` alone: the sample-flag compatibility
/// shim mentioned in the spec's open questions. The name alone is kept
/// recognizable across libfixbuf-style naming drift; this crate never
/// hard-codes which literal field name produced it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SamplerFlags {
    pub sampled: bool,
    pub sampling_interval: Option<u32>,
}

/// One decoded record plus its per-connection provenance.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub record: FlowRecord,
    pub sampler_flags: SamplerFlags,
}

/// The seam a concrete exporter-library binding implements. A binding owns
/// one session's template table; everything here is per-connection state.
pub trait Decoder: Send {
    /// Feeds wire bytes (already length-framed by the caller) into this
    /// session's template-directed decoder, returning zero or more decoded
    /// records. May update `self`'s internal template table as a side
    /// effect — e.g. an IPFIX/NFv9 template set arrives with no records.
    fn ingest(&mut self, buf: &[u8]) -> Vec<DecodedRecord>;

    /// A snapshot of this session's exporter-reported counters.
    fn stats(&self) -> ExporterStats;

    /// Cooperatively interrupts a blocking read loop driven by this
    /// decoder (file-mode readers block inside the decoder library
    /// itself); called before the session is torn down.
    fn interrupt(&mut self);
}

/// Per-connection runtime state tying a `Decoder` session to the peer it
/// was opened for (§3 Connection).
pub struct Connection {
    pub peer: SocketAddr,
    pub observation_domain: ObservationDomain,
    decoder: Mutex<Box<dyn Decoder>>,
    interrupted: AtomicBool,
}

impl Connection {
    pub fn new(peer: SocketAddr, observation_domain: ObservationDomain, decoder: Box<dyn Decoder>) -> Self {
        Connection {
            peer,
            observation_domain,
            decoder: Mutex::new(decoder),
            interrupted: AtomicBool::new(false),
        }
    }

    pub fn ingest(&self, buf: &[u8]) -> Vec<DecodedRecord> {
        if self.interrupted.load(Ordering::Acquire) {
            return Vec::new();
        }
        self.decoder.lock().expect("decoder mutex poisoned").ingest(buf)
    }

    pub fn stats(&self) -> ExporterStats {
        self.decoder.lock().expect("decoder mutex poisoned").stats()
    }

    /// Cooperative teardown: mark interrupted so no further bytes are fed
    /// to the decoder, then let the decoder itself unwind any blocking
    /// read it owns. Per §4.4: "interrupt the blocking read loop, wait for
    /// the reader thread to observe the interrupt, then free the session."
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.decoder.lock().expect("decoder mutex poisoned").interrupt();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}

/// Key for UDP multi-session demultiplexing: one independent session
/// (and template table) per (peer, observation domain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpSessionKey {
    pub peer: SocketAddr,
    pub observation_domain: ObservationDomain,
}

/// Decides whether a connecting peer is allowed onto the owning source, so
/// a refused TCP/SCTP connection never allocates session state (§4.4:
/// "refused connections must not leak session state").
pub trait ConnectionAcceptor: Send + Sync {
    fn accept(&self, peer: &SocketAddr) -> bool;
}

/// Accepts every peer; used by probes with no `accept-from-host` set.
pub struct AcceptAll;

impl ConnectionAcceptor for AcceptAll {
    fn accept(&self, _peer: &SocketAddr) -> bool {
        true
    }
}

/// Accepts only peers whose address (port ignored) matches one of the
/// configured `accept-from-host` addresses.
pub struct AcceptFromHost {
    allowed: Vec<SocketAddr>,
}

impl AcceptFromHost {
    pub fn new(allowed: Vec<SocketAddr>) -> Self {
        AcceptFromHost { allowed }
    }
}

impl ConnectionAcceptor for AcceptFromHost {
    fn accept(&self, peer: &SocketAddr) -> bool {
        self.allowed
            .iter()
            .any(|a| crate::listener::addr_ip_eq(a, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    struct Counting(u32);

    impl Decoder for Counting {
        fn ingest(&mut self, _buf: &[u8]) -> Vec<DecodedRecord> {
            self.0 += 1;
            Vec::new()
        }

        fn stats(&self) -> ExporterStats {
            ExporterStats {
                packets_total: u64::from(self.0),
                ..Default::default()
            }
        }

        fn interrupt(&mut self) {}
    }

    #[test]
    fn interrupted_connection_drops_further_bytes() {
        let peer: SocketAddr = (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9995).into();
        let conn = Connection::new(peer, 0, Box::new(Counting(0)));
        assert!(conn.ingest(b"x").is_empty());
        assert_eq!(conn.stats().packets_total, 1);
        conn.interrupt();
        assert!(conn.ingest(b"y").is_empty());
        assert_eq!(conn.stats().packets_total, 1);
    }

    #[test]
    fn accept_from_host_ignores_port() {
        let allowed: SocketAddr = (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9995).into();
        let acceptor = AcceptFromHost::new(vec![allowed]);
        let peer: SocketAddr = (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 55123).into();
        assert!(acceptor.accept(&peer));
        let other: SocketAddr = (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 9995).into();
        assert!(!acceptor.accept(&other));
    }
}

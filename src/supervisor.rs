//! C8: process-wide startup/shutdown orchestration.
//!
//! Startup order (§4.7): parse and verify the probe/sensor/group model,
//! then allocate a `Source` (and, for network probes, a listener `Base`)
//! per probe, sharing a `Base` across probes whose listen address,
//! transport and payload size match and whose `accept-from-host` sets are
//! mutually disjoint. Shutdown runs the reverse: stop every source (waking
//! blocked ring readers), release each source's base (tearing down the
//! poll thread once its last source leaves), then let the registry drop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::adapter::{AcceptAll, AcceptFromHost, ConnectionAcceptor};
use crate::error::ConfigError;
use crate::flow::FlowRecord;
use crate::ipfix_net::{run_tcp_accept_loop, run_udp_session_loop, DecoderFactory, NullDecoderFactory};
use crate::listener::{
    self, addr_ip_eq, can_share, join_shared_base, new_exclusive_base, new_shared_base, Base,
};
use crate::nfv5::{Session as Nfv5Session, SequenceThresholds};
use crate::probe::{CollectionSource, ProbeId, ProbeType};
use crate::registry::Registry;
use crate::source::{Source, SourceDecoder, SourceError};

/// Default receive buffer / ring sizing for probes that don't configure
/// their own. 65535 is the largest possible UDP payload; 4096 in-flight
/// records is generous headroom for one 500ms poll quantum at typical
/// flow-export rates.
const DEFAULT_MAX_PAYLOAD: usize = 65_535;
const DEFAULT_RING_CAPACITY: usize = 4_096;

fn decoder_for(probe_type: ProbeType) -> SourceDecoder {
    match probe_type {
        ProbeType::NetflowV5 => SourceDecoder::Nfv5(Nfv5Session::new(SequenceThresholds::default())),
        ProbeType::NetflowV9 | ProbeType::Ipfix | ProbeType::Sflow => SourceDecoder::Adapter,
        ProbeType::Silk => SourceDecoder::PreDecoded,
    }
}

/// One listener base under construction: the probes assigned to it so far,
/// kept around so a new candidate probe's `accept-from-host` set can be
/// checked against every sibling already joined, not just the first.
struct BaseBuilder {
    addrs: Vec<SocketAddr>,
    transport: crate::probe::Transport,
    max_payload: usize,
    members: Vec<(ProbeId, Vec<Vec<SocketAddr>>)>,
}

impl BaseBuilder {
    fn matches_shape(&self, addrs: &[SocketAddr], transport: crate::probe::Transport, max_payload: usize) -> bool {
        self.transport == transport
            && self.max_payload == max_payload
            && self.addrs.len() == addrs.len()
            && self
                .addrs
                .iter()
                .all(|a| addrs.iter().any(|b| addr_ip_eq(a, b) && a.port() == b.port()))
    }

    fn can_accept(&self, accept_from_host: &[Vec<SocketAddr>]) -> bool {
        if self.members.is_empty() {
            return true;
        }
        self.members.iter().all(|(_, existing)| {
            can_share(
                &self.addrs,
                self.transport,
                self.max_payload,
                existing,
                &self.addrs,
                self.transport,
                self.max_payload,
                accept_from_host,
            )
        })
    }
}

/// Whether a probe type's network mode runs through C2's blocking poll
/// fabric (NFv5, whose decoding is self-contained and synchronous) or C4's
/// tokio-driven accept/demux loops (IPFIX/NFv9/sFlow, which need per-session
/// state and an accept-time refusal hook).
fn is_adapter_probe(probe_type: ProbeType) -> bool {
    matches!(probe_type, ProbeType::NetflowV9 | ProbeType::Ipfix | ProbeType::Sflow)
}

fn acceptor_for(accept_from_host: &[Vec<SocketAddr>]) -> Arc<dyn ConnectionAcceptor> {
    if accept_from_host.is_empty() {
        Arc::new(AcceptAll)
    } else {
        Arc::new(AcceptFromHost::new(accept_from_host.iter().flatten().copied().collect()))
    }
}

/// A running collector process: every probe's `Source`, the C2 listener
/// bases backing the NFv5 ones, and the tokio runtime driving C4's
/// accept/demux loops for IPFIX/NFv9/sFlow probes.
pub struct Collector {
    pub registry: Arc<Registry>,
    sources: HashMap<ProbeId, Arc<Source>>,
    bases: Vec<Arc<Base>>,
    poll_threads: Vec<std::thread::JoinHandle<()>>,
    adapter_runtime: std::sync::Mutex<Option<tokio::runtime::Runtime>>,
    stopped: AtomicBool,
}

impl Collector {
    /// Builds and starts every probe's source and listener, using a
    /// `Decoder` that recognizes no templates for every IPFIX/NFv9/sFlow
    /// probe. Real deployments plug in an exporter-library binding via
    /// [`Collector::start_with_decoder_factory`]; this entry point exists so
    /// the collector core is exercisable without one (see DESIGN.md).
    pub fn start(registry: Registry) -> Result<Arc<Collector>, ConfigError> {
        Self::start_with_decoder_factory(registry, Arc::new(NullDecoderFactory))
    }

    /// Builds and starts every probe's source and (for network probes)
    /// listener base. `registry` must already have every probe and sensor
    /// verified (§4.7 start-up order step 2). `decoder_factory` supplies a
    /// fresh `Decoder` session for every IPFIX/NFv9/sFlow connection (§4.4).
    pub fn start_with_decoder_factory(
        registry: Registry,
        decoder_factory: Arc<dyn DecoderFactory>,
    ) -> Result<Arc<Collector>, ConfigError> {
        let registry = Arc::new(registry);
        let mut sources = HashMap::new();
        let mut base_builders: Vec<BaseBuilder> = Vec::new();
        let mut base_assignment: Vec<(usize, ProbeId, Arc<Source>)> = Vec::new();
        let mut adapter_listeners: Vec<(ProbeId, Arc<Source>)> = Vec::new();

        for (probe_id, probe) in registry.probes() {
            if !probe.is_verified() {
                return Err(ConfigError::Syntax {
                    file: String::new(),
                    line: 0,
                    message: format!("probe '{}' was never verified", probe.name),
                });
            }

            match &probe.source {
                CollectionSource::ListenSockaddr(addrs) => {
                    let source = Source::new_network(probe_id, decoder_for(probe.probe_type), DEFAULT_RING_CAPACITY)
                        .map_err(|_| ConfigError::Syntax {
                            file: String::new(),
                            line: 0,
                            message: format!("failed to allocate ring for probe '{}'", probe.name),
                        })?;

                    if is_adapter_probe(probe.probe_type) {
                        adapter_listeners.push((probe_id, Arc::clone(&source)));
                        sources.insert(probe_id, source);
                        continue;
                    }

                    let idx = assign_base(
                        &mut base_builders,
                        probe_id,
                        addrs,
                        probe.transport,
                        DEFAULT_MAX_PAYLOAD,
                        &probe.accept_from_host,
                        &probe.name,
                    )?;
                    base_assignment.push((idx, probe_id, Arc::clone(&source)));
                    sources.insert(probe_id, source);
                }
                CollectionSource::ListenUnixPath(_) => {
                    // Unix-domain listeners are accepted by the grammar but
                    // this crate's listener fabric only implements UDP
                    // polling today; see DESIGN.md.
                    tracing::warn!(probe = %probe.name, "unix-domain probes are not started by this collector");
                }
                CollectionSource::ReadFromFile(path) => {
                    let source = Source::new_file(probe_id, decoder_for(probe.probe_type), path.clone());
                    sources.insert(probe_id, source);
                }
                CollectionSource::PollDirectory(_) => {
                    tracing::warn!(probe = %probe.name, "poll-directory probes are not started by this collector");
                }
            }
        }

        let adapter_runtime = if adapter_listeners.is_empty() {
            None
        } else {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| ConfigError::Syntax {
                    file: String::new(),
                    line: 0,
                    message: format!("failed to start IPFIX/NFv9/sFlow runtime: {e}"),
                })?;

            for (probe_id, source) in adapter_listeners {
                let probe = registry.probe(probe_id);
                let CollectionSource::ListenSockaddr(addrs) = &probe.source else {
                    unreachable!("only ListenSockaddr probes are queued as adapter listeners");
                };
                let acceptor = acceptor_for(&probe.accept_from_host);
                let transport = probe.transport;
                let probe_name = probe.name.clone();
                for addr in addrs.clone() {
                    let source = Arc::clone(&source);
                    let acceptor = Arc::clone(&acceptor);
                    let factory = Arc::clone(&decoder_factory);
                    let probe_name = probe_name.clone();
                    match transport {
                        crate::probe::Transport::Udp | crate::probe::Transport::Unset => {
                            let socket = runtime
                                .block_on(async move { tokio::net::UdpSocket::bind(addr).await })
                                .map_err(|e| ConfigError::Syntax {
                                    file: String::new(),
                                    line: 0,
                                    message: format!("failed to bind UDP listener for probe '{probe_name}' on {addr}: {e}"),
                                })?;
                            runtime.spawn(run_udp_session_loop(socket, source, acceptor, factory));
                        }
                        crate::probe::Transport::Tcp | crate::probe::Transport::Sctp => {
                            let listener = runtime
                                .block_on(async move { tokio::net::TcpListener::bind(addr).await })
                                .map_err(|e| ConfigError::Syntax {
                                    file: String::new(),
                                    line: 0,
                                    message: format!("failed to bind TCP listener for probe '{probe_name}' on {addr}: {e}"),
                                })?;
                            runtime.spawn(run_tcp_accept_loop(listener, source, acceptor, factory));
                        }
                    }
                }
            }

            Some(runtime)
        };

        let mut bases = Vec::with_capacity(base_builders.len());
        let mut threads = Vec::new();
        for builder in base_builders {
            let members = builder.members;
            let base = if members.len() == 1 && members[0].1.is_empty() {
                new_exclusive_base(
                    builder.addrs.clone(),
                    builder.transport,
                    builder.max_payload,
                    Arc::clone(
                        base_assignment
                            .iter()
                            .find(|(_, id, _)| *id == members[0].0)
                            .map(|(_, _, s)| s)
                            .expect("member recorded during assignment"),
                    ),
                )
            } else {
                let shared = new_shared_base(builder.addrs.clone(), builder.transport, builder.max_payload);
                for (probe_id, accept_from) in &members {
                    let source = base_assignment
                        .iter()
                        .find(|(_, id, _)| id == probe_id)
                        .map(|(_, _, s)| Arc::clone(s))
                        .expect("member recorded during assignment");
                    let flat: Vec<SocketAddr> = accept_from.iter().flatten().copied().collect();
                    join_shared_base(&shared, &flat, source);
                }
                shared
            };

            for (probe_id, _) in &members {
                if let Some(source) = sources.get(probe_id) {
                    listener::attach_source_to_base(&base, source);
                }
            }

            let handle = listener::spawn_poll_thread(Arc::clone(&base)).map_err(|e| ConfigError::Syntax {
                file: String::new(),
                line: 0,
                message: format!("failed to bind listener base: {e}"),
            })?;
            threads.push(handle);
            bases.push(base);
        }

        Ok(Arc::new(Collector {
            registry,
            sources,
            bases,
            poll_threads: threads,
            adapter_runtime: std::sync::Mutex::new(adapter_runtime),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn source(&self, probe: ProbeId) -> Option<&Arc<Source>> {
        self.sources.get(&probe)
    }

    pub fn next_record(&self, probe: ProbeId) -> Result<FlowRecord, SourceError> {
        self.source(probe).ok_or(SourceError::Stopped)?.next_record()
    }

    /// `SourceLogStatsAndClear` run across every probe (§6).
    pub fn log_stats_and_clear_all(&self) {
        for (probe_id, source) in &self.sources {
            let name = self.registry.probe(*probe_id).name.clone();
            source.log_stats_and_clear(&name);
        }
    }

    /// Cooperative shutdown (§4.7): signal every source to stop (waking any
    /// blocked ring reader), release each source's base so its poll thread's
    /// refcount reaches zero and it, too, can stop, and tear down the C4
    /// adapter runtime. The runtime shuts down in the background rather than
    /// waiting for its accept/demux loops to notice `is_stopped` on their
    /// next socket read, so `stop()` itself never blocks on network I/O.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for source in self.sources.values() {
            source.stop();
        }
        for base in &self.bases {
            base.stop();
        }
        if let Some(runtime) = self.adapter_runtime.lock().expect("adapter runtime mutex poisoned").take() {
            runtime.shutdown_background();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.stop();
        for handle in self.poll_threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn assign_base(
    builders: &mut Vec<BaseBuilder>,
    probe_id: ProbeId,
    addrs: &[SocketAddr],
    transport: crate::probe::Transport,
    max_payload: usize,
    accept_from_host: &[Vec<SocketAddr>],
    probe_name: &str,
) -> Result<usize, ConfigError> {
    for (idx, builder) in builders.iter_mut().enumerate() {
        if !builder.matches_shape(addrs, transport, max_payload) {
            continue;
        }
        if builder.members.len() == 1 && builder.members[0].1.is_empty() {
            return Err(ConfigError::ConflictingListener {
                a: probe_name.to_string(),
                b: format!("probe at index {}", builder.members[0].0 .0),
                addr: addrs[0],
            });
        }
        if accept_from_host.is_empty() && !builder.members.is_empty() {
            return Err(ConfigError::ConflictingListener {
                a: probe_name.to_string(),
                b: "an existing listener on the same address".to_string(),
                addr: addrs[0],
            });
        }
        if !builder.can_accept(accept_from_host) {
            return Err(ConfigError::ConflictingListener {
                a: probe_name.to_string(),
                b: "a sibling probe with an overlapping accept-from-host set".to_string(),
                addr: addrs[0],
            });
        }
        builder.members.push((probe_id, accept_from_host.to_vec()));
        return Ok(idx);
    }

    builders.push(BaseBuilder {
        addrs: addrs.to_vec(),
        transport,
        max_payload,
        members: vec![(probe_id, accept_from_host.to_vec())],
    });
    Ok(builders.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{InterfaceValueKind, Probe, Transport};

    fn addr(ip: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::from(ip)), port)
    }

    #[test]
    fn two_exclusive_probes_on_same_address_conflict() {
        let mut builders = Vec::new();
        let addrs = vec![addr([0, 0, 0, 0], 9995)];
        assign_base(
            &mut builders,
            ProbeId::from_index(0),
            &addrs,
            Transport::Udp,
            DEFAULT_MAX_PAYLOAD,
            &[],
            "p0",
        )
        .unwrap();
        let result = assign_base(
            &mut builders,
            ProbeId::from_index(1),
            &addrs,
            Transport::Udp,
            DEFAULT_MAX_PAYLOAD,
            &[],
            "p1",
        );
        assert!(result.is_err());
    }

    #[test]
    fn disjoint_accept_sets_share_one_base() {
        let mut builders = Vec::new();
        let addrs = vec![addr([0, 0, 0, 0], 9995)];
        assign_base(
            &mut builders,
            ProbeId::from_index(0),
            &addrs,
            Transport::Udp,
            DEFAULT_MAX_PAYLOAD,
            &[vec![addr([10, 0, 0, 1], 0)]],
            "p0",
        )
        .unwrap();
        let idx = assign_base(
            &mut builders,
            ProbeId::from_index(1),
            &addrs,
            Transport::Udp,
            DEFAULT_MAX_PAYLOAD,
            &[vec![addr([10, 0, 0, 2], 0)]],
            "p1",
        )
        .unwrap();
        assert_eq!(idx, 0);
        assert_eq!(builders[0].members.len(), 2);
    }

    #[test]
    fn different_transport_starts_a_new_base() {
        let mut builders = Vec::new();
        let addrs = vec![addr([0, 0, 0, 0], 9995)];
        assign_base(
            &mut builders,
            ProbeId::from_index(0),
            &addrs,
            Transport::Udp,
            DEFAULT_MAX_PAYLOAD,
            &[vec![addr([10, 0, 0, 1], 0)]],
            "p0",
        )
        .unwrap();
        let idx = assign_base(
            &mut builders,
            ProbeId::from_index(1),
            &addrs,
            Transport::Tcp,
            DEFAULT_MAX_PAYLOAD,
            &[vec![addr([10, 0, 0, 2], 0)]],
            "p1",
        )
        .unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn unverified_probe_is_rejected_at_start() {
        let mut registry = Registry::new();
        let probe = Probe::new(
            "p0".into(),
            ProbeType::NetflowV5,
            Transport::Udp,
            CollectionSource::ListenSockaddr(vec![addr([0, 0, 0, 0], 9995)]),
            InterfaceValueKind::Snmp,
        );
        registry.insert_probe(probe);
        assert!(Collector::start(registry).is_err());
    }
}

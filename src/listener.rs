//! C2: the listener fabric. Owns listening sockets, polls them on one
//! thread per endpoint (a "base"), demultiplexes datagrams to the owning
//! source by peer address, and redistributes the process-wide socket
//! buffer budget whenever the set of open sockets changes.
//!
//! Matches the teacher's thread-per-endpoint poll-loop shape rather than an
//! async task: the ring this feeds is a blocking `std::sync` primitive
//! (`flow_ring::Ring`), so a dedicated OS thread per base — parking on
//! `recvfrom` with a receive timeout standing in for the spec's ~500 ms
//! `poll()` quantum — is the natural fit. See `DESIGN.md` for why the
//! IPFIX/NFv9/sFlow adapter (C4) instead runs on the Tokio runtime.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use std::net::UdpSocket;

use crate::probe::Transport;
use crate::ratelimit::{RateLimitedLog, Transition};
use crate::source::Source;

/// ~500ms poll quantum (§4.2 "Polling loop" step 3); used as the receive
/// timeout on each base's socket(s) so the thread periodically re-checks
/// its stop flag and source-activity condition instead of blocking forever.
const POLL_QUANTUM: Duration = Duration::from_millis(500);

/// Normalizes a peer address for demux-key comparisons: IPv4-mapped IPv6
/// addresses compare equal to their IPv4 form, and the port never
/// participates (§3: "port excluded from the key"; §8: "peer-address
/// equality ignores port").
fn normalize_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Compares two addresses the way the listener fabric's peer table does:
/// always ignoring port, since the normalized key never carries one.
pub fn addr_ip_eq(a: &SocketAddr, b: &SocketAddr) -> bool {
    normalize_ip(a.ip()) == normalize_ip(b.ip())
}

/// Ordered map key: a normalized peer IP that a shared base demultiplexes
/// on. Never carries a port (§3: "port excluded from the key"; §8:
/// "peer-address equality ignores port") — this is distinct from the
/// env-gated `(peer, observation domain)` session key the C4 adapter uses
/// for IPFIX/NFv9 multi-session demux (`ipfix_net::session_peer_key`),
/// which is the one `SK_IPFIX_UDP_IGNORE_SOURCE_PORT` governs (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PeerKey {
    ip: IpAddr,
}

impl PeerKey {
    fn from_addr(addr: SocketAddr) -> Self {
        PeerKey {
            ip: normalize_ip(addr.ip()),
        }
    }
}

/// How a base routes an incoming datagram to a source.
enum PeerRouting {
    /// No `accept-from-host` was configured on the sole probe using this
    /// base: every peer goes to the one source.
    Exclusive(Arc<Source>),
    /// Several probes share the base; each peer maps to exactly one of
    /// them via its `accept-from-host` set.
    Shared(BTreeMap<PeerKey, Arc<Source>>),
}

/// The ownership object for a listening endpoint: a socket set plus a
/// single poll thread, shared by every probe whose resolved listen
/// addresses, transport, and max payload match, and whose
/// `accept-from-host` sets are mutually disjoint (§4.2 "Endpoint sharing").
pub struct Base {
    pub addrs: Vec<SocketAddr>,
    pub transport: Transport,
    pub max_payload: usize,
    routing: Mutex<PeerRouting>,
    refcount: AtomicUsize,
    stop_flag: AtomicBool,
    sockets: Mutex<Vec<UdpSocket>>,
}

impl Base {
    fn new_exclusive(
        addrs: Vec<SocketAddr>,
        transport: Transport,
        max_payload: usize,
        source: Arc<Source>,
    ) -> Self {
        Base {
            addrs,
            transport,
            max_payload,
            routing: Mutex::new(PeerRouting::Exclusive(source)),
            refcount: AtomicUsize::new(1),
            stop_flag: AtomicBool::new(false),
            sockets: Mutex::new(Vec::new()),
        }
    }

    fn new_shared(addrs: Vec<SocketAddr>, transport: Transport, max_payload: usize) -> Self {
        Base {
            addrs,
            transport,
            max_payload,
            routing: Mutex::new(PeerRouting::Shared(BTreeMap::new())),
            refcount: AtomicUsize::new(0),
            stop_flag: AtomicBool::new(false),
            sockets: Mutex::new(Vec::new()),
        }
    }

    /// Registers `source` as a peer-bound consumer on a shared base (§4.2
    /// "Peer-to-source table"). Rejected if any already-registered peer
    /// range overlaps one of `accept_from` (verification-time conflict
    /// check); the caller (config verification) is expected to have
    /// already ruled this out across probes sharing the base, so this is a
    /// defensive re-check rather than the primary enforcement point.
    fn register_peer(&self, accept_from: &[SocketAddr], source: Arc<Source>) {
        let mut routing = self.routing.lock().expect("routing mutex poisoned");
        if let PeerRouting::Shared(map) = &mut *routing {
            for &addr in accept_from {
                map.insert(PeerKey::from_addr(addr), Arc::clone(&source));
            }
        }
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    fn route(&self, peer: SocketAddr, unknown_log: &Mutex<RateLimitedLog<()>>) -> Option<Arc<Source>> {
        let routing = self.routing.lock().expect("routing mutex poisoned");
        match &*routing {
            PeerRouting::Exclusive(source) => Some(Arc::clone(source)),
            PeerRouting::Shared(map) => {
                let key = PeerKey::from_addr(peer);
                match map.get(&key) {
                    Some(source) => {
                        unknown_log.lock().expect("poisoned").clear();
                        Some(Arc::clone(source))
                    }
                    None => {
                        // One informational line per transition from
                        // known->unknown; repeats are silently dropped
                        // until a known peer is seen again (§4.2 step 4).
                        if matches!(
                            unknown_log.lock().expect("poisoned").record(()),
                            Transition::First | Transition::Changed { .. }
                        ) {
                            tracing::info!(peer = %peer, "ignoring packets from unknown host");
                        }
                        None
                    }
                }
            }
        }
    }

    /// Decrements the base's refcount, per teardown order in §4.7: "each
    /// listener base decrements its refcount and is destroyed when the
    /// last source leaves." Returns `true` once the last source has left.
    pub fn release(&self) -> bool {
        self.stop_flag.store(true, Ordering::Release);
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }
}

/// Two probes can share a base iff they resolve to the same listen
/// addresses, transport and max payload, and each one's `accept-from-host`
/// set is disjoint from the other's (§4.2 "Endpoint sharing"). A probe
/// with an empty `accept-from-host` set claims the base exclusively and
/// cannot coexist with any other probe on it.
pub fn can_share(
    a_addrs: &[SocketAddr],
    a_transport: Transport,
    a_payload: usize,
    a_accept: &[Vec<SocketAddr>],
    b_addrs: &[SocketAddr],
    b_transport: Transport,
    b_payload: usize,
    b_accept: &[Vec<SocketAddr>],
) -> bool {
    if a_transport != b_transport || a_payload != b_payload {
        return false;
    }
    if a_addrs.len() != b_addrs.len()
        || !a_addrs.iter().all(|addr| b_addrs.iter().any(|o| addr_ip_eq(addr, o) && addr.port() == o.port()))
    {
        return false;
    }
    if a_accept.is_empty() || b_accept.is_empty() {
        return false;
    }
    let a_flat: Vec<&SocketAddr> = a_accept.iter().flatten().collect();
    let b_flat: Vec<&SocketAddr> = b_accept.iter().flatten().collect();
    !a_flat.iter().any(|a| b_flat.iter().any(|b| addr_ip_eq(a, b)))
}

/// The process-wide socket-buffer budget (§4.2 "Socket buffer sizing"):
/// redistributed equally across every open receive socket whenever that
/// count changes, floored at a configurable minimum.
pub struct SocketBufferBudget {
    minimum: usize,
    total: usize,
    open_sockets: AtomicUsize,
}

const DEFAULT_MINIMUM: usize = 64 * 1024;
const DEFAULT_TOTAL: usize = 32 * 1024 * 1024;

impl Default for SocketBufferBudget {
    fn default() -> Self {
        let minimum = std::env::var("SK_SOCKETBUFFER_MINIMUM")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MINIMUM);
        let total = std::env::var("SK_SOCKETBUFFER_NOMINAL_TOTAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TOTAL);
        SocketBufferBudget {
            minimum,
            total,
            open_sockets: AtomicUsize::new(0),
        }
    }
}

impl SocketBufferBudget {
    /// The per-socket buffer size every open socket should be using right
    /// now, given how many sockets are currently open.
    pub fn per_socket_size(&self) -> usize {
        let open = self.open_sockets.load(Ordering::Acquire).max(1);
        (self.total / open).max(self.minimum)
    }

    /// Registers one more open socket and returns the new per-socket size
    /// every already-open socket should be resized to.
    pub fn socket_opened(&self) -> usize {
        self.open_sockets.fetch_add(1, Ordering::AcqRel);
        self.per_socket_size()
    }

    pub fn socket_closed(&self) -> usize {
        self.open_sockets.fetch_sub(1, Ordering::AcqRel);
        self.per_socket_size()
    }
}

/// Binds one UDP socket per resolved address, sized per the current socket
/// buffer budget. Built via `socket2` for the socket-option control the
/// spec's buffer-sizing and reuse-address requirements need, then handed
/// back as a plain `std::net::UdpSocket` for the ordinary blocking
/// `recv_from` the poll loop uses.
fn bind_udp_sockets(addrs: &[SocketAddr], budget: &SocketBufferBudget) -> io::Result<Vec<UdpSocket>> {
    let mut sockets = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_read_timeout(Some(POLL_QUANTUM))?;
        let size = budget.socket_opened();
        let _ = socket.set_recv_buffer_size(size);
        socket.bind(&(*addr).into())?;
        sockets.push(UdpSocket::from(socket));
    }
    Ok(sockets)
}

/// Spawns the base's poll thread: one fixed receive buffer, allocated once,
/// reused for every datagram (§5 "Allocation discipline"). Exits once the
/// stop flag is set.
pub fn spawn_poll_thread(base: Arc<Base>) -> io::Result<std::thread::JoinHandle<()>> {
    let sockets = {
        let mut guard = base.sockets.lock().expect("sockets mutex poisoned");
        if guard.is_empty() {
            let budget = SocketBufferBudget::default();
            *guard = bind_udp_sockets(&base.addrs, &budget)?;
        }
        guard
            .iter()
            .map(UdpSocket::try_clone)
            .collect::<io::Result<Vec<_>>>()?
    };

    Ok(std::thread::spawn(move || run_poll_loop(base, sockets)))
}

fn run_poll_loop(base: Arc<Base>, sockets: Vec<UdpSocket>) {
    let mut buf = vec![0u8; base.max_payload.max(1)];
    let unknown_log: Mutex<RateLimitedLog<()>> = Mutex::new(RateLimitedLog::new());

    'outer: loop {
        if base.stop_flag.load(Ordering::Acquire) {
            break;
        }
        for socket in &sockets {
            if base.stop_flag.load(Ordering::Acquire) {
                break 'outer;
            }
            match socket.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    let Some(source) = base.route(peer, &unknown_log) else { continue };
                    if source.is_stopped() {
                        continue;
                    }
                    if source.reject(&buf[..n]) {
                        continue;
                    }
                    source.ingest_network_packet(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "recv error on listener base; dropping datagram");
                    continue;
                }
            }
        }
    }
}

/// Non-sharable stand-in for `Weak<Base>` plumbed through `Source` for
/// teardown bookkeeping; see `Source::set_base`.
pub fn attach_source_to_base(base: &Arc<Base>, source: &Arc<Source>) {
    source.set_base(Arc::downgrade(base));
}

pub fn new_exclusive_base(
    addrs: Vec<SocketAddr>,
    transport: Transport,
    max_payload: usize,
    source: Arc<Source>,
) -> Arc<Base> {
    Arc::new(Base::new_exclusive(addrs, transport, max_payload, source))
}

pub fn new_shared_base(addrs: Vec<SocketAddr>, transport: Transport, max_payload: usize) -> Arc<Base> {
    Arc::new(Base::new_shared(addrs, transport, max_payload))
}

pub fn join_shared_base(base: &Arc<Base>, accept_from: &[SocketAddr], source: Arc<Source>) {
    base.register_peer(accept_from, source);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)
    }

    #[test]
    fn peer_key_ignores_port_by_default() {
        let a = PeerKey::from_addr(addr([10, 0, 0, 1], 9995));
        let b = PeerKey::from_addr(addr([10, 0, 0, 1], 55000));
        assert_eq!(a, b);
    }

    #[test]
    fn addr_ip_eq_ignores_port() {
        assert!(addr_ip_eq(&addr([10, 0, 0, 1], 1), &addr([10, 0, 0, 1], 2)));
        assert!(!addr_ip_eq(&addr([10, 0, 0, 1], 1), &addr([10, 0, 0, 2], 1)));
    }

    #[test]
    fn can_share_requires_disjoint_accept_sets() {
        let addrs = vec![addr([0, 0, 0, 0], 9995)];
        let a_accept = vec![vec![addr([10, 0, 0, 1], 0)]];
        let b_accept = vec![vec![addr([10, 0, 0, 2], 0)]];
        assert!(can_share(
            &addrs,
            Transport::Udp,
            1500,
            &a_accept,
            &addrs,
            Transport::Udp,
            1500,
            &b_accept,
        ));

        let overlapping = vec![vec![addr([10, 0, 0, 1], 0)]];
        assert!(!can_share(
            &addrs,
            Transport::Udp,
            1500,
            &a_accept,
            &addrs,
            Transport::Udp,
            1500,
            &overlapping,
        ));
    }

    #[test]
    fn can_share_rejects_exclusive_probe() {
        let addrs = vec![addr([0, 0, 0, 0], 9995)];
        assert!(!can_share(
            &addrs,
            Transport::Udp,
            1500,
            &[],
            &addrs,
            Transport::Udp,
            1500,
            &[vec![addr([10, 0, 0, 1], 0)]],
        ));
    }

    #[test]
    fn socket_buffer_budget_redistributes_on_open_and_close() {
        let budget = SocketBufferBudget {
            minimum: 1024,
            total: 10_000,
            open_sockets: AtomicUsize::new(0),
        };
        assert_eq!(budget.socket_opened(), 10_000);
        assert_eq!(budget.socket_opened(), 5_000);
        assert_eq!(budget.socket_closed(), 10_000);
    }
}

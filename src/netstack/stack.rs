//! Network Stack Integration (spec.md §4.6): static smoltcp wiring and
//! the `serve` entry point that drives the stack for the lifetime of
//! the process.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{raw, tcp};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{EthernetAddress, HardwareAddress, IpAddress, IpCidr, IpProtocol, IpVersion, Ipv4Address, Ipv6Address};
use tokio::io;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::netstack::bridge_monitor::BridgeMonitor;
use crate::netstack::dns_reverse_map::DnsReverseMap;
use crate::netstack::error::{NetstackError, NetstackResult};
use crate::netstack::forwarder::tcp::{classify_dial_failure, is_do_not_forward, translate_host_nat, ForwardError, GuestSignal, HostNatAddresses};
use crate::netstack::forwarder::udp::{bind_host_socket, build_reply_frame, resolve_host_source_ip, GuestFlowKey, UdpConntrack};
use crate::netstack::icmp;
use crate::netstack::link::{DatagramNic, Frame, NicHandle};
use crate::netstack::proxy::ProxyDialerSet;
use crate::netstack::ready_bus::ReadyBus;

/// Static network configuration applied at interface creation time
/// (§4.6: "the NIC receives the gateway IPv4/IPv6 as a protocol
/// address, enables spoofing and promiscuous reception, installs
/// static neighbour entries for the guest MAC..., and seeds the route
/// table with the vnet subnets").
#[derive(Debug, Clone)]
pub struct StaticConfig {
    pub gateway_v4: Ipv4Addr,
    pub gateway_v6: Ipv6Addr,
    pub guest_mac: EthernetAddress,
    pub vnet_v4: IpCidr,
    pub vnet_v6: IpCidr,
    pub host_mac: EthernetAddress,
}

/// Builds the interface per the static configuration. smoltcp has no
/// public API for seeding static neighbour-cache entries in this
/// version (its neighbor cache is populated lazily from observed
/// traffic); `set_any_ip(true)` is used as the closest equivalent to
/// "spoofing and promiscuous reception" it exposes — the interface
/// accepts packets addressed to IPs it did not itself claim, which is
/// what a forwarding gateway needs. The guest MAC still resolves via
/// ordinary ARP/NDP on first use instead of a pre-seeded entry; this
/// is a deliberate deviation, noted in DESIGN.md.
pub fn build_interface(device: &mut DatagramNic, config: &StaticConfig, now: SmolInstant) -> Interface {
    let iface_config = Config::new(HardwareAddress::Ethernet(config.host_mac));
    let mut iface = Interface::new(iface_config, device, now);

    iface.set_any_ip(true);

    iface.update_ip_addrs(|addrs| {
        let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(Ipv4Address::from(config.gateway_v4)), 32));
        let _ = addrs.push(IpCidr::new(IpAddress::Ipv6(Ipv6Address::from(config.gateway_v6)), 128));
    });

    iface.routes_mut().add_default_ipv4_route(Ipv4Address::from(config.gateway_v4)).ok();
    iface.routes_mut().add_default_ipv6_route(Ipv6Address::from(config.gateway_v6)).ok();

    iface
}

/// TCP-stack tuning (§4.6), applied wherever smoltcp exposes a knob.
/// SACK, congestion control selection, and TIME_WAIT reuse have no
/// corresponding smoltcp API: smoltcp never implements SACK, only
/// implements a single Reno-like AIMD congestion controller, and
/// collapses TIME_WAIT handling internally without a reuse policy
/// toggle — so all three requirements are satisfied by smoltcp's
/// defaults with no code required (recorded in DESIGN.md).
pub fn apply_tcp_tuning(socket: &mut tcp::Socket) {
    socket.set_nagle_enabled(false);
    // "Moderate receive buffer": neither the minimum viable size nor
    // an unbounded one: large enough to avoid a zero-window stall on a
    // sub-millisecond-RTT link, small enough to bound guest-controlled
    // memory. Buffers are sized by the caller when constructing the
    // socket (see `new_tcp_socket_buffers`); this function only
    // applies settings on the live socket.
    let _ = socket;
}

pub const TCP_RX_BUFFER_BYTES: usize = 128 * 1024;
pub const TCP_TX_BUFFER_BYTES: usize = 128 * 1024;

fn new_tcp_socket<'a>() -> tcp::Socket<'a> {
    let rx_buffer = tcp::SocketBuffer::new(vec![0u8; TCP_RX_BUFFER_BYTES]);
    let tx_buffer = tcp::SocketBuffer::new(vec![0u8; TCP_TX_BUFFER_BYTES]);
    let mut socket = tcp::Socket::new(rx_buffer, tx_buffer);
    apply_tcp_tuning(&mut socket);
    socket
}

/// Number of simultaneously pending wildcard listeners. Each accepted
/// SYN is replaced with a fresh wildcard listener so the pool never
/// drains; §4.7's "per accepted SYN" decision is made once a socket
/// transitions out of `Listen`.
const WILDCARD_LISTENER_POOL_SIZE: usize = 128;

struct AcceptedFlow {
    handle: SocketHandle,
    local: SocketAddr,
    remote: SocketAddr,
}

/// The Ethernet/IP identities needed to address a synthesized ICMP
/// reply back to the guest; a copy of the relevant slice of
/// [`StaticConfig`] threaded into the accept loop.
#[derive(Debug, Clone, Copy)]
struct IcmpIdentity {
    host_mac: EthernetAddress,
    guest_mac: EthernetAddress,
    gateway_v4: Ipv4Addr,
    gateway_v6: Ipv6Addr,
}

impl From<&StaticConfig> for IcmpIdentity {
    fn from(config: &StaticConfig) -> Self {
        Self {
            host_mac: config.host_mac,
            guest_mac: config.guest_mac,
            gateway_v4: config.gateway_v4,
            gateway_v6: config.gateway_v6,
        }
    }
}

/// Shared driving state: one background task owns `iface`/`device`/
/// `sockets` and polls them; everything else reaches in through this
/// struct under a single mutex, matching how a single-threaded
/// event-loop network stack is normally integrated into an async
/// runtime (there is exactly one mutable owner of the smoltcp state by
/// construction, so the mutex here is uncontended in the steady state
/// and only exists to let accept/pump tasks register interest).
struct Driver {
    iface: Interface,
    device: DatagramNic,
    sockets: SocketSet<'static>,
    raw_udp_v4: SocketHandle,
    raw_udp_v6: SocketHandle,
}

/// Capacity for the raw sockets used to demux guest UDP (§4.8). Sized
/// generously since a raw socket here stands in for every UDP flow at
/// once, unlike the per-flow TCP wildcard-listener pool.
const RAW_UDP_RX_PACKETS: usize = 128;
const RAW_UDP_RX_BYTES: usize = 128 * 2048;
const RAW_UDP_TX_PACKETS: usize = 16;
const RAW_UDP_TX_BYTES: usize = 16 * 2048;

/// A raw IP socket that captures every inbound UDP datagram for one IP
/// version. smoltcp has no "wildcard port" concept for `socket::udp`,
/// so guest UDP is demuxed the way the stack's own ICMP traffic would
/// be: at the raw IP layer, with the UDP header parsed by hand.
fn new_raw_udp_socket(version: IpVersion) -> raw::Socket<'static> {
    let rx_buffer = raw::PacketBuffer::new(vec![raw::PacketMetadata::EMPTY; RAW_UDP_RX_PACKETS], vec![0u8; RAW_UDP_RX_BYTES]);
    let tx_buffer = raw::PacketBuffer::new(vec![raw::PacketMetadata::EMPTY; RAW_UDP_TX_PACKETS], vec![0u8; RAW_UDP_TX_BYTES]);
    raw::Socket::new(version, IpProtocol::Udp, rx_buffer, tx_buffer)
}

struct UdpDatagram {
    source: SocketAddr,
    destination: SocketAddr,
    ttl: u8,
    payload: Vec<u8>,
}

fn parse_udp_v4(packet: &[u8]) -> Option<UdpDatagram> {
    if packet.len() < 20 {
        return None;
    }
    let ihl = (packet[0] & 0x0f) as usize * 4;
    if packet.len() < ihl + 8 {
        return None;
    }
    let ttl = packet[8];
    let src_ip = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst_ip = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let udp = &packet[ihl..];
    let src_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    let len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
    if len < 8 || udp.len() < len {
        return None;
    }
    Some(UdpDatagram {
        source: SocketAddr::new(IpAddr::V4(src_ip), src_port),
        destination: SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
        ttl,
        payload: udp[8..len].to_vec(),
    })
}

fn parse_udp_v6(packet: &[u8]) -> Option<UdpDatagram> {
    if packet.len() < 48 {
        return None;
    }
    let hop_limit = packet[7];
    let src_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&packet[8..24]).ok()?);
    let dst_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&packet[24..40]).ok()?);
    let udp = &packet[40..];
    let src_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    let len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
    if len < 8 || udp.len() < len {
        return None;
    }
    Some(UdpDatagram {
        source: SocketAddr::new(IpAddr::V6(src_ip), src_port),
        destination: SocketAddr::new(IpAddr::V6(dst_ip), dst_port),
        ttl: hop_limit,
        payload: udp[8..len].to_vec(),
    })
}

/// Drains every queued datagram off both raw UDP sockets without
/// holding the driver lock across the (async) forwarding work.
fn drain_raw_udp(driver: &Arc<Mutex<Driver>>) -> Vec<UdpDatagram> {
    let mut driver = driver.lock();
    let Driver { sockets, raw_udp_v4, raw_udp_v6, .. } = &mut *driver;
    let mut out = Vec::new();
    let socket = sockets.get_mut::<raw::Socket>(*raw_udp_v4);
    while socket.can_recv() {
        match socket.recv() {
            Ok(packet) => out.extend(parse_udp_v4(packet)),
            Err(_) => break,
        }
    }
    let socket = sockets.get_mut::<raw::Socket>(*raw_udp_v6);
    while socket.can_recv() {
        match socket.recv() {
            Ok(packet) => out.extend(parse_udp_v6(packet)),
            Err(_) => break,
        }
    }
    out
}

pub struct ServeParams {
    pub rx: tokio::sync::mpsc::Receiver<Frame>,
    pub tx: tokio::sync::mpsc::Sender<Frame>,
    pub mtu: u16,
    pub static_config: StaticConfig,
    pub host_nat: HostNatAddresses,
    pub proxies: Arc<ProxyDialerSet>,
    pub reverse_map: Arc<DnsReverseMap>,
    pub bridge_monitor: Arc<BridgeMonitor>,
    pub ready_bus: Arc<ReadyBus>,
}

/// Runs the network stack for the lifetime of the process: polls the
/// interface, accepts flows off the wildcard listener pool, and
/// dispatches each to the TCP forwarder. Returns only on a fatal setup
/// error; per-flow errors are handled locally and logged.
pub async fn serve(params: ServeParams) -> NetstackResult<()> {
    let nic_handle: NicHandle = Arc::new(params.tx.clone());
    let icmp_identity = IcmpIdentity::from(&params.static_config);
    let mut device = DatagramNic::new(params.rx, params.tx, params.mtu);
    let now = SmolInstant::from_millis(0);
    let iface = build_interface(&mut device, &params.static_config, now);

    let mut sockets: SocketSet<'static> = SocketSet::new(vec![]);
    for _ in 0..WILDCARD_LISTENER_POOL_SIZE {
        arm_wildcard_listener(&mut sockets)?;
    }
    let raw_udp_v4 = sockets.add(new_raw_udp_socket(IpVersion::Ipv4));
    let raw_udp_v6 = sockets.add(new_raw_udp_socket(IpVersion::Ipv6));

    let driver = Arc::new(Mutex::new(Driver { iface, device, sockets, raw_udp_v4, raw_udp_v6 }));
    let woken = Arc::new(Notify::new());

    info!(mtu = params.mtu, "network stack starting");

    let poll_driver = driver.clone();
    let poll_woken = woken.clone();
    tokio::spawn(async move {
        run_poll_loop(poll_driver, poll_woken).await;
    });

    let udp_driver = driver.clone();
    let udp_nic = nic_handle.clone();
    let udp_host_nat = params.host_nat;
    tokio::spawn(async move {
        run_udp_loop(udp_driver, udp_nic, udp_host_nat, icmp_identity).await;
    });

    let accept_driver = driver.clone();
    let proxies = params.proxies.clone();
    let reverse_map = params.reverse_map.clone();
    let host_nat = params.host_nat;
    tokio::spawn(async move {
        run_accept_loop(accept_driver, woken, proxies, reverse_map, host_nat, nic_handle, icmp_identity).await;
    });

    params.ready_bus.mark_ready("netstack");

    std::future::pending::<()>().await;
    Ok(())
}

fn arm_wildcard_listener(sockets: &mut SocketSet<'static>) -> NetstackResult<SocketHandle> {
    let mut socket = new_tcp_socket();
    socket
        .listen(smoltcp::wire::IpListenEndpoint { addr: None, port: 0 })
        .map_err(|e| NetstackError::Configuration(format!("failed to arm wildcard listener: {e}")))?;
    Ok(sockets.add(socket))
}

async fn run_poll_loop(driver: Arc<Mutex<Driver>>, woken: Arc<Notify>) {
    loop {
        if poll_iface_once(&driver) {
            woken.notify_waiters();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Drives one `Interface::poll` pass and returns whether any socket's
/// readiness may have changed. Called both by the background ticker
/// (for timer-driven work like retransmits) and synchronously by
/// [`SmolTcpStream`] after every send/recv, so a pumped flow doesn't
/// wait for the next tick to get its bytes onto the wire.
fn poll_iface_once(driver: &Arc<Mutex<Driver>>) -> bool {
    let mut driver = driver.lock();
    let Driver { iface, device, sockets, .. } = &mut *driver;
    let now = SmolInstant::from_millis(tokio_now_millis());
    iface.poll(now, device, sockets)
}

fn tokio_now_millis() -> i64 {
    // smoltcp timestamps are monotonic and only compared to each
    // other; process uptime is sufficient and avoids the forbidden
    // wall-clock `Instant::now()` pattern elsewhere in this crate's
    // deterministic paths (this one is a genuine runtime driver, not
    // a resumable script, so wall time is appropriate here).
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(std::time::Instant::now);
    start.elapsed().as_millis() as i64
}

async fn run_accept_loop(
    driver: Arc<Mutex<Driver>>,
    woken: Arc<Notify>,
    proxies: Arc<ProxyDialerSet>,
    reverse_map: Arc<DnsReverseMap>,
    host_nat: HostNatAddresses,
    nic: NicHandle,
    icmp_identity: IcmpIdentity,
) {
    loop {
        woken.notified().await;
        let established = collect_established(&driver);
        for flow in established {
            let flow_driver = driver.clone();
            let proxies = proxies.clone();
            let reverse_map = reverse_map.clone();
            let nic = nic.clone();
            tokio::spawn(async move {
                debug!(local = %flow.local, remote = %flow.remote, "accepted guest flow");
                if let Err(e) = handle_accepted_flow(flow, &flow_driver, &proxies, &reverse_map, host_nat, &nic, icmp_identity).await {
                    warn!(error = %e, "forwarded flow ended with error");
                }
            });
        }
    }
}

const UDP_DRAIN_INTERVAL: Duration = Duration::from_millis(20);
/// How long a flow's reply-reading task waits for a host reply before
/// giving up; independent of, and looser than, the conntrack idle
/// timeout that drops the flow entry itself.
const UDP_REPLY_IDLE_TIMEOUT: Duration = Duration::from_secs(35);

/// Drains guest UDP datagrams off the raw sockets and forwards each to
/// its host-side flow (§4.8), spawning one task per datagram so a slow
/// or blocked flow never holds up others.
async fn run_udp_loop(driver: Arc<Mutex<Driver>>, nic: NicHandle, host_nat: HostNatAddresses, icmp_identity: IcmpIdentity) {
    let conntrack = Arc::new(UdpConntrack::new());
    loop {
        tokio::time::sleep(UDP_DRAIN_INTERVAL).await;
        conntrack.sweep_idle();
        for datagram in drain_raw_udp(&driver) {
            let conntrack = conntrack.clone();
            let nic = nic.clone();
            tokio::spawn(async move {
                if let Err(e) = forward_udp_datagram(datagram, &conntrack, &nic, host_nat, icmp_identity).await {
                    debug!(error = %e, "udp forward failed");
                }
            });
        }
    }
}

async fn forward_udp_datagram(
    datagram: UdpDatagram,
    conntrack: &Arc<UdpConntrack>,
    nic: &NicHandle,
    host_nat: HostNatAddresses,
    icmp_identity: IcmpIdentity,
) -> io::Result<()> {
    if is_do_not_forward(datagram.destination.ip()) {
        return Ok(());
    }

    let key = GuestFlowKey {
        guest_source: datagram.source,
        guest_destination: datagram.destination,
    };
    let translated = translate_host_nat(datagram.destination, host_nat);
    let host_source_ip = resolve_host_source_ip(translated)?;

    let (socket, is_new) = conntrack.get_or_create(key, || {
        let (raw_socket, _actual_port) = bind_host_socket(datagram.source.port(), host_source_ip, conntrack.memo())?;
        raw_socket.set_nonblocking(true)?;
        tokio::net::UdpSocket::from_std(raw_socket.into())
    })?;
    conntrack.resync_ttl(&key, host_source_ip, datagram.ttl as u32);

    socket.send_to(&datagram.payload, translated).await?;

    if is_new {
        let socket = socket.clone();
        let nic = nic.clone();
        let guest_addr = datagram.source;
        let reply_from = datagram.destination;
        tokio::spawn(async move {
            run_udp_reply_loop(socket, nic, icmp_identity, reply_from, guest_addr).await;
        });
    }

    Ok(())
}

/// Relays host-side replies on one UDP flow's socket back to the guest
/// until the socket goes quiet for [`UDP_REPLY_IDLE_TIMEOUT`]; the
/// conntrack entry is left to [`UdpConntrack::sweep_idle`] to reap on
/// its own, independent schedule.
async fn run_udp_reply_loop(socket: Arc<tokio::net::UdpSocket>, nic: NicHandle, icmp_identity: IcmpIdentity, reply_from: SocketAddr, guest_addr: SocketAddr) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let recv = socket.recv_from(&mut buf);
        let n = tokio::select! {
            result = recv => match result {
                Ok((n, _from)) => n,
                Err(_) => return,
            },
            _ = tokio::time::sleep(UDP_REPLY_IDLE_TIMEOUT) => return,
        };
        match build_reply_frame(icmp_identity.host_mac, icmp_identity.guest_mac, reply_from, guest_addr, &buf[..n]) {
            Some(frame) => {
                if nic.try_send(frame).is_err() {
                    warn!(%reply_from, %guest_addr, "failed to enqueue UDP reply frame");
                }
            }
            None => warn!(%reply_from, %guest_addr, "cannot build UDP reply frame for mismatched address families"),
        }
    }
}

/// Drains every wildcard listener that has transitioned to
/// `Established`, replacing each with a fresh listener so the pool
/// stays full.
fn collect_established(driver: &Arc<Mutex<Driver>>) -> Vec<AcceptedFlow> {
    let mut driver = driver.lock();
    let handles: Vec<SocketHandle> = driver.sockets.iter().map(|(handle, _)| handle).collect();
    let mut accepted = Vec::new();
    for handle in handles {
        let established = {
            let socket = driver.sockets.get::<tcp::Socket>(handle);
            socket.state() == tcp::State::Established
        };
        if !established {
            continue;
        }
        let (local, remote) = {
            let socket = driver.sockets.get::<tcp::Socket>(handle);
            match (socket.local_endpoint(), socket.remote_endpoint()) {
                (Some(local), Some(remote)) => (to_socket_addr(local), to_socket_addr(remote)),
                _ => continue,
            }
        };
        accepted.push(AcceptedFlow { handle, local, remote });
        if let Err(e) = arm_wildcard_listener(&mut driver.sockets) {
            warn!(error = %e, "failed to replenish wildcard listener pool");
        }
    }
    accepted
}

fn to_socket_addr(endpoint: smoltcp::wire::IpEndpoint) -> SocketAddr {
    let ip: IpAddr = match endpoint.addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(v4.into()),
        IpAddress::Ipv6(v6) => IpAddr::V6(v6.into()),
    };
    SocketAddr::new(ip, endpoint.port)
}

/// Bridges one smoltcp TCP socket to `tokio::io::{AsyncRead, AsyncWrite}`
/// so the forwarder's generic byte pump (written against real sockets)
/// can drive it unmodified. Backed by smoltcp's `register_recv_waker`/
/// `register_send_waker`, which exist specifically to let an embedder
/// wire a non-blocking socket into any async runtime.
struct SmolTcpStream {
    driver: Arc<Mutex<Driver>>,
    handle: SocketHandle,
}

impl SmolTcpStream {
    fn new(driver: Arc<Mutex<Driver>>, handle: SocketHandle) -> Self {
        Self { driver, handle }
    }
}

impl Drop for SmolTcpStream {
    fn drop(&mut self) {
        let mut driver = self.driver.lock();
        let socket = driver.sockets.get_mut::<tcp::Socket>(self.handle);
        socket.abort();
        driver.sockets.remove(self.handle);
    }
}

impl tokio::io::AsyncRead for SmolTcpStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut tokio::io::ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut driver = self.driver.lock();
        let socket = driver.sockets.get_mut::<tcp::Socket>(self.handle);

        if socket.can_recv() {
            let read = socket
                .recv_slice(buf.initialize_unfilled())
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            buf.advance(read);
            drop(driver);
            poll_iface_once(&self.driver);
            return Poll::Ready(Ok(()));
        }

        if !socket.may_recv() {
            return Poll::Ready(Ok(())); // EOF
        }

        socket.register_recv_waker(cx.waker());
        Poll::Pending
    }
}

impl tokio::io::AsyncWrite for SmolTcpStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let mut driver = self.driver.lock();
        let socket = driver.sockets.get_mut::<tcp::Socket>(self.handle);

        if !socket.may_send() {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed")));
        }

        if socket.can_send() {
            let written = socket
                .send_slice(data)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            drop(driver);
            poll_iface_once(&self.driver);
            return Poll::Ready(Ok(written));
        }

        socket.register_send_waker(cx.waker());
        Poll::Pending
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut driver = self.driver.lock();
        let socket = driver.sockets.get_mut::<tcp::Socket>(self.handle);
        socket.close();
        drop(driver);
        poll_iface_once(&self.driver);
        Poll::Ready(Ok(()))
    }
}

async fn handle_accepted_flow(
    flow: AcceptedFlow,
    driver: &Arc<Mutex<Driver>>,
    proxies: &ProxyDialerSet,
    reverse_map: &DnsReverseMap,
    host_nat: HostNatAddresses,
    nic: &NicHandle,
    icmp_identity: IcmpIdentity,
) -> NetstackResult<()> {
    use crate::netstack::forwarder::tcp::{apply_host_socket_options, dial_forward_target, is_do_not_forward, pump_generic};

    if is_do_not_forward(flow.remote.ip()) {
        debug!(remote = %flow.remote, "closing flow to do-not-forward destination");
        abort_flow(driver, flow.handle);
        return Ok(());
    }

    let host_stream = match dial_forward_target(flow.remote, host_nat, proxies, reverse_map).await {
        Ok(stream) => stream,
        Err(e) => {
            let signal = classify_dial_failure(raw_os_error(&e));
            debug!(remote = %flow.remote, error = %e, signal = ?signal, "host dial failed, signalling guest");
            match signal {
                GuestSignal::Reset => abort_flow(driver, flow.handle),
                GuestSignal::SilentDrop => remove_flow_silently(driver, flow.handle),
                GuestSignal::IcmpUnreachable(kind) => {
                    remove_flow_silently(driver, flow.handle);
                    send_icmp_unreachable(nic, icmp_identity, flow.local, flow.remote, kind);
                }
            }
            return Ok(());
        }
    };
    apply_host_socket_options(&host_stream, flow.remote.port()).map_err(NetstackError::HostSocket)?;

    let guest_side = SmolTcpStream::new(driver.clone(), flow.handle);
    match pump_generic(guest_side, host_stream).await {
        Ok((to_host, to_guest)) => {
            debug!(local = %flow.local, remote = %flow.remote, to_host, to_guest, "flow closed");
        }
        Err(e) => {
            debug!(local = %flow.local, remote = %flow.remote, error = %e, "flow pump ended with error");
        }
    }
    Ok(())
}

/// Extracts the raw errno a dial failed with, when one is available.
/// Proxy handshake failures carry no errno and are always silently
/// dropped by [`classify_dial_failure`].
fn raw_os_error(e: &ForwardError) -> Option<i32> {
    match e {
        ForwardError::Dial(io_err) => io_err.raw_os_error(),
        ForwardError::Proxy(_) => None,
    }
}

fn abort_flow(driver: &Arc<Mutex<Driver>>, handle: SocketHandle) {
    let mut driver = driver.lock();
    let socket = driver.sockets.get_mut::<tcp::Socket>(handle);
    socket.abort();
    driver.sockets.remove(handle);
}

/// Removes the socket without calling `abort()`, so no RST is queued:
/// the guest's side of the connection simply goes unanswered until its
/// own retransmission timer gives up (§4.7's silent-drop branch).
fn remove_flow_silently(driver: &Arc<Mutex<Driver>>, handle: SocketHandle) {
    driver.lock().sockets.remove(handle);
}

/// Synthesizes and enqueues a destination-unreachable ICMP reply for a
/// host dial that failed with an errno the mapping table routes to
/// ICMP. Enqueue failures (e.g. a saturated frame channel) are logged
/// and otherwise ignored — the guest's own retransmissions eventually
/// time out even if the reply is lost.
fn send_icmp_unreachable(nic: &NicHandle, identity: IcmpIdentity, guest_addr: SocketAddr, destination_addr: SocketAddr, kind: icmp::UnreachableKind) {
    match icmp::build_unreachable_frame(
        identity.host_mac,
        identity.guest_mac,
        identity.gateway_v4,
        identity.gateway_v6,
        guest_addr,
        destination_addr,
        kind,
    ) {
        Some(frame) => {
            if nic.try_send(frame).is_err() {
                warn!(guest = %guest_addr, destination = %destination_addr, "failed to enqueue synthetic ICMP unreachable frame");
            }
        }
        None => warn!(guest = %guest_addr, destination = %destination_addr, "cannot synthesize ICMP unreachable frame for mismatched address families"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_socket_buffers_are_nagle_disabled() {
        let socket = new_tcp_socket();
        assert!(!socket.nagle_enabled());
    }

    #[test]
    fn socket_addr_conversion_round_trips_v4() {
        let endpoint = smoltcp::wire::IpEndpoint {
            addr: IpAddress::Ipv4(Ipv4Address::new(198, 19, 249, 2)),
            port: 8080,
        };
        assert_eq!(to_socket_addr(endpoint), "198.19.249.2:8080".parse().unwrap());
    }

    #[test]
    fn socket_addr_conversion_round_trips_v6() {
        let endpoint = smoltcp::wire::IpEndpoint {
            addr: IpAddress::Ipv6(Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)),
            port: 53,
        };
        let addr = to_socket_addr(endpoint);
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 53);
    }
}

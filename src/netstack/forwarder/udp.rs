//! UDP Forwarder (spec.md §4.8): per-flow conntrack with idle timeout,
//! source-port-preserving host binds, and TTL propagation.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smoltcp::wire::EthernetAddress;
use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::netstack::icmp::internet_checksum;

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestFlowKey {
    pub guest_source: SocketAddr,
    pub guest_destination: SocketAddr,
}

struct FlowEntry {
    socket: std::sync::Arc<UdpSocket>,
    last_seen: Instant,
    last_guest_ttl: Option<u32>,
}

/// Remembers the actual bound port used for a guest source port once a
/// dynamic fallback bind has happened, so later flows from the same
/// guest port keep reusing it (§4.8: "remember the mapping... so
/// subsequent retries keep the same mapping").
#[derive(Default)]
pub struct PortMappingMemo {
    mappings: Mutex<HashMap<u16, u16>>,
}

impl PortMappingMemo {
    pub fn remembered(&self, guest_port: u16) -> Option<u16> {
        self.mappings.lock().get(&guest_port).copied()
    }

    pub fn remember(&self, guest_port: u16, actual_port: u16) {
        self.mappings.lock().insert(guest_port, actual_port);
    }
}

pub struct UdpConntrack {
    flows: Mutex<HashMap<GuestFlowKey, FlowEntry>>,
    memo: PortMappingMemo,
}

impl Default for UdpConntrack {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpConntrack {
    pub fn new() -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            memo: PortMappingMemo::default(),
        }
    }

    /// Drops flows idle past [`IDLE_TIMEOUT`]. Called periodically by
    /// the forwarder's driving loop.
    pub fn sweep_idle(&self) {
        let now = Instant::now();
        self.flows.lock().retain(|_, entry| now.duration_since(entry.last_seen) < IDLE_TIMEOUT);
    }

    pub fn touch(&self, key: &GuestFlowKey) {
        if let Some(entry) = self.flows.lock().get_mut(key) {
            entry.last_seen = Instant::now();
        }
    }

    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memo(&self) -> &PortMappingMemo {
        &self.memo
    }

    /// Returns the flow's host socket, creating it via `create` on
    /// first sight of `key`. The returned bool is `true` when the
    /// flow was just created, so the caller knows whether to spin up
    /// a reply-reading task.
    pub fn get_or_create<F>(&self, key: GuestFlowKey, create: F) -> io::Result<(Arc<UdpSocket>, bool)>
    where
        F: FnOnce() -> io::Result<UdpSocket>,
    {
        let mut flows = self.flows.lock();
        if let Some(entry) = flows.get_mut(&key) {
            entry.last_seen = Instant::now();
            return Ok((entry.socket.clone(), false));
        }
        let socket = Arc::new(create()?);
        flows.insert(
            key,
            FlowEntry {
                socket: socket.clone(),
                last_seen: Instant::now(),
                last_guest_ttl: None,
            },
        );
        Ok((socket, true))
    }

    /// Propagates a newly observed guest TTL to the flow's host
    /// socket, a no-op if the flow is gone or the TTL hasn't changed.
    pub fn resync_ttl(&self, key: &GuestFlowKey, host_source_ip: IpAddr, guest_ttl: u32) {
        let mut flows = self.flows.lock();
        if let Some(entry) = flows.get_mut(key) {
            maybe_resync_ttl(&mut entry.last_guest_ttl, &entry.socket, host_source_ip, guest_ttl);
        }
    }
}

/// Resolves the host source IP that should be used for a destination
/// by opening a throwaway connected socket and reading back its local
/// address (§4.8: "the source IP must be resolved by opening a
/// throwaway connect call to the destination").
pub fn resolve_host_source_ip(destination: SocketAddr) -> io::Result<IpAddr> {
    let probe = std::net::UdpSocket::bind(match destination {
        SocketAddr::V4(_) => "0.0.0.0:0",
        SocketAddr::V6(_) => "[::]:0",
    })?;
    probe.connect(destination)?;
    Ok(probe.local_addr()?.ip())
}

/// Binds the host UDP socket for a new flow: `SO_REUSEADDR|SO_REUSEPORT`
/// on the guest's source port and the resolved host source IP, falling
/// back to a dynamic bind (remembering the mapping) if the requested
/// port is privileged or already bound with that source IP.
pub fn bind_host_socket(guest_source_port: u16, host_source_ip: IpAddr, memo: &PortMappingMemo) -> io::Result<(Socket, u16)> {
    if let Some(actual_port) = memo.remembered(guest_source_port) {
        return bind_exact(host_source_ip, actual_port).map(|socket| (socket, actual_port));
    }

    if guest_source_port >= 1024 {
        match bind_exact(host_source_ip, guest_source_port) {
            Ok(socket) => return Ok((socket, guest_source_port)),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                debug!(guest_source_port, "requested UDP port in use, falling back to dynamic bind");
            }
            Err(e) => return Err(e),
        }
    }

    let socket = bind_exact(host_source_ip, 0)?;
    let actual_port = local_port(&socket)?;
    memo.remember(guest_source_port, actual_port);
    Ok((socket, actual_port))
}

fn bind_exact(host_source_ip: IpAddr, port: u16) -> io::Result<Socket> {
    let domain = match host_source_ip {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::new(host_source_ip, port).into())?;
    enable_receive_ttl(&socket, host_source_ip)?;
    Ok(socket)
}

fn local_port(socket: &Socket) -> io::Result<u16> {
    Ok(socket.local_addr()?.as_socket().map(|a| a.port()).unwrap_or(0))
}

/// Enables receive-TTL (IPv4) / receive-hop-limit (IPv6) so the
/// forwarder can relay the guest's TTL back on reply (§4.8).
fn enable_receive_ttl(socket: &Socket, host_source_ip: IpAddr) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    let on: libc::c_int = 1;
    let result = match host_source_ip {
        IpAddr::V4(_) => unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_RECVTTL,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        },
        IpAddr::V6(_) => unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_RECVHOPLIMIT,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        },
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Sets the socket's outgoing unicast TTL/hop-limit, used on reply
/// when the guest-side TTL changed since the last packet (§4.8: "once
/// per change; best-effort").
pub fn set_unicast_ttl(socket: &UdpSocket, host_source_ip: IpAddr, ttl: u32) -> io::Result<()> {
    match host_source_ip {
        IpAddr::V4(_) => socket.set_ttl(ttl),
        IpAddr::V6(_) => socket.set_broadcast(false).and_then(|_| {
            // tokio::net::UdpSocket has no set_hop_limit; fall back to
            // the raw socket option via libc on the underlying fd.
            use std::os::unix::io::AsRawFd;
            let fd = socket.as_raw_fd();
            let value = ttl as libc::c_int;
            let result = unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_IPV6,
                    libc::IPV6_UNICAST_HOPS,
                    &value as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if result != 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }),
    }
}

/// Applies a newly observed guest TTL to the flow's host socket,
/// skipping the syscall if it matches the last value applied.
pub fn maybe_resync_ttl(entry_last_ttl: &mut Option<u32>, socket: &UdpSocket, host_source_ip: IpAddr, guest_ttl: u32) {
    if *entry_last_ttl == Some(guest_ttl) {
        return;
    }
    match set_unicast_ttl(socket, host_source_ip, guest_ttl) {
        Ok(()) => *entry_last_ttl = Some(guest_ttl),
        Err(e) => warn!(error = %e, "failed to resync UDP unicast TTL"),
    }
}

/// Builds a reply frame carrying a host-side datagram back to the
/// guest. The forward path demuxes guest UDP off a raw smoltcp socket
/// rather than a bound `udp::Socket`, so the reply side is built the
/// same way: by hand, straight onto the wire, mirroring
/// [`crate::netstack::icmp`]'s frame construction.
pub fn build_reply_frame(host_mac: EthernetAddress, guest_mac: EthernetAddress, from: SocketAddr, to: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    match (from, to) {
        (SocketAddr::V4(from), SocketAddr::V4(to)) => Some(build_reply_v4(host_mac, guest_mac, from, to, payload)),
        (SocketAddr::V6(from), SocketAddr::V6(to)) => Some(build_reply_v6(host_mac, guest_mac, from, to, payload)),
        _ => None,
    }
}

fn build_reply_v4(host_mac: EthernetAddress, guest_mac: EthernetAddress, from: std::net::SocketAddrV4, to: std::net::SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let mut udp = vec![0u8; udp_len];
    udp[0..2].copy_from_slice(&from.port().to_be_bytes());
    udp[2..4].copy_from_slice(&to.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[8..].copy_from_slice(payload);

    let mut pseudo = Vec::with_capacity(12 + udp_len);
    pseudo.extend_from_slice(&from.ip().octets());
    pseudo.extend_from_slice(&to.ip().octets());
    pseudo.push(0);
    pseudo.push(17);
    pseudo.extend_from_slice(&(udp_len as u16).to_be_bytes());
    pseudo.extend_from_slice(&udp);
    let checksum = internet_checksum(&pseudo);
    udp[6..8].copy_from_slice(&checksum.to_be_bytes());

    let total_len = 20 + udp_len;
    let mut ip = vec![0u8; total_len];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    ip[6] = 0x40;
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&from.ip().octets());
    ip[16..20].copy_from_slice(&to.ip().octets());
    let ip_checksum = internet_checksum(&ip[..20]);
    ip[10..12].copy_from_slice(&ip_checksum.to_be_bytes());
    ip[20..].copy_from_slice(&udp);

    let mut frame = vec![0u8; 14 + total_len];
    frame[0..6].copy_from_slice(&guest_mac.0);
    frame[6..12].copy_from_slice(&host_mac.0);
    frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    frame[14..].copy_from_slice(&ip);
    frame
}

fn build_reply_v6(host_mac: EthernetAddress, guest_mac: EthernetAddress, from: std::net::SocketAddrV6, to: std::net::SocketAddrV6, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let mut udp = vec![0u8; udp_len];
    udp[0..2].copy_from_slice(&from.port().to_be_bytes());
    udp[2..4].copy_from_slice(&to.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[8..].copy_from_slice(payload);

    let mut pseudo = Vec::with_capacity(40 + udp_len);
    pseudo.extend_from_slice(&from.ip().octets());
    pseudo.extend_from_slice(&to.ip().octets());
    pseudo.extend_from_slice(&(udp_len as u32).to_be_bytes());
    pseudo.extend_from_slice(&[0, 0, 0, 17]);
    pseudo.extend_from_slice(&udp);
    let checksum = internet_checksum(&pseudo);
    udp[6..8].copy_from_slice(&checksum.to_be_bytes());

    let payload_len = udp_len;
    let mut ip = vec![0u8; 40 + payload_len];
    ip[0] = 0x60;
    ip[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    ip[6] = 17;
    ip[7] = 64;
    ip[8..24].copy_from_slice(&from.ip().octets());
    ip[24..40].copy_from_slice(&to.ip().octets());
    ip[40..].copy_from_slice(&udp);

    let mut frame = vec![0u8; 14 + ip.len()];
    frame[0..6].copy_from_slice(&guest_mac.0);
    frame[6..12].copy_from_slice(&host_mac.0);
    frame[12..14].copy_from_slice(&0x86ddu16.to_be_bytes());
    frame[14..].copy_from_slice(&ip);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_mapping_memo_round_trips() {
        let memo = PortMappingMemo::default();
        assert_eq!(memo.remembered(500), None);
        memo.remember(500, 41000);
        assert_eq!(memo.remembered(500), Some(41000));
    }

    #[test]
    fn conntrack_tracks_flow_count() {
        let conntrack = UdpConntrack::new();
        assert!(conntrack.is_empty());
    }

    #[test]
    fn resolve_host_source_ip_for_loopback_destination() {
        let ip = resolve_host_source_ip("127.0.0.1:9".parse().unwrap()).unwrap();
        assert!(ip.is_loopback());
    }

    #[test]
    fn dynamic_bind_falls_back_for_privileged_port() {
        let memo = PortMappingMemo::default();
        let (_, actual_port) = bind_host_socket(53, IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), &memo).unwrap();
        assert_ne!(actual_port, 53);
        assert_eq!(memo.remembered(53), Some(actual_port));
    }

    #[test]
    fn reply_frame_v4_has_correct_layout() {
        let host_mac = EthernetAddress([0x52, 0x54, 0, 0, 0, 2]);
        let guest_mac = EthernetAddress([0x52, 0x54, 0, 0, 0, 1]);
        let from: SocketAddr = "10.0.2.1:53".parse().unwrap();
        let to: SocketAddr = "10.0.2.15:40000".parse().unwrap();
        let frame = build_reply_frame(host_mac, guest_mac, from, to, b"hello").unwrap();
        assert_eq!(&frame[0..6], &guest_mac.0);
        assert_eq!(&frame[6..12], &host_mac.0);
        assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), 0x0800);
        let ip = &frame[14..];
        assert_eq!(ip[9], 17);
        let udp = &ip[20..];
        assert_eq!(u16::from_be_bytes([udp[0], udp[1]]), 53);
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), 40000);
        assert_eq!(&udp[8..], b"hello");
    }

    #[test]
    fn reply_frame_rejects_mismatched_families() {
        let host_mac = EthernetAddress([0, 0, 0, 0, 0, 1]);
        let guest_mac = EthernetAddress([0, 0, 0, 0, 0, 2]);
        let from: SocketAddr = "10.0.2.1:53".parse().unwrap();
        let to: SocketAddr = "[fe80::1]:53".parse().unwrap();
        assert!(build_reply_frame(host_mac, guest_mac, from, to, b"x").is_none());
    }
}

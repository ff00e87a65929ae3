//! ICMP forwarder (spec.md §4.6's last paragraph): synthetic
//! destination-unreachable replies for failed TCP dials, and the
//! errno→ICMP-code mapping used by the TCP forwarder (§4.7).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use smoltcp::wire::EthernetAddress;

/// The two destination-unreachable flavors §4.7 distinguishes by
/// errno. Net-unreachable means the network itself is unroutable;
/// host/address-unreachable means the network is fine but the host or
/// address on it didn't answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreachableKind {
    Net,
    HostOrAddress,
}

/// Maps a host dial `io::ErrorKind`/raw OS error to an unreachable
/// kind, or `None` if the error should not generate ICMP at all
/// (§4.7's RST and silent-drop branches are handled by the caller
/// before reaching this function).
pub fn classify_dial_error(raw_os_error: Option<i32>) -> Option<UnreachableKind> {
    match raw_os_error {
        Some(libc::EHOSTUNREACH) | Some(libc::EHOSTDOWN) => Some(UnreachableKind::HostOrAddress),
        Some(libc::ENETUNREACH) => Some(UnreachableKind::Net),
        _ => None,
    }
}

/// ICMPv4 type 3 codes (RFC 792) used for the synthetic reply.
mod icmpv4_code {
    pub const NET_UNREACHABLE: u8 = 0;
    pub const HOST_UNREACHABLE: u8 = 1;
}

/// ICMPv6 type 1 codes (RFC 4443) used for the synthetic reply.
mod icmpv6_code {
    pub const NO_ROUTE_TO_DESTINATION: u8 = 0;
    pub const ADDRESS_UNREACHABLE: u8 = 3;
}

pub fn icmpv4_unreachable_code(kind: UnreachableKind) -> u8 {
    match kind {
        UnreachableKind::Net => icmpv4_code::NET_UNREACHABLE,
        UnreachableKind::HostOrAddress => icmpv4_code::HOST_UNREACHABLE,
    }
}

pub fn icmpv6_unreachable_code(kind: UnreachableKind) -> u8 {
    match kind {
        UnreachableKind::Net => icmpv6_code::NO_ROUTE_TO_DESTINATION,
        UnreachableKind::HostOrAddress => icmpv6_code::ADDRESS_UNREACHABLE,
    }
}

/// Picks the right code family for the synthetic reply's code byte
/// given the failing flow's destination address.
pub fn unreachable_code_for(destination: IpAddr, kind: UnreachableKind) -> u8 {
    match destination {
        IpAddr::V4(_) => icmpv4_unreachable_code(kind),
        IpAddr::V6(_) => icmpv6_unreachable_code(kind),
    }
}

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const IP_PROTO_ICMPV4: u8 = 1;
const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_ICMPV6: u8 = 58;

/// RFC 1071 internet checksum over a byte slice that may carry an odd
/// trailing byte (treated as the high byte of a final zero-padded
/// word).
pub(crate) fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = *chunks.remainder() {
        sum += (last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Builds a synthetic Ethernet+IP+ICMP "destination unreachable" frame
/// addressed back to the guest, in reply to a host dial that failed
/// with an errno the error-to-guest mapping routes to ICMP (§4.7).
/// `guest_addr` is the failed flow's own address (the reply's
/// destination); `destination_addr` is the address the dial was aimed
/// at, embedded as the packet-in-error per RFC 792/4443. Returns
/// `None` if the two addresses are not the same IP family, which
/// cannot happen for a flow accepted off a single-family socket but is
/// guarded against rather than assumed.
pub fn build_unreachable_frame(
    host_mac: EthernetAddress,
    guest_mac: EthernetAddress,
    gateway_v4: Ipv4Addr,
    gateway_v6: Ipv6Addr,
    guest_addr: SocketAddr,
    destination_addr: SocketAddr,
    kind: UnreachableKind,
) -> Option<Vec<u8>> {
    match (guest_addr, destination_addr) {
        (SocketAddr::V4(guest), SocketAddr::V4(dest)) => {
            Some(build_icmpv4_unreachable(host_mac, guest_mac, gateway_v4, guest, dest, kind))
        }
        (SocketAddr::V6(guest), SocketAddr::V6(dest)) => {
            Some(build_icmpv6_unreachable(host_mac, guest_mac, gateway_v6, guest, dest, kind))
        }
        _ => None,
    }
}

fn build_icmpv4_unreachable(
    host_mac: EthernetAddress,
    guest_mac: EthernetAddress,
    gateway: Ipv4Addr,
    guest: std::net::SocketAddrV4,
    dest: std::net::SocketAddrV4,
    kind: UnreachableKind,
) -> Vec<u8> {
    // Packet in error: a minimal 20-byte IPv4 header plus the first 8
    // bytes of the original TCP segment (source/destination port). The
    // sequence number is not available once the socket has moved past
    // the SYN and is zeroed; guests match the error by 4-tuple, not by
    // sequence number.
    let mut inner = [0u8; 28];
    inner[0] = 0x45;
    inner[2..4].copy_from_slice(&28u16.to_be_bytes());
    inner[8] = 64;
    inner[9] = IP_PROTO_TCP;
    inner[12..16].copy_from_slice(&guest.ip().octets());
    inner[16..20].copy_from_slice(&dest.ip().octets());
    let inner_checksum = internet_checksum(&inner[..20]);
    inner[10..12].copy_from_slice(&inner_checksum.to_be_bytes());
    inner[20..22].copy_from_slice(&guest.port().to_be_bytes());
    inner[22..24].copy_from_slice(&dest.port().to_be_bytes());

    let mut icmp = vec![0u8; 8 + inner.len()];
    icmp[0] = 3; // Destination Unreachable
    icmp[1] = icmpv4_unreachable_code(kind);
    icmp[8..].copy_from_slice(&inner);
    let icmp_checksum = internet_checksum(&icmp);
    icmp[2..4].copy_from_slice(&icmp_checksum.to_be_bytes());

    let mut ip = vec![0u8; 20 + icmp.len()];
    let ip_len = ip.len() as u16;
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&ip_len.to_be_bytes());
    ip[6] = 0x40; // don't fragment
    ip[8] = 64;
    ip[9] = IP_PROTO_ICMPV4;
    ip[12..16].copy_from_slice(&gateway.octets());
    ip[16..20].copy_from_slice(&guest.ip().octets());
    let ip_checksum = internet_checksum(&ip[..20]);
    ip[10..12].copy_from_slice(&ip_checksum.to_be_bytes());
    ip[20..].copy_from_slice(&icmp);

    let mut frame = vec![0u8; 14 + ip.len()];
    frame[0..6].copy_from_slice(&guest_mac.0);
    frame[6..12].copy_from_slice(&host_mac.0);
    frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    frame[14..].copy_from_slice(&ip);
    frame
}

fn build_icmpv6_unreachable(
    host_mac: EthernetAddress,
    guest_mac: EthernetAddress,
    gateway: Ipv6Addr,
    guest: std::net::SocketAddrV6,
    dest: std::net::SocketAddrV6,
    kind: UnreachableKind,
) -> Vec<u8> {
    // Packet in error: a minimal 40-byte IPv6 header plus the first 8
    // bytes of the original TCP segment, as above.
    let mut inner = [0u8; 48];
    inner[0] = 0x60;
    inner[4..6].copy_from_slice(&8u16.to_be_bytes());
    inner[6] = IP_PROTO_TCP;
    inner[7] = 64;
    inner[8..24].copy_from_slice(&guest.ip().octets());
    inner[24..40].copy_from_slice(&dest.ip().octets());
    inner[40..42].copy_from_slice(&guest.port().to_be_bytes());
    inner[42..44].copy_from_slice(&dest.port().to_be_bytes());

    let mut icmp = vec![0u8; 8 + inner.len()];
    icmp[0] = 1; // Destination Unreachable
    icmp[1] = icmpv6_unreachable_code(kind);
    icmp[8..].copy_from_slice(&inner);

    let mut pseudo_and_icmp = Vec::with_capacity(40 + icmp.len());
    pseudo_and_icmp.extend_from_slice(&gateway.octets());
    pseudo_and_icmp.extend_from_slice(&guest.ip().octets());
    pseudo_and_icmp.extend_from_slice(&(icmp.len() as u32).to_be_bytes());
    pseudo_and_icmp.extend_from_slice(&[0, 0, 0, IP_PROTO_ICMPV6]);
    pseudo_and_icmp.extend_from_slice(&icmp);
    let icmp_checksum = internet_checksum(&pseudo_and_icmp);
    icmp[2..4].copy_from_slice(&icmp_checksum.to_be_bytes());

    let mut ip = vec![0u8; 40 + icmp.len()];
    ip[0] = 0x60;
    ip[4..6].copy_from_slice(&(icmp.len() as u16).to_be_bytes());
    ip[6] = IP_PROTO_ICMPV6;
    ip[7] = 64;
    ip[8..24].copy_from_slice(&gateway.octets());
    ip[24..40].copy_from_slice(&guest.ip().octets());
    ip[40..].copy_from_slice(&icmp);

    let mut frame = vec![0u8; 14 + ip.len()];
    frame[0..6].copy_from_slice(&guest_mac.0);
    frame[6..12].copy_from_slice(&host_mac.0);
    frame[12..14].copy_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
    frame[14..].copy_from_slice(&ip);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_unreachable_errno_maps_to_host_kind() {
        assert_eq!(classify_dial_error(Some(libc::EHOSTUNREACH)), Some(UnreachableKind::HostOrAddress));
        assert_eq!(classify_dial_error(Some(libc::EHOSTDOWN)), Some(UnreachableKind::HostOrAddress));
    }

    #[test]
    fn net_unreachable_errno_maps_to_net_kind() {
        assert_eq!(classify_dial_error(Some(libc::ENETUNREACH)), Some(UnreachableKind::Net));
    }

    #[test]
    fn connection_refused_does_not_generate_icmp() {
        assert_eq!(classify_dial_error(Some(libc::ECONNREFUSED)), None);
    }

    #[test]
    fn code_selection_matches_address_family() {
        let v4: IpAddr = "93.184.216.34".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(unreachable_code_for(v4, UnreachableKind::Net), icmpv4_code::NET_UNREACHABLE);
        assert_eq!(unreachable_code_for(v4, UnreachableKind::HostOrAddress), icmpv4_code::HOST_UNREACHABLE);
        assert_eq!(unreachable_code_for(v6, UnreachableKind::Net), icmpv6_code::NO_ROUTE_TO_DESTINATION);
        assert_eq!(unreachable_code_for(v6, UnreachableKind::HostOrAddress), icmpv6_code::ADDRESS_UNREACHABLE);
    }

    #[test]
    fn v4_unreachable_frame_has_correct_layout_and_checksums() {
        let frame = build_unreachable_frame(
            EthernetAddress([0x52, 0x54, 0x00, 0, 0, 2]),
            EthernetAddress([0x52, 0x54, 0x00, 0, 0, 1]),
            Ipv4Addr::new(198, 19, 249, 1),
            Ipv6Addr::UNSPECIFIED,
            "198.19.249.2:51000".parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
            UnreachableKind::HostOrAddress,
        )
        .unwrap();

        assert_eq!(&frame[0..6], &[0x52, 0x54, 0x00, 0, 0, 1]);
        assert_eq!(&frame[6..12], &[0x52, 0x54, 0x00, 0, 0, 2]);
        assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), ETHERTYPE_IPV4);

        let ip = &frame[14..];
        assert_eq!(ip[9], IP_PROTO_ICMPV4);
        assert_eq!(internet_checksum(&ip[..20]), 0);

        let icmp = &ip[20..];
        assert_eq!(icmp[0], 3);
        assert_eq!(icmp[1], icmpv4_code::HOST_UNREACHABLE);
        assert_eq!(internet_checksum(icmp), 0);
    }

    #[test]
    fn mismatched_address_families_yield_none() {
        let v4: SocketAddr = "198.19.249.2:1".parse().unwrap();
        let v6: SocketAddr = "[fd00::1]:1".parse().unwrap();
        assert!(build_unreachable_frame(
            EthernetAddress([0; 6]),
            EthernetAddress([0; 6]),
            Ipv4Addr::UNSPECIFIED,
            Ipv6Addr::UNSPECIFIED,
            v4,
            v6,
            UnreachableKind::Net,
        )
        .is_none());
    }
}

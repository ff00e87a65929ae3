//! Link layer (C2a): Ethernet framing over a duplex datagram endpoint,
//! plus the virtio-net GSO header used when the negotiated MTU exceeds
//! the base 1500 (spec.md §6's "exact header layout is
//! interoperability-critical" warning).

use std::sync::Arc;

use smoltcp::phy::{Checksum, ChecksumCapabilities, Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use tokio::sync::mpsc;

/// Flags per the virtio-net ABI (`VIRTIO_NET_HDR_F_*`).
pub mod flags {
    pub const NEEDS_CSUM: u8 = 1;
    pub const DATA_VALID: u8 = 2;
    pub const RSC_INFO: u8 = 4;
}

/// GSO types per the virtio-net ABI (`VIRTIO_NET_HDR_GSO_*`).
pub mod gso_type {
    pub const NONE: u8 = 0;
    pub const TCPV4: u8 = 1;
    pub const UDP: u8 = 3;
    pub const TCPV6: u8 = 4;
}

/// 12-byte little-endian virtio-net header, present on every packet
/// when the link's negotiated MTU exceeds 1500 (spec.md §6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtioNetHeader {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

pub const VIRTIO_NET_HEADER_LEN: usize = 12;

impl VirtioNetHeader {
    pub fn encode(&self) -> [u8; VIRTIO_NET_HEADER_LEN] {
        let mut buf = [0u8; VIRTIO_NET_HEADER_LEN];
        buf[0] = self.flags;
        buf[1] = self.gso_type;
        buf[2..4].copy_from_slice(&self.hdr_len.to_le_bytes());
        buf[4..6].copy_from_slice(&self.gso_size.to_le_bytes());
        buf[6..8].copy_from_slice(&self.csum_start.to_le_bytes());
        buf[8..10].copy_from_slice(&self.csum_offset.to_le_bytes());
        buf[10..12].copy_from_slice(&self.num_buffers.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < VIRTIO_NET_HEADER_LEN {
            return None;
        }
        Some(Self {
            flags: buf[0],
            gso_type: buf[1],
            hdr_len: u16::from_le_bytes([buf[2], buf[3]]),
            gso_size: u16::from_le_bytes([buf[4], buf[5]]),
            csum_start: u16::from_le_bytes([buf[6], buf[7]]),
            csum_offset: u16::from_le_bytes([buf[8], buf[9]]),
            num_buffers: u16::from_le_bytes([buf[10], buf[11]]),
        })
    }
}

/// A single Ethernet frame, queued in either direction between this
/// process and the VMM's duplex datagram endpoint.
pub type Frame = Vec<u8>;

/// NIC wrapping a duplex datagram channel: one side is handed to the
/// VMM (out of process), the other is retained here as plain mpsc
/// channels. A callback-based endpoint can be adapted to the same
/// channel shape by a thin bridging task, so this single device
/// implementation covers both runtime choices spec.md §4.6 describes.
pub struct DatagramNic {
    rx: mpsc::Receiver<Frame>,
    tx: mpsc::Sender<Frame>,
    mtu: u16,
    gso_enabled: bool,
}

impl DatagramNic {
    pub fn new(rx: mpsc::Receiver<Frame>, tx: mpsc::Sender<Frame>, mtu: u16) -> Self {
        Self {
            rx,
            tx,
            mtu,
            gso_enabled: mtu > 1500,
        }
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }
}

pub struct NicRxToken(Frame);
pub struct NicTxToken {
    sender: mpsc::Sender<Frame>,
    gso_enabled: bool,
}

impl RxToken for NicRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let payload = if self.0.len() >= VIRTIO_NET_HEADER_LEN {
            &mut self.0[VIRTIO_NET_HEADER_LEN..]
        } else {
            &mut self.0[..]
        };
        f(payload)
    }
}

impl TxToken for NicTxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let header_len = if self.gso_enabled { VIRTIO_NET_HEADER_LEN } else { 0 };
        let mut frame = vec![0u8; header_len + len];
        if self.gso_enabled {
            let header = VirtioNetHeader {
                gso_type: gso_type::NONE,
                ..Default::default()
            };
            frame[..VIRTIO_NET_HEADER_LEN].copy_from_slice(&header.encode());
        }
        let result = f(&mut frame[header_len..]);
        let _ = self.sender.try_send(frame);
        result
    }
}

impl Device for DatagramNic {
    type RxToken<'a> = NicRxToken where Self: 'a;
    type TxToken<'a> = NicTxToken where Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.try_recv().ok()?;
        Some((
            NicRxToken(frame),
            NicTxToken {
                sender: self.tx.clone(),
                gso_enabled: self.gso_enabled,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(NicTxToken {
            sender: self.tx.clone(),
            gso_enabled: self.gso_enabled,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = self.mtu as usize;
        let mut checksums = ChecksumCapabilities::default();
        if self.gso_enabled {
            // Host RX checksum offload is advertised to the guest when
            // GSO is active; smoltcp still computes checksums on
            // transmit since this device does not do hardware offload.
            checksums.ipv4 = Checksum::Both;
            checksums.tcp = Checksum::Both;
            checksums.udp = Checksum::Both;
        }
        caps.checksum = checksums;
        caps
    }
}

/// Shared handle used by the stack and the forwarders to enqueue raw
/// frames without going through smoltcp (e.g. a synthesized ICMP
/// reply).
pub type NicHandle = Arc<mpsc::Sender<Frame>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtio_header_round_trips() {
        let header = VirtioNetHeader {
            flags: flags::DATA_VALID,
            gso_type: gso_type::TCPV4,
            hdr_len: 66,
            gso_size: 1448,
            csum_start: 34,
            csum_offset: 16,
            num_buffers: 1,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), VIRTIO_NET_HEADER_LEN);
        let decoded = VirtioNetHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn decode_rejects_short_buffers() {
        assert!(VirtioNetHeader::decode(&[0u8; 4]).is_none());
    }

    #[test]
    fn header_byte_layout_is_little_endian() {
        let header = VirtioNetHeader {
            flags: 1,
            gso_type: 0,
            hdr_len: 0x0102,
            gso_size: 0,
            csum_start: 0,
            csum_offset: 0,
            num_buffers: 0,
        };
        let encoded = header.encode();
        assert_eq!(encoded[2], 0x02);
        assert_eq!(encoded[3], 0x01);
    }
}

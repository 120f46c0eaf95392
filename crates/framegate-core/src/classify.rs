//! # Packet Classification
//!
//! Extracts the three facts the admission filter needs from a packet: its
//! size, whether it belongs to the target flow, and whether it carries the
//! RTP marker bit (last packet of a video frame).
//!
//! Anything that cannot be parsed (truncated headers, non-IPv4, wrong
//! protocol, address or port) is simply "not our flow" and bypasses the
//! filter. Classification never fails.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

const ETH_HEADER_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const IPV4_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const TCP_MIN_HEADER_LEN: usize = 20;
/// RFC 4571 length prefix in front of each RTP packet on a TCP stream.
const RTP_TCP_FRAMING_LEN: usize = 2;
const RTP_HEADER_LEN: usize = 12;
const RTP_MARKER_BIT: u8 = 0x80;

/// Ethernet + IPv4 (no options) + UDP header bytes a relayed datagram
/// occupies on the link in addition to its payload.
pub const UDP_WIRE_OVERHEAD: u64 = (ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN + UDP_HEADER_LEN) as u64;

/// Transport protocol of the target flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
}

impl Protocol {
    /// IANA protocol number carried in the IPv4 header.
    pub fn number(&self) -> u8 {
        match self {
            Protocol::Udp => 17,
            Protocol::Tcp => 6,
        }
    }
}

/// Match criteria for the one flow subject to admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowMatch {
    pub protocol: Protocol,
    /// `None` matches any destination address.
    pub dst_addr: Option<Ipv4Addr>,
    pub dst_port: u16,
}

impl FlowMatch {
    pub fn matches(&self, protocol: u8, dst_addr: Ipv4Addr, dst_port: u16) -> bool {
        protocol == self.protocol.number()
            && self.dst_addr.map_or(true, |want| want == dst_addr)
            && dst_port == self.dst_port
    }
}

/// Per-packet metadata consumed by the admission filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    /// Bytes charged against the window budget.
    pub size: u64,
    pub matches_target_flow: bool,
    /// RTP marker bit: this packet ends an application frame.
    pub is_frame_boundary: bool,
}

impl PacketMeta {
    /// A packet of the target flow.
    pub fn target(size: u64, is_frame_boundary: bool) -> Self {
        Self {
            size,
            matches_target_flow: true,
            is_frame_boundary,
        }
    }

    /// Traffic the filter must not touch.
    pub fn bypass(size: u64) -> Self {
        Self {
            size,
            matches_target_flow: false,
            is_frame_boundary: false,
        }
    }
}

/// Turns raw packet bytes into [`PacketMeta`].
pub trait PacketClassifier: Send + Sync {
    fn classify(&self, packet: &[u8]) -> PacketMeta;
}

/// Classifies full L2 frames: Ethernet II → IPv4 → UDP/TCP → RTP.
///
/// The budget is charged with the whole frame length, as seen on the wire.
#[derive(Debug, Clone, Copy)]
pub struct EthernetRtpClassifier {
    flow: FlowMatch,
}

impl EthernetRtpClassifier {
    pub fn new(flow: FlowMatch) -> Self {
        Self { flow }
    }

    fn parse(&self, frame: &[u8]) -> Option<bool> {
        let ethertype = u16::from_be_bytes([*frame.get(12)?, *frame.get(13)?]);
        if ethertype != ETHERTYPE_IPV4 {
            return None;
        }

        let ip = frame.get(ETH_HEADER_LEN..)?;
        if ip.len() < IPV4_MIN_HEADER_LEN || ip[0] >> 4 != 4 {
            return None;
        }
        let ihl = ((ip[0] & 0x0F) as usize) * 4;
        if ihl < IPV4_MIN_HEADER_LEN || ip.len() < ihl {
            return None;
        }
        let protocol = ip[9];
        let dst_addr = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);

        let l4 = &ip[ihl..];
        let (dst_port, rtp_offset) = match self.flow.protocol {
            Protocol::Udp if protocol == Protocol::Udp.number() => {
                if l4.len() < UDP_HEADER_LEN {
                    return None;
                }
                (u16::from_be_bytes([l4[2], l4[3]]), UDP_HEADER_LEN)
            }
            Protocol::Tcp if protocol == Protocol::Tcp.number() => {
                if l4.len() < TCP_MIN_HEADER_LEN {
                    return None;
                }
                let data_offset = ((l4[12] >> 4) as usize) * 4;
                if data_offset < TCP_MIN_HEADER_LEN {
                    return None;
                }
                (
                    u16::from_be_bytes([l4[2], l4[3]]),
                    data_offset + RTP_TCP_FRAMING_LEN,
                )
            }
            _ => return None,
        };
        if !self.flow.matches(protocol, dst_addr, dst_port) {
            return None;
        }

        let rtp = l4.get(rtp_offset..)?;
        rtp_marker(rtp)
    }
}

impl PacketClassifier for EthernetRtpClassifier {
    fn classify(&self, frame: &[u8]) -> PacketMeta {
        let size = frame.len() as u64;
        match self.parse(frame) {
            Some(marker) => PacketMeta::target(size, marker),
            None => PacketMeta::bypass(size),
        }
    }
}

/// Classifies UDP payloads already delivered to a relay socket.
///
/// The socket's local address stands in for the IPv4/UDP destination; the
/// payload must start with an RTP header. The budget is charged with the
/// payload plus [`UDP_WIRE_OVERHEAD`].
#[derive(Debug, Clone, Copy)]
pub struct RtpPayloadClassifier {
    flow_selected: bool,
}

impl RtpPayloadClassifier {
    pub fn new(flow: FlowMatch, local_addr: Ipv4Addr, local_port: u16) -> Self {
        Self {
            flow_selected: flow.matches(Protocol::Udp.number(), local_addr, local_port),
        }
    }

    /// Whether datagrams on the socket belong to the target flow at all.
    pub fn flow_selected(&self) -> bool {
        self.flow_selected
    }
}

impl PacketClassifier for RtpPayloadClassifier {
    fn classify(&self, payload: &[u8]) -> PacketMeta {
        let size = payload.len() as u64 + UDP_WIRE_OVERHEAD;
        if !self.flow_selected {
            return PacketMeta::bypass(size);
        }
        match rtp_marker(payload) {
            Some(marker) => PacketMeta::target(size, marker),
            None => PacketMeta::bypass(size),
        }
    }
}

fn rtp_marker(rtp: &[u8]) -> Option<bool> {
    if rtp.len() < RTP_HEADER_LEN {
        return None;
    }
    Some(rtp[1] & RTP_MARKER_BIT != 0)
}

/// Test and bench helpers that build synthetic frames.
pub mod frame {
    use super::*;

    /// Builds an Ethernet/IPv4/UDP/RTP frame with `payload_len` bytes after
    /// the RTP header.
    pub fn udp_rtp(dst: Ipv4Addr, dst_port: u16, marker: bool, payload_len: usize) -> Vec<u8> {
        let udp_len = UDP_HEADER_LEN + RTP_HEADER_LEN + payload_len;
        let ip_len = IPV4_MIN_HEADER_LEN + udp_len;
        let mut f = Vec::with_capacity(ETH_HEADER_LEN + ip_len);

        // Ethernet II
        f.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
        f.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
        f.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        // IPv4, IHL = 5
        f.push(0x45);
        f.push(0);
        f.extend_from_slice(&(ip_len as u16).to_be_bytes());
        f.extend_from_slice(&[0, 0, 0x40, 0]);
        f.push(64);
        f.push(Protocol::Udp.number());
        f.extend_from_slice(&[0, 0]);
        f.extend_from_slice(&[192, 168, 21, 1]);
        f.extend_from_slice(&dst.octets());

        // UDP
        f.extend_from_slice(&40_000u16.to_be_bytes());
        f.extend_from_slice(&dst_port.to_be_bytes());
        f.extend_from_slice(&(udp_len as u16).to_be_bytes());
        f.extend_from_slice(&[0, 0]);

        f.extend_from_slice(&rtp_header(marker));
        f.resize(f.len() + payload_len, 0xAB);
        f
    }

    /// A 12-byte RTP header (version 2, payload type 96).
    pub fn rtp_header(marker: bool) -> [u8; RTP_HEADER_LEN] {
        let mut h = [0u8; RTP_HEADER_LEN];
        h[0] = 0x80;
        h[1] = 96 | if marker { RTP_MARKER_BIT } else { 0 };
        h
    }
}

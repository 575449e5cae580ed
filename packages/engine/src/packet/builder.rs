// packages/engine/src/packet/builder.rs
//! Frame construction for replay scenarios, tests and benchmarks
//!
//! Frames come out with correct IPv4 and transport checksums so that any
//! checksum breakage downstream is attributable to the translator.

use crate::packet::buffer::PacketBuf;
use crate::packet::checksum::{self, IPPROTO_TCP, IPPROTO_UDP};
use crate::packet::headers::{
    ethertype, Ipv4View, TcpFlags, UdpView, ETH_HLEN, ETH_P_IP, IPPROTO_IPIP, IPV4_MIN_HLEN,
    TCP_MIN_HLEN, UDP_HLEN,
};
use crate::state::flow::Endpoint;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
const DEFAULT_TTL: u8 = 64;

/// Transport carried by a built frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Tcp { flags: TcpFlags },
    Udp { checksum: bool },
}

/// Ethernet + IPv4 (+ optional IP-in-IP) + TCP/UDP frame builder
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    src: Endpoint,
    dst: Endpoint,
    transport: Transport,
    payload: Vec<u8>,
    ip_options: Vec<u8>,
    outer: Option<(Ipv4Addr, Ipv4Addr)>,
}

impl FrameBuilder {
    pub fn tcp(src: Endpoint, dst: Endpoint, flags: TcpFlags) -> Self {
        Self::new(src, dst, Transport::Tcp { flags })
    }

    pub fn udp(src: Endpoint, dst: Endpoint) -> Self {
        Self::new(src, dst, Transport::Udp { checksum: true })
    }

    pub fn new(src: Endpoint, dst: Endpoint, transport: Transport) -> Self {
        Self {
            src,
            dst,
            transport,
            payload: Vec::new(),
            ip_options: Vec::new(),
            outer: None,
        }
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    /// IPv4 options, zero-padded to a 4-byte boundary (at most 40 bytes)
    pub fn ip_options(mut self, options: &[u8]) -> Self {
        let mut options = options[..options.len().min(40)].to_vec();
        while options.len() % 4 != 0 {
            options.push(0);
        }
        self.ip_options = options;
        self
    }

    /// Send UDP with a zero ("absent") checksum
    pub fn without_udp_checksum(mut self) -> Self {
        if let Transport::Udp { .. } = self.transport {
            self.transport = Transport::Udp { checksum: false };
        }
        self
    }

    /// Wrap the IPv4 packet in an outer IP-in-IP header
    pub fn ipip(mut self, outer_src: Ipv4Addr, outer_dst: Ipv4Addr) -> Self {
        self.outer = Some((outer_src, outer_dst));
        self
    }

    pub fn build(&self) -> PacketBuf {
        let segment = self.segment();
        let inner = ipv4_packet(
            self.src.ip,
            self.dst.ip,
            self.protocol(),
            &self.ip_options,
            &segment,
        );

        let packet = match self.outer {
            Some((outer_src, outer_dst)) => {
                ipv4_packet(outer_src, outer_dst, IPPROTO_IPIP, &[], &inner)
            }
            None => inner,
        };

        let mut frame = Vec::with_capacity(ETH_HLEN + packet.len());
        frame.extend_from_slice(&DST_MAC);
        frame.extend_from_slice(&SRC_MAC);
        frame.extend_from_slice(&ETH_P_IP.to_be_bytes());
        frame.extend_from_slice(&packet);
        PacketBuf::from(frame)
    }

    fn protocol(&self) -> u8 {
        match self.transport {
            Transport::Tcp { .. } => IPPROTO_TCP,
            Transport::Udp { .. } => IPPROTO_UDP,
        }
    }

    fn segment(&self) -> Vec<u8> {
        let mut seg = match self.transport {
            Transport::Tcp { flags } => {
                let mut hdr = vec![0u8; TCP_MIN_HLEN];
                hdr[0..2].copy_from_slice(&self.src.port.to_be_bytes());
                hdr[2..4].copy_from_slice(&self.dst.port.to_be_bytes());
                hdr[4..8].copy_from_slice(&1u32.to_be_bytes());
                hdr[12] = ((TCP_MIN_HLEN / 4) as u8) << 4;
                hdr[13] = flags.bits();
                hdr[14..16].copy_from_slice(&65535u16.to_be_bytes());
                hdr
            }
            Transport::Udp { .. } => {
                let mut hdr = vec![0u8; UDP_HLEN];
                hdr[0..2].copy_from_slice(&self.src.port.to_be_bytes());
                hdr[2..4].copy_from_slice(&self.dst.port.to_be_bytes());
                let len = (UDP_HLEN + self.payload.len()) as u16;
                hdr[4..6].copy_from_slice(&len.to_be_bytes());
                hdr
            }
        };
        seg.extend_from_slice(&self.payload);

        let csum = checksum::transport_checksum(self.src.ip, self.dst.ip, self.protocol(), &seg);
        match self.transport {
            Transport::Tcp { .. } => seg[16..18].copy_from_slice(&csum.to_be_bytes()),
            Transport::Udp { checksum: true } => seg[6..8].copy_from_slice(&csum.to_be_bytes()),
            Transport::Udp { checksum: false } => {}
        }
        seg
    }
}

fn ipv4_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    options: &[u8],
    payload: &[u8],
) -> Vec<u8> {
    let header_len = IPV4_MIN_HLEN + options.len();
    let total_len = (header_len + payload.len()) as u16;

    let mut pkt = vec![0u8; header_len];
    pkt[0] = 0x40 | (header_len / 4) as u8;
    pkt[2..4].copy_from_slice(&total_len.to_be_bytes());
    pkt[6] = 0x40; // DF
    pkt[8] = DEFAULT_TTL;
    pkt[9] = protocol;
    pkt[12..16].copy_from_slice(&src.octets());
    pkt[16..20].copy_from_slice(&dst.octets());
    pkt[IPV4_MIN_HLEN..].copy_from_slice(options);

    let csum = checksum::checksum(&pkt);
    pkt[10..12].copy_from_slice(&csum.to_be_bytes());

    pkt.extend_from_slice(payload);
    pkt
}

/// True when every IPv4 header and the innermost transport checksum verify
///
/// A UDP checksum of zero counts as valid (absent).
pub fn checksums_valid(buf: &PacketBuf) -> bool {
    if ethertype(buf) != Ok(ETH_P_IP) {
        return false;
    }

    let mut ip = match Ipv4View::parse(buf, ETH_HLEN) {
        Ok(ip) => ip,
        Err(_) => return false,
    };
    if !header_checksum_ok(buf, &ip) {
        return false;
    }

    if ip.protocol == IPPROTO_IPIP {
        ip = match Ipv4View::parse(buf, ip.payload_offset()) {
            Ok(inner) => inner,
            Err(_) => return false,
        };
        if !header_checksum_ok(buf, &ip) {
            return false;
        }
    }

    let segment_len = usize::from(ip.total_len).saturating_sub(ip.header_len);
    let segment = match buf.slice(ip.payload_offset(), segment_len) {
        Some(segment) => segment,
        None => return false,
    };

    match ip.protocol {
        IPPROTO_TCP => checksum::verify_transport(ip.saddr, ip.daddr, IPPROTO_TCP, segment),
        IPPROTO_UDP => match UdpView::parse(buf, ip.payload_offset()) {
            Ok(udp) if udp.check == 0 => true,
            Ok(_) => checksum::verify_transport(ip.saddr, ip.daddr, IPPROTO_UDP, segment),
            Err(_) => false,
        },
        _ => true,
    }
}

fn header_checksum_ok(buf: &PacketBuf, ip: &Ipv4View) -> bool {
    buf.slice(ip.offset, ip.header_len)
        .map_or(false, checksum::verify)
}

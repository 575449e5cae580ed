// packages/engine/src/packet/headers.rs
//! Bounded header views
//!
//! Each view records the offset it was parsed at and the fields the
//! translator needs. Views are plain copies; rewriting goes through
//! [`PacketBuf`] at the offsets they expose.

use crate::packet::buffer::PacketBuf;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use thiserror::Error;

pub const ETH_HLEN: usize = 14;
pub const ETH_P_IP: u16 = 0x0800;
pub const IPV4_MIN_HLEN: usize = 20;
pub const TCP_MIN_HLEN: usize = 20;
pub const UDP_HLEN: usize = 8;
pub const IPPROTO_IPIP: u8 = 4;

const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;
const TCP_ACK: u8 = 0x10;

/// Why a header could not be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("header truncated")]
    Truncated,

    #[error("invalid IPv4 header length field {0}")]
    BadIhl(u8),
}

/// EtherType of the frame, if the Ethernet header is complete
pub fn ethertype(buf: &PacketBuf) -> Result<u16, HeaderError> {
    if !buf.has(0, ETH_HLEN) {
        return Err(HeaderError::Truncated);
    }
    buf.read_u16(12).ok_or(HeaderError::Truncated)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4View {
    pub offset: usize,
    /// Header length in bytes (IHL * 4)
    pub header_len: usize,
    pub total_len: u16,
    pub protocol: u8,
    pub saddr: Ipv4Addr,
    pub daddr: Ipv4Addr,
}

impl Ipv4View {
    pub fn parse(buf: &PacketBuf, offset: usize) -> Result<Self, HeaderError> {
        let fixed = buf
            .slice(offset, IPV4_MIN_HLEN)
            .ok_or(HeaderError::Truncated)?;

        let ihl = fixed[0] & 0x0f;
        if ihl < 5 {
            return Err(HeaderError::BadIhl(ihl));
        }
        let header_len = usize::from(ihl) * 4;
        if !buf.has(offset, header_len) {
            return Err(HeaderError::Truncated);
        }

        Ok(Self {
            offset,
            header_len,
            total_len: u16::from_be_bytes([fixed[2], fixed[3]]),
            protocol: fixed[9],
            saddr: Ipv4Addr::new(fixed[12], fixed[13], fixed[14], fixed[15]),
            daddr: Ipv4Addr::new(fixed[16], fixed[17], fixed[18], fixed[19]),
        })
    }

    pub fn check_offset(&self) -> usize {
        self.offset + 10
    }

    pub fn saddr_offset(&self) -> usize {
        self.offset + 12
    }

    pub fn daddr_offset(&self) -> usize {
        self.offset + 16
    }

    /// Start of the payload (next header)
    pub fn payload_offset(&self) -> usize {
        self.offset + self.header_len
    }
}

/// TCP control bits the datapath cares about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpFlags {
    pub const SYN: Self = Self {
        syn: true,
        ack: false,
        fin: false,
        rst: false,
    };

    pub const ACK: Self = Self {
        syn: false,
        ack: true,
        fin: false,
        rst: false,
    };

    pub const SYN_ACK: Self = Self {
        syn: true,
        ack: true,
        fin: false,
        rst: false,
    };

    pub const FIN_ACK: Self = Self {
        syn: false,
        ack: true,
        fin: true,
        rst: false,
    };

    pub fn from_bits(bits: u8) -> Self {
        Self {
            syn: bits & TCP_SYN != 0,
            ack: bits & TCP_ACK != 0,
            fin: bits & TCP_FIN != 0,
            rst: bits & TCP_RST != 0,
        }
    }

    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.syn {
            bits |= TCP_SYN;
        }
        if self.ack {
            bits |= TCP_ACK;
        }
        if self.fin {
            bits |= TCP_FIN;
        }
        if self.rst {
            bits |= TCP_RST;
        }
        bits
    }

    /// First packet of an active open
    pub fn is_initial_syn(&self) -> bool {
        self.syn && !self.ack
    }

    /// Orderly close from the sender
    pub fn is_fin_ack(&self) -> bool {
        self.fin && self.ack
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpView {
    pub offset: usize,
    pub sport: u16,
    pub dport: u16,
    pub flags: TcpFlags,
}

impl TcpView {
    pub fn parse(buf: &PacketBuf, offset: usize) -> Result<Self, HeaderError> {
        let hdr = buf
            .slice(offset, TCP_MIN_HLEN)
            .ok_or(HeaderError::Truncated)?;

        Ok(Self {
            offset,
            sport: u16::from_be_bytes([hdr[0], hdr[1]]),
            dport: u16::from_be_bytes([hdr[2], hdr[3]]),
            flags: TcpFlags::from_bits(hdr[13]),
        })
    }

    pub fn sport_offset(&self) -> usize {
        self.offset
    }

    pub fn dport_offset(&self) -> usize {
        self.offset + 2
    }

    pub fn check_offset(&self) -> usize {
        self.offset + 16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpView {
    pub offset: usize,
    pub sport: u16,
    pub dport: u16,
    pub length: u16,
    pub check: u16,
}

impl UdpView {
    pub fn parse(buf: &PacketBuf, offset: usize) -> Result<Self, HeaderError> {
        let hdr = buf.slice(offset, UDP_HLEN).ok_or(HeaderError::Truncated)?;

        Ok(Self {
            offset,
            sport: u16::from_be_bytes([hdr[0], hdr[1]]),
            dport: u16::from_be_bytes([hdr[2], hdr[3]]),
            length: u16::from_be_bytes([hdr[4], hdr[5]]),
            check: u16::from_be_bytes([hdr[6], hdr[7]]),
        })
    }

    pub fn sport_offset(&self) -> usize {
        self.offset
    }

    pub fn dport_offset(&self) -> usize {
        self.offset + 2
    }

    pub fn check_offset(&self) -> usize {
        self.offset + 6
    }
}

// packages/engine/src/state/flow.rs
//! Flow identity types shared by every hook
//!
//! All addresses and ports are kept in host byte order; conversion to wire
//! order happens only where bytes are written into packets or option buffers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Per-socket identity assigned by the networking stack at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cookie(pub u64);

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cookie:{}", self.0)
    }
}

/// Kernel-level socket reference; opaque to the datapath logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SocketHandle(pub u64);

/// One side of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "SocketAddrV4", into = "SocketAddrV4")]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl From<Endpoint> for SocketAddrV4 {
    fn from(ep: Endpoint) -> Self {
        SocketAddrV4::new(ep.ip, ep.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Directional 4-tuple
///
/// The two sockets of one connection see mirrored keys. A socket is
/// registered under `{its local, its remote}`; a lookup on behalf of the peer
/// is built as `{peer remote, peer local}`, which lands on the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub src: Endpoint,
    pub dst: Endpoint,
}

impl FlowKey {
    pub const fn new(src: Endpoint, dst: Endpoint) -> Self {
        Self { src, dst }
    }

    /// Same flow seen from the opposite side
    pub const fn mirror(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }

    /// True when either side sits on `ip`
    pub fn touches(&self, ip: Ipv4Addr) -> bool {
        self.src.ip == ip || self.dst.ip == ip
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// The destination the application believed it was talking to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "SocketAddrV4", into = "SocketAddrV4")]
pub struct OriginRecord {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl OriginRecord {
    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub const fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.ip, self.port)
    }
}

impl From<Endpoint> for OriginRecord {
    fn from(ep: Endpoint) -> Self {
        Self::new(ep.ip, ep.port)
    }
}

impl From<SocketAddrV4> for OriginRecord {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl From<OriginRecord> for SocketAddrV4 {
    fn from(origin: OriginRecord) -> Self {
        SocketAddrV4::new(origin.ip, origin.port)
    }
}

impl fmt::Display for OriginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Where a flow stands in the capture → pair → redirect lifecycle
///
/// Never stored on its own; always derived from what the tables hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// Origin recorded against the connecting socket's cookie
    Captured,

    /// Origin promoted to the flow key; no splice target registered
    Paired,

    /// Origin promoted and a socket registered for message redirection
    Redirected,

    /// Nothing left: torn down, evicted, or never captured
    Closed,
}

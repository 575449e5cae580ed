// packages/engine/src/interception/context.rs
//! Hook contexts
//!
//! Each struct mirrors what the kernel hands a program at the corresponding
//! attachment point. Hooks read and rewrite these in place; whatever a hook
//! leaves in the context is what the triggering operation proceeds with.

use crate::state::flow::{Cookie, Endpoint, SocketHandle};
use serde::{Deserialize, Serialize};

pub const AF_INET: u16 = libc::AF_INET as u16;
pub const AF_INET6: u16 = libc::AF_INET6 as u16;

/// Transport protocol of a socket-address operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    Other(u8),
}

/// Socket-address hook context (connect, sendmsg, recvmsg)
///
/// `user_ip4`/`user_port` are the address the application passed in, or for
/// the receive path the apparent sender it will see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SockAddrCtx {
    pub protocol: Protocol,
    pub user_ip4: std::net::Ipv4Addr,
    pub user_port: u16,
    pub uid: u32,
    pub cookie: Cookie,
}

impl SockAddrCtx {
    pub fn tcp(dst: Endpoint, uid: u32, cookie: Cookie) -> Self {
        Self::new(Protocol::Tcp, dst, uid, cookie)
    }

    pub fn udp(dst: Endpoint, uid: u32, cookie: Cookie) -> Self {
        Self::new(Protocol::Udp, dst, uid, cookie)
    }

    pub fn new(protocol: Protocol, dst: Endpoint, uid: u32, cookie: Cookie) -> Self {
        Self {
            protocol,
            user_ip4: dst.ip,
            user_port: dst.port,
            uid,
            cookie,
        }
    }

    pub fn user_endpoint(&self) -> Endpoint {
        Endpoint::new(self.user_ip4, self.user_port)
    }

    pub fn set_user_endpoint(&mut self, endpoint: Endpoint) {
        self.user_ip4 = endpoint.ip;
        self.user_port = endpoint.port;
    }
}

/// Socket state transitions delivered to the sockops hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SockOp {
    /// Handshake completed on an accepted socket
    PassiveEstablished,

    /// Handshake completed on a connecting socket
    ActiveEstablished,

    /// Socket moved to TCP_CLOSE
    StateClose,

    /// Any other callback (RTO, retransmit, ...)
    Other,
}

impl SockOp {
    pub fn is_established(&self) -> bool {
        matches!(self, SockOp::PassiveEstablished | SockOp::ActiveEstablished)
    }
}

/// Socket-operations hook context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockOpsCtx {
    pub op: SockOp,
    pub family: u16,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub cookie: Cookie,
    pub socket: SocketHandle,
}

/// The socket a getsockopt call is made on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockView {
    pub family: u16,
    /// Local side of the socket
    pub src: Endpoint,
    /// Peer side of the socket
    pub dst: Endpoint,
}

/// getsockopt hook context
///
/// `optval` is the caller's buffer as captured; its length is the only bound
/// writes are checked against. `optlen` is the length reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SockOptCtx {
    pub level: i32,
    pub optname: i32,
    pub optlen: usize,
    pub optval: Vec<u8>,
    pub retval: i32,
    pub sk: SockView,
}

impl SockOptCtx {
    /// Context for a call with a zeroed buffer of `optlen` bytes
    pub fn new(level: i32, optname: i32, optlen: usize, sk: SockView) -> Self {
        Self {
            level,
            optname,
            optlen,
            optval: vec![0; optlen],
            // The kernel's own handler has already failed when the hook runs
            retval: -libc::ENOENT,
            sk,
        }
    }
}

/// Which queue a redirected message lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectDirection {
    /// Receive queue of the target socket
    Ingress,

    /// Transmit path of the target socket
    Egress,
}

/// Splice decision recorded on a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MsgRedirect {
    pub target: SocketHandle,
    pub direction: RedirectDirection,
}

/// Socket-message hook context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkMsg {
    pub family: u16,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub size: usize,

    /// Set by the redirect primitive; `None` means normal delivery
    pub redirect: Option<MsgRedirect>,
}

impl SkMsg {
    pub fn ipv4(local: Endpoint, remote: Endpoint, size: usize) -> Self {
        Self {
            family: AF_INET,
            local,
            remote,
            size,
            redirect: None,
        }
    }
}

/// Verdict of a socket-level hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Let the operation continue (possibly with a rewritten context)
    Continue,
}

/// Verdict of the message hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkAction {
    Pass,
}

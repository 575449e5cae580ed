// packages/engine/src/interception/policy.rs
//! Bypass rules shared by the socket-address hooks
//!
//! A bypassed operation proceeds exactly as the application issued it: no
//! table write, no rewrite.

use crate::interception::context::{Protocol, SockAddrCtx};
use crate::utils::config::{ConnectScope, DatapathConfig};
use serde::Serialize;
use std::fmt;

/// Why an operation was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassReason {
    /// Already addressed to the proxy port (loop avoidance)
    ProxyPort,

    /// Loopback destination
    Loopback,

    /// Issued by the proxy itself or by root
    PrivilegedIdentity,

    /// TCP destination outside the configured connect scope
    OutOfScope,

    /// UDP not addressed to the captured DNS port
    NotDns,

    /// Reply not coming from the DNS proxy port
    NotDnsProxy,

    /// Neither TCP nor UDP
    UnsupportedProtocol,
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BypassReason::ProxyPort => "proxy_port",
            BypassReason::Loopback => "loopback",
            BypassReason::PrivilegedIdentity => "privileged_identity",
            BypassReason::OutOfScope => "out_of_scope",
            BypassReason::NotDns => "not_dns",
            BypassReason::NotDnsProxy => "not_dns_proxy",
            BypassReason::UnsupportedProtocol => "unsupported_protocol",
        }
    }
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bypass decisions for connect, sendmsg and recvmsg
#[derive(Debug, Clone, Copy)]
pub struct BypassPolicy {
    config: DatapathConfig,
}

impl BypassPolicy {
    pub fn new(config: DatapathConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DatapathConfig {
        &self.config
    }

    /// Connect-time decision; `None` means the connect is redirected
    pub fn connect(&self, ctx: &SockAddrCtx) -> Option<BypassReason> {
        match ctx.protocol {
            Protocol::Tcp => {
                if ctx.user_port == self.config.proxy_port {
                    return Some(BypassReason::ProxyPort);
                }
            }
            Protocol::Udp => {
                if ctx.user_port != self.config.dns_capture_port {
                    return Some(BypassReason::NotDns);
                }
            }
            Protocol::Other(_) => return Some(BypassReason::UnsupportedProtocol),
        }

        if let Some(reason) = self.common(ctx) {
            return Some(reason);
        }

        if ctx.protocol == Protocol::Tcp
            && self.config.connect_scope == ConnectScope::BridgeOnly
            && ctx.user_ip4 != self.config.bridge_ip
        {
            return Some(BypassReason::OutOfScope);
        }

        None
    }

    /// DNS query send decision
    pub fn dns_send(&self, ctx: &SockAddrCtx) -> Option<BypassReason> {
        if ctx.user_port != self.config.dns_capture_port {
            return Some(BypassReason::NotDns);
        }
        self.common(ctx)
    }

    /// DNS reply receive decision
    pub fn dns_recv(&self, ctx: &SockAddrCtx) -> Option<BypassReason> {
        if ctx.user_port != self.config.dns_proxy_port {
            return Some(BypassReason::NotDnsProxy);
        }
        self.common(ctx)
    }

    fn common(&self, ctx: &SockAddrCtx) -> Option<BypassReason> {
        if self.config.is_bypass_identity(ctx.uid) {
            return Some(BypassReason::PrivilegedIdentity);
        }
        if ctx.user_ip4.is_loopback() {
            return Some(BypassReason::Loopback);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::flow::{Cookie, Endpoint};
    use std::net::Ipv4Addr;

    fn policy() -> BypassPolicy {
        BypassPolicy::new(DatapathConfig::default())
    }

    fn tcp(ip: [u8; 4], port: u16, uid: u32) -> SockAddrCtx {
        SockAddrCtx::tcp(Endpoint::new(Ipv4Addr::from(ip), port), uid, Cookie(1))
    }

    fn udp(ip: [u8; 4], port: u16, uid: u32) -> SockAddrCtx {
        SockAddrCtx::udp(Endpoint::new(Ipv4Addr::from(ip), port), uid, Cookie(1))
    }

    #[test]
    fn test_connect_bypass_cases() {
        let p = policy();
        assert_eq!(p.connect(&tcp([93, 184, 216, 34], 443, 1000)), None);
        assert_eq!(
            p.connect(&tcp([93, 184, 216, 34], 15001, 1000)),
            Some(BypassReason::ProxyPort)
        );
        assert_eq!(
            p.connect(&tcp([127, 0, 0, 1], 443, 1000)),
            Some(BypassReason::Loopback)
        );
        assert_eq!(
            p.connect(&tcp([93, 184, 216, 34], 443, 0)),
            Some(BypassReason::PrivilegedIdentity)
        );
        assert_eq!(
            p.connect(&tcp([93, 184, 216, 34], 443, 1500)),
            Some(BypassReason::PrivilegedIdentity)
        );
        assert_eq!(
            p.connect(&udp([8, 8, 8, 8], 123, 1000)),
            Some(BypassReason::NotDns)
        );
        assert_eq!(p.connect(&udp([8, 8, 8, 8], 53, 1000)), None);
    }

    #[test]
    fn test_connect_other_protocol() {
        let mut ctx = tcp([93, 184, 216, 34], 443, 1000);
        ctx.protocol = Protocol::Other(132);
        assert_eq!(
            policy().connect(&ctx),
            Some(BypassReason::UnsupportedProtocol)
        );
    }

    #[test]
    fn test_bridge_only_scope() {
        let config = DatapathConfig {
            connect_scope: ConnectScope::BridgeOnly,
            ..DatapathConfig::default()
        };
        let p = BypassPolicy::new(config);

        assert_eq!(
            p.connect(&tcp([93, 184, 216, 34], 443, 1000)),
            Some(BypassReason::OutOfScope)
        );
        assert_eq!(p.connect(&tcp([10, 0, 0, 1], 8080, 1000)), None);
        // Scope only narrows TCP
        assert_eq!(p.connect(&udp([8, 8, 8, 8], 53, 1000)), None);
    }

    #[test]
    fn test_dns_paths() {
        let p = policy();
        assert_eq!(p.dns_send(&udp([8, 8, 8, 8], 53, 1000)), None);
        assert_eq!(
            p.dns_send(&udp([127, 0, 0, 53], 53, 1000)),
            Some(BypassReason::Loopback)
        );
        assert_eq!(p.dns_recv(&udp([10, 0, 0, 1], 15053, 1000)), None);
        assert_eq!(
            p.dns_recv(&udp([10, 0, 0, 1], 53, 1000)),
            Some(BypassReason::NotDnsProxy)
        );
        assert_eq!(
            p.dns_recv(&udp([10, 0, 0, 1], 15053, 1500)),
            Some(BypassReason::PrivilegedIdentity)
        );
    }

    #[test]
    fn test_root_bypass_can_be_disabled() {
        let config = DatapathConfig {
            bypass_root: false,
            ..DatapathConfig::default()
        };
        let p = BypassPolicy::new(config);
        assert_eq!(p.connect(&tcp([93, 184, 216, 34], 443, 0)), None);
    }
}

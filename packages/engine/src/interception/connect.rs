// packages/engine/src/interception/connect.rs
//! Connect-time capture
//!
//! Records where an outbound connection was really headed, keyed by the
//! connecting socket's cookie, then points the connect at the local proxy.
//! TCP connects land in `session_dest`; UDP connects to the DNS capture port
//! land in `dns_session_dest` so that the reply path can restore the
//! resolver.
//!
//! ```text
//! connect(93.184.216.34:443)            cookie 42
//!     │
//!     ├─ session_dest[42] = 93.184.216.34:443
//!     └─ destination → bridge:proxy_port
//! ```

use crate::interception::context::{Protocol, SockAddrCtx, Verdict};
use crate::interception::policy::{BypassPolicy, BypassReason};
use crate::interception::{record_outcome, record_update_failure};
use crate::state::flow::{Endpoint, OriginRecord};
use crate::state::store::UpdateFlag;
use crate::state::tables::{CookieTable, DatapathTables};
use crate::utils::config::DatapathConfig;
use serde::Serialize;
use tracing::{debug, warn};

const HOOK: &str = "connect";

/// What the connect hook did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConnectDisposition {
    /// Origin recorded and destination rewritten
    Redirected {
        origin: OriginRecord,
        rewritten: Endpoint,
    },

    /// Left exactly as issued
    Bypassed { reason: BypassReason },

    /// The cookie table refused the write; destination left unchanged
    FailedOpen { table: &'static str },
}

impl ConnectDisposition {
    /// The connect always proceeds
    pub fn verdict(&self) -> Verdict {
        Verdict::Continue
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            ConnectDisposition::Redirected { .. } => "redirected",
            ConnectDisposition::Bypassed { .. } => "bypassed",
            ConnectDisposition::FailedOpen { .. } => "failed_open",
        }
    }
}

pub struct ConnectInterceptor {
    policy: BypassPolicy,
    session_dest: CookieTable,
    dns_session_dest: CookieTable,
}

impl ConnectInterceptor {
    pub fn new(config: DatapathConfig, tables: &DatapathTables) -> Self {
        Self {
            policy: BypassPolicy::new(config),
            session_dest: tables.session_dest.clone(),
            dns_session_dest: tables.dns_session_dest.clone(),
        }
    }

    /// Handle a connect on an IPv4 socket
    pub fn on_connect(&self, ctx: &mut SockAddrCtx) -> ConnectDisposition {
        let disposition = self.capture(ctx);
        record_outcome(HOOK, disposition.outcome());
        disposition
    }

    fn capture(&self, ctx: &mut SockAddrCtx) -> ConnectDisposition {
        if let Some(reason) = self.policy.connect(ctx) {
            debug!(
                cookie = %ctx.cookie,
                dst = %ctx.user_endpoint(),
                uid = ctx.uid,
                %reason,
                "Connect bypassed"
            );
            return ConnectDisposition::Bypassed { reason };
        }

        let config = self.policy.config();
        let (table, proxy) = match ctx.protocol {
            Protocol::Udp => (
                &self.dns_session_dest,
                Endpoint::new(config.bridge_ip, config.dns_proxy_port),
            ),
            _ => (
                &self.session_dest,
                Endpoint::new(config.bridge_ip, config.proxy_port),
            ),
        };

        let origin = OriginRecord::from(ctx.user_endpoint());
        if let Err(e) = table.update(ctx.cookie, origin, UpdateFlag::Any) {
            warn!(
                cookie = %ctx.cookie,
                table = table.name(),
                error = %e,
                "Failed to record connect origin, leaving destination unchanged"
            );
            record_update_failure(table.name());
            return ConnectDisposition::FailedOpen {
                table: table.name(),
            };
        }

        ctx.set_user_endpoint(proxy);

        debug!(
            cookie = %ctx.cookie,
            origin = %origin,
            proxy = %proxy,
            uid = ctx.uid,
            "Connect redirected to proxy"
        );

        ConnectDisposition::Redirected {
            origin,
            rewritten: proxy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interception::testing::{rejecting_table, test_tables};
    use crate::state::flow::Cookie;
    use crate::utils::config::ConnectScope;
    use std::net::Ipv4Addr;

    fn origin() -> Endpoint {
        Endpoint::new(Ipv4Addr::new(93, 184, 216, 34), 443)
    }

    #[test]
    fn test_tcp_connect_is_captured() {
        let tables = test_tables();
        let hook = ConnectInterceptor::new(DatapathConfig::default(), &tables);

        let mut ctx = SockAddrCtx::tcp(origin(), 1000, Cookie(42));
        let disposition = hook.on_connect(&mut ctx);

        let proxy = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 15001);
        assert_eq!(
            disposition,
            ConnectDisposition::Redirected {
                origin: OriginRecord::from(origin()),
                rewritten: proxy,
            }
        );
        assert_eq!(disposition.verdict(), Verdict::Continue);
        assert_eq!(ctx.user_endpoint(), proxy);
        assert_eq!(
            tables.session_dest.lookup(&Cookie(42)),
            Some(OriginRecord::new(Ipv4Addr::new(93, 184, 216, 34), 443))
        );
        assert!(tables.dns_session_dest.is_empty());
    }

    #[test]
    fn test_bypass_leaves_no_trace() {
        let tables = test_tables();
        let hook = ConnectInterceptor::new(DatapathConfig::default(), &tables);

        let cases = [
            SockAddrCtx::tcp(Endpoint::new(origin().ip, 15001), 1000, Cookie(1)),
            SockAddrCtx::tcp(Endpoint::new(Ipv4Addr::LOCALHOST, 443), 1000, Cookie(2)),
            SockAddrCtx::tcp(origin(), 0, Cookie(3)),
            SockAddrCtx::tcp(origin(), 1500, Cookie(4)),
            SockAddrCtx::udp(Endpoint::new(Ipv4Addr::new(8, 8, 8, 8), 123), 1000, Cookie(5)),
            SockAddrCtx::new(Protocol::Other(132), origin(), 1000, Cookie(6)),
        ];

        for original in cases {
            let mut ctx = original;
            let disposition = hook.on_connect(&mut ctx);
            assert!(matches!(disposition, ConnectDisposition::Bypassed { .. }));
            assert_eq!(ctx, original);
        }

        assert!(tables.session_dest.is_empty());
        assert!(tables.dns_session_dest.is_empty());
    }

    #[test]
    fn test_udp_dns_connect_uses_dns_table() {
        let tables = test_tables();
        let hook = ConnectInterceptor::new(DatapathConfig::default(), &tables);

        let resolver = Endpoint::new(Ipv4Addr::new(8, 8, 8, 8), 53);
        let mut ctx = SockAddrCtx::udp(resolver, 1000, Cookie(7));
        hook.on_connect(&mut ctx);

        assert_eq!(
            ctx.user_endpoint(),
            Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 15053)
        );
        assert_eq!(
            tables.dns_session_dest.lookup(&Cookie(7)),
            Some(OriginRecord::from(resolver))
        );
        assert!(tables.session_dest.is_empty());
    }

    #[test]
    fn test_reconnect_overwrites_origin() {
        let tables = test_tables();
        let hook = ConnectInterceptor::new(DatapathConfig::default(), &tables);

        let mut first = SockAddrCtx::tcp(origin(), 1000, Cookie(42));
        hook.on_connect(&mut first);
        let second_dst = Endpoint::new(Ipv4Addr::new(1, 1, 1, 1), 80);
        let mut second = SockAddrCtx::tcp(second_dst, 1000, Cookie(42));
        hook.on_connect(&mut second);

        assert_eq!(
            tables.session_dest.lookup(&Cookie(42)),
            Some(OriginRecord::from(second_dst))
        );
        assert_eq!(tables.session_dest.len(), 1);
    }

    #[test]
    fn test_failed_write_fails_open() {
        let mut tables = test_tables();
        tables.session_dest = rejecting_table("session_dest");
        let hook = ConnectInterceptor::new(DatapathConfig::default(), &tables);

        let mut ctx = SockAddrCtx::tcp(origin(), 1000, Cookie(42));
        let disposition = hook.on_connect(&mut ctx);

        assert_eq!(
            disposition,
            ConnectDisposition::FailedOpen {
                table: "session_dest"
            }
        );
        assert_eq!(ctx.user_endpoint(), origin());
    }

    #[test]
    fn test_bridge_only_scope() {
        let tables = test_tables();
        let config = DatapathConfig {
            connect_scope: ConnectScope::BridgeOnly,
            ..DatapathConfig::default()
        };
        let hook = ConnectInterceptor::new(config, &tables);

        let mut outside = SockAddrCtx::tcp(origin(), 1000, Cookie(1));
        assert_eq!(
            hook.on_connect(&mut outside),
            ConnectDisposition::Bypassed {
                reason: BypassReason::OutOfScope
            }
        );

        let service = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 8080);
        let mut inside = SockAddrCtx::tcp(service, 1000, Cookie(2));
        hook.on_connect(&mut inside);
        assert_eq!(inside.user_port, 15001);
        assert_eq!(
            tables.session_dest.lookup(&Cookie(2)),
            Some(OriginRecord::from(service))
        );
    }
}

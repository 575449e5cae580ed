// packages/engine/src/interception/dns_capture.rs
//! DNS query capture and reply restoration
//!
//! ```text
//! sendto(8.8.8.8:53)       cookie 7
//!     ├─ dns_session_dest[7] = 8.8.8.8:53
//!     └─ destination → bridge:dns_proxy_port
//!
//! recvfrom() ← bridge:dns_proxy_port
//!     └─ apparent sender → dns_session_dest[7]
//! ```
//!
//! The application never observes the redirect: replies appear to come from
//! the resolver it addressed.

use crate::interception::context::{SockAddrCtx, Verdict};
use crate::interception::policy::{BypassPolicy, BypassReason};
use crate::interception::{record_outcome, record_update_failure};
use crate::state::flow::{Endpoint, OriginRecord};
use crate::state::store::UpdateFlag;
use crate::state::tables::{CookieTable, DatapathTables};
use crate::utils::config::DatapathConfig;
use serde::Serialize;
use tracing::{debug, warn};

/// What the DNS send/receive hooks did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DnsDisposition {
    /// Query recorded and sent to the DNS proxy
    Captured {
        resolver: OriginRecord,
        rewritten: Endpoint,
    },

    /// Reply sender rewritten to the original resolver
    Restored { resolver: OriginRecord },

    /// Reply from the DNS proxy with no recorded query for this socket
    Unmatched,

    Bypassed { reason: BypassReason },

    /// The query could not be recorded; sent to the original resolver
    FailedOpen { table: &'static str },
}

impl DnsDisposition {
    pub fn verdict(&self) -> Verdict {
        Verdict::Continue
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            DnsDisposition::Captured { .. } => "captured",
            DnsDisposition::Restored { .. } => "restored",
            DnsDisposition::Unmatched => "unmatched",
            DnsDisposition::Bypassed { .. } => "bypassed",
            DnsDisposition::FailedOpen { .. } => "failed_open",
        }
    }
}

pub struct DnsQueryCapture {
    policy: BypassPolicy,
    dns_session_dest: CookieTable,
}

impl DnsQueryCapture {
    pub fn new(config: DatapathConfig, tables: &DatapathTables) -> Self {
        Self {
            policy: BypassPolicy::new(config),
            dns_session_dest: tables.dns_session_dest.clone(),
        }
    }

    /// Outbound datagram (sendmsg path)
    pub fn on_sendmsg(&self, ctx: &mut SockAddrCtx) -> DnsDisposition {
        let disposition = self.capture(ctx);
        record_outcome("dns_send", disposition.outcome());
        disposition
    }

    /// Inbound datagram (recvmsg path)
    pub fn on_recvmsg(&self, ctx: &mut SockAddrCtx) -> DnsDisposition {
        let disposition = self.restore(ctx);
        record_outcome("dns_recv", disposition.outcome());
        disposition
    }

    fn capture(&self, ctx: &mut SockAddrCtx) -> DnsDisposition {
        if let Some(reason) = self.policy.dns_send(ctx) {
            return DnsDisposition::Bypassed { reason };
        }

        let resolver = OriginRecord::from(ctx.user_endpoint());
        if let Err(e) = self
            .dns_session_dest
            .update(ctx.cookie, resolver, UpdateFlag::Any)
        {
            warn!(
                cookie = %ctx.cookie,
                resolver = %resolver,
                error = %e,
                "Failed to record DNS query origin, sending to original resolver"
            );
            record_update_failure(self.dns_session_dest.name());
            return DnsDisposition::FailedOpen {
                table: self.dns_session_dest.name(),
            };
        }

        let config = self.policy.config();
        let proxy = Endpoint::new(config.bridge_ip, config.dns_proxy_port);
        ctx.set_user_endpoint(proxy);

        debug!(cookie = %ctx.cookie, %resolver, uid = ctx.uid, "DNS query redirected to proxy");

        DnsDisposition::Captured {
            resolver,
            rewritten: proxy,
        }
    }

    fn restore(&self, ctx: &mut SockAddrCtx) -> DnsDisposition {
        if let Some(reason) = self.policy.dns_recv(ctx) {
            return DnsDisposition::Bypassed { reason };
        }

        match self.dns_session_dest.lookup(&ctx.cookie) {
            Some(resolver) => {
                ctx.set_user_endpoint(resolver.endpoint());
                debug!(cookie = %ctx.cookie, %resolver, "DNS reply sender restored");
                DnsDisposition::Restored { resolver }
            }
            None => DnsDisposition::Unmatched,
        }
    }
}

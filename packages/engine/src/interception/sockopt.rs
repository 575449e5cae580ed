// packages/engine/src/interception/sockopt.rs
//! SO_ORIGINAL_DST answering
//!
//! The proxy asks its accepted socket for the original destination. The
//! accepted socket's `{peer, local}` is exactly the key the client socket
//! registered at establishment, so the lookup is built mirrored. Flows that
//! were translated at packet level rather than at connect time are found in
//! the TCP NAT table instead.

use crate::interception::context::{SockOptCtx, AF_INET};
use crate::interception::record_outcome;
use crate::state::flow::{Endpoint, FlowKey, OriginRecord};
use crate::state::tables::{DatapathTables, FlowTable};
use crate::utils::config::DatapathConfig;
use serde::Serialize;
use tracing::{debug, warn};

const HOOK: &str = "getsockopt";

/// Largest option buffer the hook will consider
pub const MAX_OPT_LEN: usize = 4096;

/// `SO_ORIGINAL_DST` from `linux/netfilter_ipv4.h`
pub const SO_ORIGINAL_DST: i32 = 80;

/// `sizeof(struct sockaddr_in)`
pub const SOCKADDR_IN_LEN: usize = 16;

/// Which table answered the query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginSource {
    /// Socket-level pairing at connection establishment
    PairDest,

    /// Packet-level TCP translation
    SvcNat,
}

/// What the getsockopt hook did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SockOptDisposition {
    /// Original destination written into the caller's buffer
    Answered {
        origin: OriginRecord,
        source: OriginSource,
    },

    /// Not an SO_ORIGINAL_DST query on an IPv4 socket
    NotApplicable,

    /// No record for this flow
    Miss,

    /// A record exists but the caller's buffer cannot hold a sockaddr_in
    BufferTooSmall { available: usize },
}

impl SockOptDisposition {
    pub fn outcome(&self) -> &'static str {
        match self {
            SockOptDisposition::Answered { .. } => "answered",
            SockOptDisposition::NotApplicable => "not_applicable",
            SockOptDisposition::Miss => "miss",
            SockOptDisposition::BufferTooSmall { .. } => "buffer_too_small",
        }
    }
}

pub struct OriginalDestinationResolver {
    proxy_port: u16,
    pair_dest: FlowTable,
    svc_nat: FlowTable,
}

impl OriginalDestinationResolver {
    pub fn new(config: DatapathConfig, tables: &DatapathTables) -> Self {
        Self {
            proxy_port: config.proxy_port,
            pair_dest: tables.pair_dest.clone(),
            svc_nat: tables.svc_nat.clone(),
        }
    }

    pub fn on_getsockopt(&self, ctx: &mut SockOptCtx) -> SockOptDisposition {
        let disposition = self.resolve(ctx);
        record_outcome(HOOK, disposition.outcome());
        disposition
    }

    fn resolve(&self, ctx: &mut SockOptCtx) -> SockOptDisposition {
        if ctx.optlen > MAX_OPT_LEN {
            ctx.optlen = MAX_OPT_LEN;
        }

        if ctx.optname != SO_ORIGINAL_DST || ctx.sk.family != AF_INET {
            return SockOptDisposition::NotApplicable;
        }

        let (origin, source) = match self.find(ctx) {
            Some(found) => found,
            None => {
                debug!(src = %ctx.sk.src, dst = %ctx.sk.dst, "No original destination recorded");
                return SockOptDisposition::Miss;
            }
        };

        if ctx.optval.len() < SOCKADDR_IN_LEN {
            warn!(
                optname = ctx.optname,
                available = ctx.optval.len(),
                "Invalid getsockopt optval: too small for sockaddr_in"
            );
            return SockOptDisposition::BufferTooSmall {
                available: ctx.optval.len(),
            };
        }

        ctx.optval[..SOCKADDR_IN_LEN].copy_from_slice(&sockaddr_in(origin));
        ctx.optlen = SOCKADDR_IN_LEN;
        ctx.retval = 0;

        debug!(
            src = %ctx.sk.src,
            dst = %ctx.sk.dst,
            origin = %origin,
            source = ?source,
            "Answered SO_ORIGINAL_DST"
        );

        SockOptDisposition::Answered { origin, source }
    }

    fn find(&self, ctx: &SockOptCtx) -> Option<(OriginRecord, OriginSource)> {
        let pair_key = FlowKey::new(ctx.sk.dst, ctx.sk.src);
        if let Some(origin) = self.pair_dest.lookup(&pair_key) {
            return Some((origin, OriginSource::PairDest));
        }

        let nat_key = FlowKey::new(Endpoint::new(ctx.sk.src.ip, self.proxy_port), ctx.sk.dst);
        self.svc_nat
            .lookup(&nat_key)
            .map(|origin| (origin, OriginSource::SvcNat))
    }
}

/// `struct sockaddr_in` as laid out in memory: native-endian family, then
/// port and address in network order, then eight bytes of padding
fn sockaddr_in(origin: OriginRecord) -> [u8; SOCKADDR_IN_LEN] {
    let mut sa = [0u8; SOCKADDR_IN_LEN];
    sa[0..2].copy_from_slice(&AF_INET.to_ne_bytes());
    sa[2..4].copy_from_slice(&origin.port.to_be_bytes());
    sa[4..8].copy_from_slice(&origin.ip.octets());
    sa
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interception::context::{SockView, AF_INET6};
    use crate::interception::testing::test_tables;
    use crate::state::store::UpdateFlag;
    use std::net::Ipv4Addr;

    fn client() -> Endpoint {
        Endpoint::new(Ipv4Addr::new(10, 0, 0, 5), 51000)
    }

    fn proxy() -> Endpoint {
        Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 15001)
    }

    fn origin() -> OriginRecord {
        OriginRecord::new(Ipv4Addr::new(93, 184, 216, 34), 443)
    }

    /// The proxy's accepted socket: local = proxy, peer = client
    fn accepted(optlen: usize) -> SockOptCtx {
        SockOptCtx::new(
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            optlen,
            SockView {
                family: AF_INET,
                src: proxy(),
                dst: client(),
            },
        )
    }

    #[test]
    fn test_answers_from_pair_table() {
        let tables = test_tables();
        tables
            .pair_dest
            .update(FlowKey::new(client(), proxy()), origin(), UpdateFlag::Any)
            .unwrap();
        let hook = OriginalDestinationResolver::new(DatapathConfig::default(), &tables);

        let mut ctx = accepted(128);
        let disposition = hook.on_getsockopt(&mut ctx);

        assert_eq!(
            disposition,
            SockOptDisposition::Answered {
                origin: origin(),
                source: OriginSource::PairDest,
            }
        );
        assert_eq!(ctx.optlen, 16);
        assert_eq!(ctx.retval, 0);

        let family = u16::from_ne_bytes([ctx.optval[0], ctx.optval[1]]);
        assert_eq!(family, libc::AF_INET as u16);
        assert_eq!(&ctx.optval[2..4], &443u16.to_be_bytes());
        assert_eq!(&ctx.optval[4..8], &[93, 184, 216, 34]);
        assert!(ctx.optval[8..16].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_falls_back_to_packet_nat_table() {
        let tables = test_tables();
        tables
            .svc_nat
            .update(FlowKey::new(proxy(), client()), origin(), UpdateFlag::NoExist)
            .unwrap();
        let hook = OriginalDestinationResolver::new(DatapathConfig::default(), &tables);

        let mut ctx = accepted(16);
        assert_eq!(
            hook.on_getsockopt(&mut ctx),
            SockOptDisposition::Answered {
                origin: origin(),
                source: OriginSource::SvcNat,
            }
        );
    }

    #[test]
    fn test_miss_leaves_context_untouched() {
        let tables = test_tables();
        let hook = OriginalDestinationResolver::new(DatapathConfig::default(), &tables);

        let mut ctx = accepted(16);
        let before = ctx.clone();
        assert_eq!(hook.on_getsockopt(&mut ctx), SockOptDisposition::Miss);
        assert_eq!(ctx, before);
    }

    #[test]
    fn test_small_buffer_is_not_written() {
        let tables = test_tables();
        tables
            .pair_dest
            .update(FlowKey::new(client(), proxy()), origin(), UpdateFlag::Any)
            .unwrap();
        let hook = OriginalDestinationResolver::new(DatapathConfig::default(), &tables);

        let mut ctx = accepted(8);
        let before = ctx.clone();
        assert_eq!(
            hook.on_getsockopt(&mut ctx),
            SockOptDisposition::BufferTooSmall { available: 8 }
        );
        assert_eq!(ctx, before);
    }

    #[test]
    fn test_optlen_clamped_for_any_query() {
        let tables = test_tables();
        let hook = OriginalDestinationResolver::new(DatapathConfig::default(), &tables);

        let mut ctx = accepted(8192);
        ctx.optname = libc::SO_RCVBUF;
        assert_eq!(
            hook.on_getsockopt(&mut ctx),
            SockOptDisposition::NotApplicable
        );
        assert_eq!(ctx.optlen, MAX_OPT_LEN);
        assert_eq!(ctx.optval.len(), 8192);
    }

    #[test]
    fn test_ipv6_socket_not_applicable() {
        let tables = test_tables();
        tables
            .pair_dest
            .update(FlowKey::new(client(), proxy()), origin(), UpdateFlag::Any)
            .unwrap();
        let hook = OriginalDestinationResolver::new(DatapathConfig::default(), &tables);

        let mut ctx = accepted(16);
        ctx.sk.family = AF_INET6;
        assert_eq!(
            hook.on_getsockopt(&mut ctx),
            SockOptDisposition::NotApplicable
        );
        assert_ne!(ctx.retval, 0);
    }
}

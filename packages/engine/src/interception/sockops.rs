// packages/engine/src/interception/sockops.rs
//! Handshake-completion pairing
//!
//! When a proxy-bound TCP connection reaches ESTABLISHED, the origin captured
//! under the socket cookie is promoted to the connection's flow key, and the
//! socket is registered for message splicing under the same key. On close the
//! registration is dropped, provided the key still holds the closing socket.

use crate::interception::context::{SockOp, SockOpsCtx, AF_INET};
use crate::interception::{record_outcome, record_update_failure};
use crate::state::flow::{FlowKey, OriginRecord};
use crate::state::store::{StoreError, UpdateFlag};
use crate::state::tables::{CookieTable, DatapathTables, FlowTable, SockHash};
use crate::utils::config::DatapathConfig;
use serde::Serialize;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

const HOOK: &str = "sockops";

/// What the sockops callback did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PairDisposition {
    /// Flow touches the bridge and was processed
    Paired {
        key: FlowKey,
        /// Origin promoted from the cookie table, if one was captured
        origin: Option<OriginRecord>,
        /// False when another socket already held the key
        socket_registered: bool,
    },

    /// Socket closed; its splice registration is dropped
    Released {
        key: FlowKey,
        /// False when the key held another socket or nothing
        unregistered: bool,
    },

    /// Not an established or close callback, not IPv4, or not bridge-bound
    Ignored,
}

impl PairDisposition {
    pub fn outcome(&self) -> &'static str {
        match self {
            PairDisposition::Paired { .. } => "paired",
            PairDisposition::Released { .. } => "released",
            PairDisposition::Ignored => "ignored",
        }
    }
}

pub struct EstablishedPairer {
    bridge_ip: Ipv4Addr,
    session_dest: CookieTable,
    pair_dest: FlowTable,
    sock_pair: SockHash,
}

impl EstablishedPairer {
    pub fn new(config: DatapathConfig, tables: &DatapathTables) -> Self {
        Self {
            bridge_ip: config.bridge_ip,
            session_dest: tables.session_dest.clone(),
            pair_dest: tables.pair_dest.clone(),
            sock_pair: tables.sock_pair.clone(),
        }
    }

    pub fn on_sock_ops(&self, ctx: &SockOpsCtx) -> PairDisposition {
        let disposition = self.pair(ctx);
        record_outcome(HOOK, disposition.outcome());
        disposition
    }

    fn pair(&self, ctx: &SockOpsCtx) -> PairDisposition {
        if ctx.family != AF_INET {
            return PairDisposition::Ignored;
        }

        let key = FlowKey::new(ctx.local, ctx.remote);
        if !key.touches(self.bridge_ip) {
            return PairDisposition::Ignored;
        }

        match ctx.op {
            op if op.is_established() => self.establish(ctx, key),
            SockOp::StateClose => self.release(ctx, key),
            _ => PairDisposition::Ignored,
        }
    }

    fn release(&self, ctx: &SockOpsCtx, key: FlowKey) -> PairDisposition {
        let unregistered = self.sock_pair.unregister(&key, ctx.socket);
        debug!(%key, socket = ?ctx.socket, unregistered, "Closed socket released");

        PairDisposition::Released { key, unregistered }
    }

    fn establish(&self, ctx: &SockOpsCtx, key: FlowKey) -> PairDisposition {

        // The cookie record is left to age out
        let origin = self.session_dest.lookup(&ctx.cookie);
        if let Some(origin) = origin {
            if let Err(e) = self.pair_dest.update(key, origin, UpdateFlag::Any) {
                warn!(%key, error = %e, "Failed to promote origin to pair table");
                record_update_failure(self.pair_dest.name());
            }
        }

        let registration = self.sock_pair.register(key, ctx.socket, UpdateFlag::NoExist);
        let socket_registered = match registration {
            Ok(()) => true,
            Err(StoreError::KeyExists) => false,
            Err(e) => {
                warn!(%key, error = %e, "Failed to register socket for redirection");
                record_update_failure(self.sock_pair.table().name());
                false
            }
        };

        debug!(
            %key,
            cookie = %ctx.cookie,
            op = ?ctx.op,
            origin = ?origin,
            socket_registered,
            "Established flow paired"
        );

        PairDisposition::Paired {
            key,
            origin,
            socket_registered,
        }
    }
}

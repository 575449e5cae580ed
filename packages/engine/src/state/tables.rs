// packages/engine/src/state/tables.rs
//! The keyed tables shared by all hooks
//!
//! ```text
//! connect / sendmsg ──► session_dest, dns_session_dest   (cookie → origin)
//! established       ──► pair_dest                         (flow → origin)
//!                   ──► sock_pair                         (flow → socket)
//! tc egress         ──► svc_nat, dns_nat                  (flow → origin)
//! ```

use crate::interception::context::{MsgRedirect, RedirectDirection, SkMsg};
use crate::state::flow::{Cookie, FlowKey, OriginRecord, SocketHandle};
use crate::state::store::{KeyedStore, LruStore, StoreError, UpdateFlag};
use crate::utils::config::{TableConfig, TablesConfig};
use crate::utils::errors::{EngineError, Result};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info};

pub type CookieTable = Arc<dyn KeyedStore<Cookie, OriginRecord>>;
pub type FlowTable = Arc<dyn KeyedStore<FlowKey, OriginRecord>>;
pub type SocketTable = Arc<dyn KeyedStore<FlowKey, SocketHandle>>;

/// Flow → socket table plus the splice primitive that consumes it
#[derive(Clone)]
pub struct SockHash {
    sockets: SocketTable,
}

impl SockHash {
    pub fn new(sockets: SocketTable) -> Self {
        Self { sockets }
    }

    /// Register a socket for `key`
    pub fn register(
        &self,
        key: FlowKey,
        socket: SocketHandle,
        flag: UpdateFlag,
    ) -> std::result::Result<(), StoreError> {
        self.sockets.update(key, socket, flag)
    }

    /// Remove `socket` from `key`
    ///
    /// A later socket registered on a reused 4-tuple is left in place.
    /// Returns whether an entry was removed.
    pub fn unregister(&self, key: &FlowKey, socket: SocketHandle) -> bool {
        if self.sockets.peek(key) != Some(socket) {
            return false;
        }
        self.sockets.delete(key).is_ok()
    }

    /// Socket registered for `key`, if any
    pub fn lookup(&self, key: &FlowKey) -> Option<SocketHandle> {
        self.sockets.lookup(key)
    }

    /// Hand `msg` to the socket registered for `key`
    ///
    /// Returns false and leaves the message untouched when nothing is
    /// registered; the message then follows its normal delivery path.
    pub fn redirect_msg(
        &self,
        msg: &mut SkMsg,
        key: &FlowKey,
        direction: RedirectDirection,
    ) -> bool {
        match self.sockets.lookup(key) {
            Some(target) => {
                msg.redirect = Some(MsgRedirect { target, direction });
                true
            }
            None => false,
        }
    }

    pub fn table(&self) -> &SocketTable {
        &self.sockets
    }
}

/// Occupancy snapshot of every table
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TableSizes {
    pub session_dest: usize,
    pub dns_session_dest: usize,
    pub pair_dest: usize,
    pub sock_pair: usize,
    pub svc_nat: usize,
    pub dns_nat: usize,
}

/// Every table the datapath reads or writes
#[derive(Clone)]
pub struct DatapathTables {
    /// cookie → origin for TCP connects awaiting establishment
    pub session_dest: CookieTable,

    /// cookie → resolver for redirected DNS queries
    pub dns_session_dest: CookieTable,

    /// flow → origin for established proxy-bound socket flows
    pub pair_dest: FlowTable,

    /// flow → socket splice targets
    pub sock_pair: SockHash,

    /// flow → origin for TCP flows translated at packet level
    pub svc_nat: FlowTable,

    /// flow → origin for DNS flows translated at packet level
    pub dns_nat: FlowTable,
}

impl DatapathTables {
    /// Build LRU-backed tables sized from configuration
    pub fn new(config: &TablesConfig) -> Result<Self> {
        config.validate()?;

        let session_dest: CookieTable = Arc::new(lru_table::<Cookie, OriginRecord>(
            "session_dest",
            &config.session_dest,
        )?);
        let dns_session_dest: CookieTable = Arc::new(lru_table::<Cookie, OriginRecord>(
            "dns_session_dest",
            &config.dns_session_dest,
        )?);
        let pair_dest: FlowTable =
            Arc::new(lru_table::<FlowKey, OriginRecord>("pair_dest", &config.pair_dest)?);
        let sockets: SocketTable =
            Arc::new(lru_table::<FlowKey, SocketHandle>("sock_pair", &config.sock_pair)?);
        let svc_nat: FlowTable =
            Arc::new(lru_table::<FlowKey, OriginRecord>("svc_nat", &config.svc_nat)?);
        let dns_nat: FlowTable =
            Arc::new(lru_table::<FlowKey, OriginRecord>("dns_nat", &config.dns_nat)?);

        let tables = Self {
            session_dest,
            dns_session_dest,
            pair_dest,
            sock_pair: SockHash::new(sockets),
            svc_nat,
            dns_nat,
        };

        info!(
            "Datapath tables initialized (pair_dest capacity {})",
            tables.pair_dest.capacity()
        );

        Ok(tables)
    }

    /// Current number of live entries per table
    pub fn sizes(&self) -> TableSizes {
        TableSizes {
            session_dest: self.session_dest.len(),
            dns_session_dest: self.dns_session_dest.len(),
            pair_dest: self.pair_dest.len(),
            sock_pair: self.sock_pair.table().len(),
            svc_nat: self.svc_nat.len(),
            dns_nat: self.dns_nat.len(),
        }
    }
}

fn lru_table<K, V>(name: &'static str, config: &TableConfig) -> Result<LruStore<K, V>>
where
    K: std::hash::Hash + Eq + Clone + std::fmt::Debug,
{
    let capacity = NonZeroUsize::new(config.capacity).ok_or_else(|| {
        EngineError::ConfigError(format!("table {} must have a non-zero capacity", name))
    })?;

    debug!(
        "Creating table {} (capacity {}, {} shards)",
        name, config.capacity, config.shards
    );

    Ok(LruStore::with_shards(name, capacity, config.shards))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::flow::Endpoint;
    use std::net::Ipv4Addr;

    fn key() -> FlowKey {
        FlowKey::new(
            Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 15001),
            Endpoint::new(Ipv4Addr::new(10, 0, 0, 5), 51000),
        )
    }

    #[test]
    fn test_tables_from_default_config() {
        let tables = DatapathTables::new(&TablesConfig::default()).unwrap();
        assert_eq!(tables.sizes().pair_dest, 0);
        assert_eq!(tables.pair_dest.capacity(), 65535);
        assert_eq!(tables.svc_nat.name(), "svc_nat");
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = TablesConfig::default();
        config.sock_pair.capacity = 0;
        assert!(DatapathTables::new(&config).is_err());
    }

    #[test]
    fn test_oversized_shard_count_rejected() {
        let mut config = TablesConfig::default();
        config.pair_dest.shards = usize::MAX / 2 + 2;
        assert!(matches!(
            DatapathTables::new(&config),
            Err(EngineError::ConfigError(_))
        ));
    }

    #[test]
    fn test_redirect_msg_hit_and_miss() {
        let tables = DatapathTables::new(&TablesConfig::default()).unwrap();
        let sock_hash = &tables.sock_pair;

        let mut msg = SkMsg::ipv4(key().dst, key().src, 64);
        assert!(!sock_hash.redirect_msg(&mut msg, &key(), RedirectDirection::Ingress));
        assert!(msg.redirect.is_none());

        sock_hash
            .register(key(), SocketHandle(9), UpdateFlag::NoExist)
            .unwrap();
        assert!(sock_hash.redirect_msg(&mut msg, &key(), RedirectDirection::Ingress));
        assert_eq!(
            msg.redirect,
            Some(MsgRedirect {
                target: SocketHandle(9),
                direction: RedirectDirection::Ingress,
            })
        );
    }

    #[test]
    fn test_unregister_only_own_socket() {
        let tables = DatapathTables::new(&TablesConfig::default()).unwrap();
        let sock_hash = &tables.sock_pair;
        sock_hash
            .register(key(), SocketHandle(3), UpdateFlag::NoExist)
            .unwrap();

        assert!(!sock_hash.unregister(&key(), SocketHandle(1)));
        assert_eq!(sock_hash.lookup(&key()), Some(SocketHandle(3)));

        assert!(sock_hash.unregister(&key(), SocketHandle(3)));
        assert_eq!(sock_hash.lookup(&key()), None);
        assert!(!sock_hash.unregister(&key(), SocketHandle(3)));
    }
}

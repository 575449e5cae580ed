// packages/engine/src/interception/mod.rs
//! Interception hooks
//!
//! One module per attachment point. Every hook is a synchronous function over
//! its context and the shared tables; none blocks, retries, or returns an
//! error to the operation that triggered it.
//!
//! - **Connect**: records the original destination, points the socket at the proxy
//! - **Sockops**: promotes the record to the flow key once the handshake completes
//! - **Sockopt**: answers `SO_ORIGINAL_DST` for the proxy
//! - **Redirmsg**: splices messages between paired local sockets
//! - **DNS capture**: steers DNS queries to the local DNS proxy and restores replies
//! - **Packet NAT**: the same translation at packet level for traffic-control hooks
//!
//! # Architecture
//!
//! ```text
//! connect ──► session_dest ──► sockops ──► pair_dest ──► getsockopt
//!                                  │
//!                                  └─────► sock_pair ──► sk_msg
//!
//! sendmsg ──► dns_session_dest ──► recvmsg
//!
//! tc egress ──► svc_nat / dns_nat ──► tc ingress, getsockopt
//! ```

pub mod connect;
pub mod context;
pub mod dns_capture;
pub mod packet_nat;
pub mod policy;
pub mod redirmsg;
pub mod sockops;
pub mod sockopt;

pub use connect::{ConnectDisposition, ConnectInterceptor};
pub use context::{
    MsgRedirect, Protocol, RedirectDirection, SkAction, SkMsg, SockAddrCtx, SockOp, SockOpsCtx,
    SockOptCtx, SockView, Verdict,
};
pub use dns_capture::{DnsDisposition, DnsQueryCapture};
pub use packet_nat::{PacketDisposition, PacketLevelTranslator, TcAction, TrafficDirection};
pub use policy::{BypassPolicy, BypassReason};
pub use redirmsg::{MessageRedirector, MsgDisposition};
pub use sockops::{EstablishedPairer, PairDisposition};
pub use sockopt::{OriginalDestinationResolver, SockOptDisposition};

pub(crate) fn record_outcome(hook: &'static str, outcome: &'static str) {
    metrics::counter!("netredir_hook_total", "hook" => hook, "outcome" => outcome).increment(1);
}

pub(crate) fn record_update_failure(table: &'static str) {
    metrics::counter!("netredir_store_update_failures_total", "table" => table).increment(1);
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::state::store::{KeyedStore, StoreError, UpdateFlag};
    use crate::state::tables::DatapathTables;
    use crate::utils::config::{TableConfig, TablesConfig};
    use std::marker::PhantomData;
    use std::sync::Arc;

    /// Small tables so eviction is reachable in tests
    pub fn test_tables() -> DatapathTables {
        let small = TableConfig {
            capacity: 256,
            shards: 4,
        };
        let config = TablesConfig {
            session_dest: small,
            dns_session_dest: small,
            pair_dest: small,
            sock_pair: small,
            svc_nat: small,
            dns_nat: small,
        };
        DatapathTables::new(&config).expect("valid test table config")
    }

    /// Store that refuses every write and holds nothing
    pub struct RejectingStore<K, V> {
        name: &'static str,
        _marker: PhantomData<fn(K) -> V>,
    }

    impl<K, V> KeyedStore<K, V> for RejectingStore<K, V> {
        fn lookup(&self, _key: &K) -> Option<V> {
            None
        }

        fn peek(&self, _key: &K) -> Option<V> {
            None
        }

        fn update(&self, _key: K, _value: V, _flag: UpdateFlag) -> Result<(), StoreError> {
            Err(StoreError::Rejected("table full".to_string()))
        }

        fn delete(&self, _key: &K) -> Result<(), StoreError> {
            Err(StoreError::NotFound)
        }

        fn len(&self) -> usize {
            0
        }

        fn capacity(&self) -> usize {
            0
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }

    pub fn rejecting_table<K: 'static, V: 'static>(
        name: &'static str,
    ) -> Arc<dyn KeyedStore<K, V>> {
        Arc::new(RejectingStore {
            name,
            _marker: PhantomData,
        })
    }

    /// Forwards to `inner` but refuses every delete
    pub struct UndeletableStore<K, V> {
        inner: Arc<dyn KeyedStore<K, V>>,
    }

    impl<K, V> KeyedStore<K, V> for UndeletableStore<K, V> {
        fn lookup(&self, key: &K) -> Option<V> {
            self.inner.lookup(key)
        }

        fn peek(&self, key: &K) -> Option<V> {
            self.inner.peek(key)
        }

        fn update(&self, key: K, value: V, flag: UpdateFlag) -> Result<(), StoreError> {
            self.inner.update(key, value, flag)
        }

        fn delete(&self, _key: &K) -> Result<(), StoreError> {
            Err(StoreError::Rejected("delete refused".to_string()))
        }

        fn len(&self) -> usize {
            self.inner.len()
        }

        fn capacity(&self) -> usize {
            self.inner.capacity()
        }

        fn name(&self) -> &'static str {
            self.inner.name()
        }
    }

    pub fn undeletable_table<K: 'static, V: 'static>(
        inner: Arc<dyn KeyedStore<K, V>>,
    ) -> Arc<dyn KeyedStore<K, V>> {
        Arc::new(UndeletableStore { inner })
    }
}

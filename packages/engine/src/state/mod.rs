// packages/engine/src/state/mod.rs
//! Shared datapath state
//!
//! - **Flow**: Cookie, endpoint, flow key and origin record types
//! - **Store**: Bounded LRU keyed tables with per-key atomic operations
//! - **Tables**: The concrete tables the hooks cooperate through
//!
//! Hooks keep no state of their own. Everything one hook learns and another
//! needs later travels through these tables, keyed either by socket cookie or
//! by directional flow key.

pub mod flow;
pub mod store;
pub mod tables;

pub use flow::{Cookie, Endpoint, FlowKey, FlowState, OriginRecord, SocketHandle};
pub use store::{KeyedStore, LruStore, StoreError, UpdateFlag};
pub use tables::{DatapathTables, SockHash, TableSizes};

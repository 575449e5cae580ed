// packages/engine/src/lib.rs
//! Netredir Engine Library
//!
//! Session correlation and address translation for transparent redirection
//! of outbound TCP, UDP and DNS traffic to a local proxy.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **state**: Flow identity types and the bounded LRU tables hooks share
//! - **packet**: Bounded packet access, header views, incremental checksums
//! - **interception**: One hook per kernel attachment point
//! - **datapath**: Tables and hooks wired together from configuration
//! - **replay**: Scripted hook events for inspection and regression tests
//! - **observability**: Tracing and metrics setup
//! - **utils**: Configuration and errors

pub mod datapath;
pub mod interception;
pub mod observability;
pub mod packet;
pub mod replay;
pub mod state;
pub mod utils;

pub use datapath::Datapath;
pub use state::flow::{Cookie, Endpoint, FlowKey, FlowState, OriginRecord, SocketHandle};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

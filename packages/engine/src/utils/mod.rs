// packages/engine/src/utils/mod.rs
//! Common utilities shared across the engine
//!
//! - **config**: Layered engine configuration (file + environment)
//! - **errors**: Crate-wide error type and `Result` alias

pub mod config;
pub mod errors;

pub use config::{DatapathConfig, EngineConfig, ObservabilityConfig, TableConfig, TablesConfig};
pub use errors::{EngineError, Result};

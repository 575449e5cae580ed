// packages/engine/src/observability/mod.rs
//! Logging and metrics setup
//!
//! - **Tracing**: `tracing-subscriber` with an `EnvFilter` (`RUST_LOG` wins over
//!   the configured level), human-readable or JSON lines
//! - **Metrics**: `metrics` facade, exported over HTTP by the Prometheus
//!   exporter when a listen address is configured
//!
//! Counters emitted by the datapath:
//!
//! ```text
//! netredir_hook_total{hook, outcome}
//! netredir_store_evictions_total{table}
//! netredir_store_update_failures_total{table}
//! ```

use crate::utils::config::ObservabilityConfig;
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber
///
/// Logs go to stderr so that stdout stays clean for command output.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| {
            EngineError::ObservabilityFailed(format!(
                "invalid log filter '{}': {}",
                config.log_level, e
            ))
        })?;

    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let installed = if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| EngineError::ObservabilityFailed(e.to_string()))
}

/// Install the Prometheus exporter, if an address is configured
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(listen: Option<SocketAddr>) -> Result<()> {
    let addr = match listen {
        Some(addr) => addr,
        None => return Ok(()),
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::ObservabilityFailed(e.to_string()))?;

    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_without_address() {
        assert!(init_metrics(None).is_ok());
    }

    #[test]
    fn test_invalid_filter_rejected() {
        // Only meaningful when RUST_LOG does not override the configured level
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = ObservabilityConfig {
            log_level: "netredir=loudest".to_string(),
            ..ObservabilityConfig::default()
        };
        assert!(matches!(
            init_tracing(&config),
            Err(EngineError::ObservabilityFailed(_))
        ));
    }
}

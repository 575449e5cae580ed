// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Constants agreed with the control plane (bridge address, proxy ports,
//! bypass identities) and table sizing are injected here rather than baked
//! into hook logic. Sources are layered: built-in defaults, then an optional
//! file, then `NETREDIR__SECTION__KEY` environment variables.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use tracing::debug;

/// Default file looked up by [`EngineConfig::load`] (extension inferred)
pub const DEFAULT_CONFIG_FILE: &str = "config/engine";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "NETREDIR";

/// Which TCP destinations the connect hook is allowed to redirect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectScope {
    /// Every non-bypassed destination is sent to the proxy
    AllDestinations,

    /// Only connections already addressed to the bridge are redirected
    BridgeOnly,
}

/// Addresses, ports and identities shared with the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatapathConfig {
    /// Local address standing in for the transparent proxy
    pub bridge_ip: Ipv4Addr,

    /// Port the proxy accepts redirected TCP connections on
    pub proxy_port: u16,

    /// Port the local DNS proxy listens on
    pub dns_proxy_port: u16,

    /// Destination port whose UDP traffic is captured as DNS
    pub dns_capture_port: u16,

    /// Identity the proxy runs as; its own traffic is never redirected
    pub proxy_uid: u32,

    /// Never redirect traffic from uid 0
    pub bypass_root: bool,

    /// Redirect scope for TCP connects
    pub connect_scope: ConnectScope,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            bridge_ip: Ipv4Addr::new(10, 0, 0, 1),
            proxy_port: 15001,
            dns_proxy_port: 15053,
            dns_capture_port: 53,
            proxy_uid: 1500,
            bypass_root: true,
            connect_scope: ConnectScope::AllDestinations,
        }
    }
}

impl DatapathConfig {
    /// True when `uid` belongs to a privileged identity that must bypass redirection
    pub fn is_bypass_identity(&self, uid: u32) -> bool {
        uid == self.proxy_uid || (self.bypass_root && uid == 0)
    }
}

/// Sizing for a single keyed table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Maximum number of live entries
    pub capacity: usize,

    /// Number of independently locked shards (power of two)
    pub shards: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            capacity: 65535,
            shards: 16,
        }
    }
}

/// Sizing for every table the datapath uses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TablesConfig {
    /// cookie -> origin, TCP connects awaiting establishment
    pub session_dest: TableConfig,

    /// cookie -> origin, DNS queries awaiting their reply
    pub dns_session_dest: TableConfig,

    /// flow -> origin, established proxy-bound socket flows
    pub pair_dest: TableConfig,

    /// flow -> socket, splice targets for message redirection
    pub sock_pair: TableConfig,

    /// flow -> origin, TCP flows translated at packet level
    pub svc_nat: TableConfig,

    /// flow -> origin, DNS flows translated at packet level
    pub dns_nat: TableConfig,
}

impl TablesConfig {
    fn entries(&self) -> [(&'static str, &TableConfig); 6] {
        [
            ("session_dest", &self.session_dest),
            ("dns_session_dest", &self.dns_session_dest),
            ("pair_dest", &self.pair_dest),
            ("sock_pair", &self.sock_pair),
            ("svc_nat", &self.svc_nat),
            ("dns_nat", &self.dns_nat),
        ]
    }

    /// Reject table sizes the stores cannot be built with
    pub fn validate(&self) -> Result<()> {
        for (name, table) in self.entries() {
            if table.capacity == 0 {
                return Err(EngineError::ConfigError(format!(
                    "table {} must have a non-zero capacity",
                    name
                )));
            }
            if table.shards == 0 || !table.shards.is_power_of_two() {
                return Err(EngineError::ConfigError(format!(
                    "table {} shard count {} is not a power of two",
                    name, table.shards
                )));
            }
            if table.shards > table.capacity {
                return Err(EngineError::ConfigError(format!(
                    "table {} has more shards ({}) than capacity ({})",
                    name, table.shards, table.capacity
                )));
            }
        }

        Ok(())
    }
}

/// Logging and metrics settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter when `RUST_LOG` is unset
    pub log_level: String,

    /// Emit logs as JSON lines
    pub json_logs: bool,

    /// Prometheus exporter listen address (disabled when unset)
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_addr: None,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub datapath: DatapathConfig,
    pub tables: TablesConfig,
    pub observability: ObservabilityConfig,
}

impl EngineConfig {
    /// Load from `config/engine.*` (if present) and the environment
    pub fn load() -> Result<Self> {
        let builder = ::config::Config::builder()
            .add_source(::config::File::with_name(DEFAULT_CONFIG_FILE).required(false));

        Self::finish(builder)
    }

    /// Load from an explicit file, then overlay the environment
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(EngineError::ConfigError(format!(
                "Config file not found: {:?}",
                path
            )));
        }

        let builder = ::config::Config::builder().add_source(::config::File::from(path));

        Self::finish(builder)
    }

    fn finish(
        builder: ::config::ConfigBuilder<::config::builder::DefaultState>,
    ) -> Result<Self> {
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;

        debug!("Engine configuration resolved: {:?}", config);
        Ok(config)
    }

    /// Reject configurations the datapath cannot run with
    pub fn validate(&self) -> Result<()> {
        let dp = &self.datapath;

        if dp.proxy_port == 0 || dp.dns_proxy_port == 0 || dp.dns_capture_port == 0 {
            return Err(EngineError::ConfigError(
                "proxy, DNS proxy and DNS capture ports must be non-zero".to_string(),
            ));
        }

        if dp.proxy_port == dp.dns_proxy_port {
            return Err(EngineError::ConfigError(format!(
                "proxy_port and dns_proxy_port collide on {}",
                dp.proxy_port
            )));
        }

        if dp.dns_capture_port == dp.dns_proxy_port {
            return Err(EngineError::ConfigError(format!(
                "dns_capture_port must differ from dns_proxy_port ({})",
                dp.dns_proxy_port
            )));
        }

        if dp.bridge_ip.is_loopback() || dp.bridge_ip.is_unspecified() {
            return Err(EngineError::ConfigError(format!(
                "bridge_ip {} must be a routable local address",
                dp.bridge_ip
            )));
        }

        self.tables.validate()
    }
}

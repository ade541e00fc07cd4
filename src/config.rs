//! Configuration management for Floodgate.
//!
//! Settings come from an optional YAML file, overridden by environment
//! variables such as `FLOODGATE__SERVER__LISTEN_ADDR` or
//! `FLOODGATE__THROTTLING__FAILURE_POLICY`.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};

use crate::error::{FloodgateError, Result};
use crate::mesh::ClusterConfig;
use crate::throttle::FailurePolicy;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Throttling configuration
    #[serde(default)]
    pub throttling: ThrottlingConfig,

    /// Peer mesh configuration, used with the `mesh` store
    #[serde(default)]
    pub mesh: MeshConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Proxies allowed to set the client address via `X-Forwarded-For`
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trusted_proxies: Vec::new(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store backs the throttler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local counters
    #[default]
    Memory,
    /// Counters gossiped across the peer mesh
    Mesh,
}

/// Throttling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottlingConfig {
    /// Path to the YAML throttle rules
    pub rules_path: Option<PathBuf>,

    /// Behavior when a rule cannot be evaluated
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default)]
    pub store: StoreBackend,

    /// How often expired counters are swept, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            failure_policy: FailurePolicy::default(),
            store: StoreBackend::default(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl ThrottlingConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn default_sweep_interval() -> u64 {
    60
}

/// Peer mesh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Node identifier; a random one is generated when unset
    pub node_id: Option<String>,

    /// Gossip listen address
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers; defaults to `listen_addr`
    pub advertise_addr: Option<SocketAddr>,

    /// Seed nodes used to join the mesh
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval(),
        }
    }
}

impl MeshConfig {
    /// Build the cluster settings for this node.
    pub fn to_cluster_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: defaults.dead_node_grace_period,
        }
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "floodgate".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FloodgateConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        deserialize(builder.build())
    }

    /// Load configuration from a file path, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = File::from(path.as_ref()).format(FileFormat::Yaml);
        deserialize(Config::builder().add_source(source).build())
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let source = File::from_str(yaml, FileFormat::Yaml);
        deserialize(Config::builder().add_source(source).build())
    }
}

fn deserialize(config: std::result::Result<Config, config::ConfigError>) -> Result<FloodgateConfig> {
    config
        .and_then(|config| config.try_deserialize())
        .map_err(|e| FloodgateError::Config(e.to_string()))
}

//! Configuration for the Armada node binary.
//!
//! Loads the TOML file named on the command line, writes a commented default
//! file when none exists yet, and converts the surface into the
//! [`ClusterConfig`] consumed by the cluster layer.

use anyhow::{bail, Context, Result};
use armada_cluster::{
    ClusterConfig, ListenerAddress, NetworkClusterNode, NodeId, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_MAX_NO_UPDATE, DEFAULT_RECONNECT_INTERVAL, DEFAULT_TICKS_PER_SECOND,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

fn default_max_frame_size() -> usize {
    1024 * 1024
}

fn default_heartbeat_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64
}

fn default_max_no_update_ms() -> u64 {
    DEFAULT_MAX_NO_UPDATE.as_millis() as u64
}

fn default_ticks_per_second() -> u32 {
    DEFAULT_TICKS_PER_SECOND
}

fn default_reconnect_ms() -> u64 {
    DEFAULT_RECONNECT_INTERVAL.as_millis() as u64
}

fn default_query_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Identity and listen addresses of this node
    pub node: NodeSettings,
    /// The other configured cluster members
    #[serde(default)]
    pub members: Vec<MemberSettings>,
    /// Heartbeat, liveness and scheduler timings
    #[serde(default)]
    pub timings: TimingSettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Identity of the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Unique node id within the cluster (e.g. "Node-1")
    pub id: String,
    /// Socket address the cluster listener binds to
    pub bind_address: String,
    /// Addresses advertised to peers for dialing back, as "host:port"
    pub listeners: Vec<String>,
    /// Upper bound for a single wire frame in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// One remote cluster member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSettings {
    /// The peer's node id
    pub id: String,
    /// The peer's listen address as "host:port"
    pub address: String,
}

/// Cluster timing knobs, all in milliseconds unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    /// How often the local snapshot is broadcast
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    /// Staleness bound after which a silent peer is evicted
    #[serde(default = "default_max_no_update_ms")]
    pub max_no_update_ms: u64,
    /// Tick rate of the cluster duty scheduler
    #[serde(default = "default_ticks_per_second")]
    pub ticks_per_second: u32,
    /// Delay between dial attempts to disconnected members
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_interval_ms: u64,
    /// Deadline for cluster queries and RPC calls
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_ms(),
            max_no_update_ms: default_max_no_update_ms(),
            ticks_per_second: default_ticks_per_second(),
            reconnect_interval_ms: default_reconnect_ms(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                id: "Node-1".to_string(),
                bind_address: "0.0.0.0:14920".to_string(),
                listeners: vec!["127.0.0.1:14920".to_string()],
                max_frame_size: default_max_frame_size(),
            },
            members: Vec::new(),
            timings: TimingSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads the configuration from `path`. A missing file is not an error:
    /// a default file is written there instead so operators have something
    /// to edit.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading config file {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("parsing config file {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)
                .context("serializing default configuration")?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing default config file {}", path.display()))?;
            info!(path = %path.display(), "created default configuration file");
            Ok(default_config)
        }
    }

    /// Translates the TOML surface into the cluster layer's configuration
    /// and runs its structural validation.
    pub fn to_cluster_config(&self) -> Result<ClusterConfig> {
        let listeners = self
            .node
            .listeners
            .iter()
            .map(|raw| parse_listener(raw))
            .collect::<Result<Vec<_>>>()?;
        let local = NetworkClusterNode::new(NodeId::from(self.node.id.as_str()), listeners);
        let bind_address = self
            .node
            .bind_address
            .parse()
            .with_context(|| format!("invalid bind address {:?}", self.node.bind_address))?;

        let mut config = ClusterConfig::new(local, bind_address);
        config.members = self
            .members
            .iter()
            .map(|member| {
                let listener = parse_listener(&member.address)?;
                Ok(NetworkClusterNode::new(
                    NodeId::from(member.id.as_str()),
                    vec![listener],
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        config.heartbeat_interval = Duration::from_millis(self.timings.heartbeat_interval_ms);
        config.max_no_update = Duration::from_millis(self.timings.max_no_update_ms);
        config.ticks_per_second = self.timings.ticks_per_second;
        config.reconnect_interval = Duration::from_millis(self.timings.reconnect_interval_ms);
        config.query_timeout = Duration::from_millis(self.timings.query_timeout_ms);
        config.max_frame_size = self.node.max_frame_size;

        config.validate().context("cluster configuration invalid")?;
        Ok(config)
    }

    /// Checks everything startup depends on: the log level here, the
    /// structural rules through [`Self::to_cluster_config`].
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "invalid log level {:?}, must be one of {valid_levels:?}",
                self.logging.level
            );
        }
        self.to_cluster_config().map(drop)
    }
}

/// Listener strings are "host:port"; the host may be a name, so only the
/// port is parsed here.
fn parse_listener(raw: &str) -> Result<ListenerAddress> {
    let Some((host, port)) = raw.rsplit_once(':') else {
        bail!("listener {raw:?} is missing a port");
    };
    if host.is_empty() {
        bail!("listener {raw:?} has an empty host");
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("listener {raw:?} has an invalid port"))?;
    Ok(ListenerAddress::new(host, port))
}

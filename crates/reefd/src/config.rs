//! TOML configuration for the Reef daemon.
//!
//! Every section is optional. Missing values fall back to the library
//! defaults, so an empty file yields [`ReefNodeConfig::default_config`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reef_engine::ReefNodeConfig;
use reef_net::DEFAULT_CONNECT_TIMEOUT;
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Node identity and placement attributes.
    pub node: NodeSection,
    /// Cluster membership.
    pub cluster: ClusterSection,
    /// Payload storage backend.
    pub storage: StorageSection,
    /// Peer probing.
    pub health: HealthSection,
    /// Anti-entropy.
    pub gossip: GossipSection,
    /// Replica restoration.
    pub replication: ReplicationSection,
    /// Garbage collection.
    pub gc: GcSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory for persistent data (metadata DB, payload files, node key).
    pub data_dir: PathBuf,
    /// Attributes matched by placement filters, e.g. `Country = "Germany"`.
    pub attributes: BTreeMap<String, String>,
    /// Bound on a single replica push or fetch, in milliseconds.
    pub request_timeout_ms: Option<u64>,
    /// Bound on establishing a connection to a peer, in milliseconds.
    pub connect_timeout_ms: Option<u64>,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".reef"))
            .unwrap_or_else(|| PathBuf::from(".reef"));
        Self {
            data_dir,
            attributes: BTreeMap::new(),
            request_timeout_ms: None,
            connect_timeout_ms: None,
        }
    }
}

/// `[cluster]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Shared secret. Nodes with different secrets cannot connect.
    ///
    /// If empty, a random secret is generated at startup and printed.
    pub secret: String,
    /// Peers contacted on startup (`"node-id"` or `"node-id@host:port"`).
    pub peers: Vec<String>,
}

/// `[storage]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Backend type: `"file"` (default) or `"memory"`.
    pub backend: String,
    /// Capacity of the memory backend in bytes. Unbounded if omitted.
    pub max_bytes: Option<u64>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            max_bytes: None,
        }
    }
}

/// `[health]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub probe_interval_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    /// Consecutive failed probes before a peer is unreachable.
    pub max_failures: Option<u32>,
    pub unreachable_timeout_ms: Option<u64>,
    /// Consecutive successful probes before an unreachable peer recovers.
    pub recovery_successes: Option<u32>,
}

/// `[gossip]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GossipSection {
    pub interval_ms: Option<u64>,
    /// Peers contacted per round.
    pub fanout: Option<usize>,
}

/// `[replication]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    pub interval_ms: Option<u64>,
    /// Maximum bandwidth for replica pushes (e.g. `"50MB/s"`).
    pub max_bandwidth: Option<String>,
}

/// `[gc]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GcSection {
    pub interval_ms: Option<u64>,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
    /// Output format: `"text"` (default) or `"json"`.
    pub format: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read {}", p.display()))?;
                let config: CliConfig = toml::from_str(&content)
                    .with_context(|| format!("failed to parse {}", p.display()))?;
                config.validate()?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        let config: CliConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            matches!(self.storage.backend.as_str(), "file" | "memory"),
            "unknown storage backend {:?} (expected \"file\" or \"memory\")",
            self.storage.backend
        );
        anyhow::ensure!(
            matches!(self.log.format.as_str(), "text" | "json"),
            "unknown log format {:?} (expected \"text\" or \"json\")",
            self.log.format
        );
        Ok(())
    }

    /// Whether the node keeps everything in memory.
    pub fn memory_mode(&self) -> bool {
        self.storage.backend == "memory"
    }

    /// Time limit for dialing a peer.
    pub fn connect_timeout(&self) -> Duration {
        self.node
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    /// The engine configuration: library defaults overridden by the file.
    pub fn node_config(&self) -> ReefNodeConfig {
        let mut config = ReefNodeConfig::default_config();

        if let Some(ms) = self.node.request_timeout_ms {
            config.request_timeout = Duration::from_millis(ms);
            config.replication.request_timeout = Duration::from_millis(ms);
        }

        let health = &mut config.health;
        if let Some(ms) = self.health.probe_interval_ms {
            health.probe_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.health.probe_timeout_ms {
            health.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.health.max_failures {
            health.max_failures = n;
        }
        if let Some(ms) = self.health.unreachable_timeout_ms {
            health.unreachable_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.health.recovery_successes {
            health.recovery_successes = n;
        }

        if let Some(ms) = self.gossip.interval_ms {
            config.gossip.interval = Duration::from_millis(ms);
        }
        if let Some(fanout) = self.gossip.fanout {
            config.gossip.fanout = fanout;
        }

        if let Some(ms) = self.replication.interval_ms {
            config.replication.interval = Duration::from_millis(ms);
        }
        if let Some(bw) = self.replication.max_bandwidth.as_deref() {
            config.replication.bytes_per_sec = parse_bandwidth(bw);
        }

        if let Some(ms) = self.gc.interval_ms {
            config.gc.interval = Duration::from_millis(ms);
        }

        config
    }
}

/// Parse a human-readable bandwidth string into bytes per second.
///
/// Supports: `"100MB/s"`, `"1GB/s"`, `"512KB/s"`, `"1048576"` (raw bytes).
/// Unparseable numbers fall back to 50 MB/s.
fn parse_bandwidth(s: &str) -> u64 {
    const FALLBACK: u64 = 50 * 1_048_576;
    let s = s.trim().trim_end_matches("/s");
    let (num, unit) = if let Some(num) = s.strip_suffix("GB") {
        (num, 1_073_741_824)
    } else if let Some(num) = s.strip_suffix("MB") {
        (num, 1_048_576)
    } else if let Some(num) = s.strip_suffix("KB") {
        (num, 1_024)
    } else {
        (s, 1)
    };
    num.trim()
        .parse::<u64>()
        .map(|n| n * unit)
        .unwrap_or(FALLBACK)
}

/*!
 * Cluster Configuration
 *
 * TOML-backed configuration for the whole proxy process: one `[[cluster]]`
 * table per forwarded cluster, plus process-wide settings (log level,
 * default timeouts). Deserialized with `serde`, following the ambient
 * convention the rest of this codebase uses for typed, validated config
 * rather than hand-rolled parsing. No Go source in the reference corpus
 * defines this struct directly — its shape is inferred from how
 * `ClusterConfig` fields are actually used across the forwarder, listener
 * and pinger.
 */

use crate::error::{ProxyError, Result};
use crate::forwarder::{self, ServerSpec};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

fn default_listen_proto() -> String {
    "tcp".to_string()
}
fn default_conns_per_node() -> usize {
    4
}
fn default_max_connections() -> i64 {
    10_000
}
fn default_read_timeout_ms() -> u64 {
    1_000
}
fn default_write_timeout_ms() -> u64 {
    1_000
}
fn default_ping_interval_ms() -> u64 {
    1_000
}
fn default_ping_fail_limit() -> u32 {
    3
}
fn default_ping_backoff_ms() -> u64 {
    300_000
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default = "default_listen_proto")]
    pub listen_proto: String,
    pub listen_addr: String,
    pub servers: Vec<String>,
    #[serde(default = "default_true")]
    pub hash_tag: bool,
    #[serde(default)]
    pub use_crc16_ring: bool,
    pub password: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: i64,
    #[serde(default = "default_conns_per_node")]
    pub conns_per_node: usize,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_ping_fail_limit")]
    pub ping_fail_limit: u32,
    #[serde(default = "default_ping_backoff_ms")]
    pub ping_backoff_ms: u64,
}

impl ClusterConfig {
    pub fn parsed_servers(&self) -> Result<Vec<ServerSpec>> {
        forwarder::parse_servers(&self.servers)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn pinger_config(&self) -> crate::pinger::PingerConfig {
        crate::pinger::PingerConfig {
            interval: Duration::from_millis(self.ping_interval_ms),
            fail_limit: self.ping_fail_limit,
            backoff: Duration::from_millis(self.ping_backoff_ms),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub watch_config: bool,
    #[serde(rename = "cluster", default)]
    pub clusters: Vec<ClusterConfig>,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            return Err(ProxyError::ConfigServerFormat("no [[cluster]] tables defined".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for cluster in &self.clusters {
            if !seen.insert(cluster.name.clone()) {
                return Err(ProxyError::ConfigServerFormat(format!("duplicate cluster name: {}", cluster.name)));
            }
            cluster.parsed_servers()?;
        }
        Ok(())
    }
}

pub fn load_from_file(path: &Path) -> Result<ProxyConfig> {
    let text = std::fs::read_to_string(path).map_err(ProxyError::from)?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<ProxyConfig> {
    let cfg: ProxyConfig = toml::from_str(text).map_err(|e| ProxyError::ConfigServerFormat(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        log_level = "debug"
        watch_config = true

        [[cluster]]
        name = "cache"
        listen_addr = "127.0.0.1:6400"
        servers = ["127.0.0.1:7000:1 a", "127.0.0.1:7001:1 b"]

        [[cluster]]
        name = "sessions"
        listen_addr = "127.0.0.1:6401"
        servers = ["127.0.0.1:7100:1"]
        hash_tag = false
        max_connections = 500
    "#;

    #[test]
    fn parses_multiple_clusters_with_defaults() {
        let cfg = parse(SAMPLE).unwrap();
        assert_eq!(cfg.clusters.len(), 2);
        assert_eq!(cfg.clusters[0].conns_per_node, 4);
        assert!(cfg.clusters[0].hash_tag);
        assert_eq!(cfg.clusters[1].max_connections, 500);
        assert!(!cfg.clusters[1].hash_tag);
    }

    #[test]
    fn rejects_duplicate_cluster_names() {
        let text = r#"
            [[cluster]]
            name = "a"
            listen_addr = "127.0.0.1:1"
            servers = ["127.0.0.1:2:1"]
            [[cluster]]
            name = "a"
            listen_addr = "127.0.0.1:3"
            servers = ["127.0.0.1:4:1"]
        "#;
        assert!(parse(text).is_err());
    }

    #[test]
    fn rejects_empty_config() {
        assert!(parse("").is_err());
    }
}

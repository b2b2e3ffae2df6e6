//! Configuration for pgmon components

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `PGMON__MONITOR__FULL_RATIO=0.9`
pub const ENV_PREFIX: &str = "PGMON";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Coordinator replica ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Service-level settings (bind address, tick)
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// PG monitor thresholds and intervals
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Initial node map (storage nodes and pools)
    #[serde(default)]
    pub cluster: ClusterSeed,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "coord-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            coordinator: CoordinatorConfig::default(),
            monitor: MonitorConfig::default(),
            cluster: ClusterSeed::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply
    /// `PGMON__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.monitor.validate()?;
        Ok(config)
    }
}

/// Coordinator service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Interval of the liveness / creation sweep
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 6800))
}
fn default_tick_interval() -> u64 {
    5_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl CoordinatorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// PG monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// A node silent for longer than this is flagged stale
    #[serde(default = "default_report_timeout")]
    pub report_timeout_secs: u64,

    /// Minimum spacing of PG creation notifications to one node
    #[serde(default = "default_pg_create_interval")]
    pub pg_create_interval_secs: u64,

    /// Batching window for mutating reports
    #[serde(default = "default_propose_interval")]
    pub propose_interval_ms: u64,

    /// Usage ratio at which a node counts as full
    #[serde(default = "default_full_ratio")]
    pub full_ratio: f32,

    /// Usage ratio at which a node counts as near-full
    #[serde(default = "default_nearfull_ratio")]
    pub nearfull_ratio: f32,
}

fn default_report_timeout() -> u64 {
    900
}
fn default_pg_create_interval() -> u64 {
    30
}
fn default_propose_interval() -> u64 {
    1_000
}
fn default_full_ratio() -> f32 {
    0.95
}
fn default_nearfull_ratio() -> f32 {
    0.85
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            report_timeout_secs: default_report_timeout(),
            pg_create_interval_secs: default_pg_create_interval(),
            propose_interval_ms: default_propose_interval(),
            full_ratio: default_full_ratio(),
            nearfull_ratio: default_nearfull_ratio(),
        }
    }
}

impl MonitorConfig {
    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_secs)
    }

    pub fn pg_create_interval(&self) -> Duration {
        Duration::from_secs(self.pg_create_interval_secs)
    }

    pub fn propose_interval(&self) -> Duration {
        Duration::from_millis(self.propose_interval_ms)
    }

    /// Ratios must lie in (0, 1] and near-full may not exceed full
    pub fn validate(&self) -> Result<()> {
        for (name, ratio) in [
            ("full_ratio", self.full_ratio),
            ("nearfull_ratio", self.nearfull_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(crate::Error::InvalidConfig(format!(
                    "{} must be in (0, 1], got {}",
                    name, ratio
                )));
            }
        }
        if self.nearfull_ratio > self.full_ratio {
            return Err(crate::Error::InvalidConfig(format!(
                "nearfull_ratio {} exceeds full_ratio {}",
                self.nearfull_ratio, self.full_ratio
            )));
        }
        if self.report_timeout_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "report_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Storage nodes and pools known at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSeed {
    #[serde(default)]
    pub nodes: Vec<String>,

    #[serde(default)]
    pub pools: Vec<PoolSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSeed {
    pub id: u64,
    pub pg_num: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.monitor.validate().is_ok());
        assert_eq!(config.monitor.report_timeout(), Duration::from_secs(900));
    }

    #[test]
    fn test_invalid_ratios() {
        let mut monitor = MonitorConfig::default();
        monitor.full_ratio = 0.0;
        assert!(monitor.validate().is_err());

        let mut monitor = MonitorConfig::default();
        monitor.nearfull_ratio = 0.99;
        assert!(monitor.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
node_id = "coord-7"

[monitor]
report_timeout_secs = 60
full_ratio = 0.9

[cluster]
nodes = ["osd.0", "osd.1"]
pools = [{{ id = 1, pg_num = 8 }}]
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.node_id, "coord-7");
        assert_eq!(config.monitor.report_timeout_secs, 60);
        assert_eq!(config.monitor.full_ratio, 0.9);
        assert_eq!(config.monitor.nearfull_ratio, 0.85);
        assert_eq!(config.cluster.nodes.len(), 2);
        assert_eq!(config.cluster.pools[0].pg_num, 8);
    }
}

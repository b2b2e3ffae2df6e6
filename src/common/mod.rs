//! Common utilities and types shared across pgmon

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod raft;
pub mod tracing_middleware;
pub mod utils;

pub use config::{ClusterSeed, Config, CoordinatorConfig, MonitorConfig, PoolSeed};
pub use error::{Error, Result};
pub use hash::{blake3_hash, fingerprint, hrw_hash, select_primary};
pub use metrics::METRICS;
pub use utils::{elapsed_since, format_bytes, format_kb, percent};

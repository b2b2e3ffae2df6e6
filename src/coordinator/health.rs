//! Cluster health derived from the committed PG map
//!
//! `evaluate` is a pure function of a `PgMap` snapshot: it never mutates and
//! can be called on any consistent copy.

use crate::common::percent;
use crate::coordinator::pg_map::{PgMap, PgState};
use serde::{Deserialize, Serialize};

/// Ordered severity: `Ok < Warn < Err`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    #[serde(rename = "HEALTH_OK")]
    Ok,
    #[serde(rename = "HEALTH_WARN")]
    Warn,
    #[serde(rename = "HEALTH_ERR")]
    Err,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Ok => write!(f, "HEALTH_OK"),
            HealthStatus::Warn => write!(f, "HEALTH_WARN"),
            HealthStatus::Err => write!(f, "HEALTH_ERR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// One line per failed check
    pub summary: Vec<String>,
    /// One line per affected node or PG
    pub detail: Vec<String>,
}

impl HealthReport {
    fn new() -> Self {
        Self {
            status: HealthStatus::Ok,
            summary: Vec::new(),
            detail: Vec::new(),
        }
    }

    pub(crate) fn raise(&mut self, status: HealthStatus, line: String) {
        self.status = self.status.max(status);
        self.summary.push(line);
    }

    pub fn is_ok(&self) -> bool {
        self.status == HealthStatus::Ok
    }

    /// Every explanation line, summary first
    pub fn explanations(&self) -> impl Iterator<Item = &str> {
        self.summary.iter().chain(self.detail.iter()).map(String::as_str)
    }
}

/// PG flags that degrade health, most severe first
const PG_CHECKS: [(PgState, &str, HealthStatus); 6] = [
    (PgState::DOWN, "down", HealthStatus::Err),
    (PgState::INCONSISTENT, "inconsistent", HealthStatus::Err),
    (PgState::STALE, "stale", HealthStatus::Warn),
    (PgState::DEGRADED, "degraded", HealthStatus::Warn),
    (PgState::PEERING, "peering", HealthStatus::Warn),
    (PgState::CREATING, "creating", HealthStatus::Warn),
];

pub fn evaluate(map: &PgMap) -> HealthReport {
    let mut report = HealthReport::new();
    let summary = map.summary();

    if !map.stale_nodes.is_empty() {
        let names: Vec<&str> = map.stale_nodes.iter().map(String::as_str).collect();
        report.raise(
            HealthStatus::Warn,
            format!("{} nodes stale: {}", names.len(), names.join(", ")),
        );
        for node in &map.stale_nodes {
            let pgs = map.pgs_of_node(node).count();
            report.detail.push(format!(
                "node {} has not reported within the timeout; {} pgs stale",
                node, pgs
            ));
        }
    }

    for (flag, name, status) in PG_CHECKS {
        let count = summary.pgs_with(flag);
        if count == 0 {
            continue;
        }
        report.raise(status, format!("{} pgs {}", count, name));
        for (pgid, stat) in &map.pg_stat {
            if stat.state.contains(flag) {
                report.detail.push(format!("pg {} is {}", pgid, stat.state));
            }
        }
    }

    let sum = &summary.pg_sum;
    if sum.num_objects_degraded > 0 {
        report.raise(
            HealthStatus::Warn,
            format!(
                "recovery {}/{} objects degraded ({:.3}%)",
                sum.num_objects_degraded,
                sum.num_objects,
                percent(sum.num_objects_degraded, sum.num_objects)
            ),
        );
    }
    if sum.num_objects_unfound > 0 {
        report.raise(
            HealthStatus::Warn,
            format!(
                "{}/{} unfound ({:.3}%)",
                sum.num_objects_unfound,
                sum.num_objects,
                percent(sum.num_objects_unfound, sum.num_objects)
            ),
        );
    }

    if !summary.full_nodes.is_empty() {
        report.raise(
            HealthStatus::Err,
            format!("{} full nodes", summary.full_nodes.len()),
        );
    }
    if !summary.nearfull_nodes.is_empty() {
        report.raise(
            HealthStatus::Warn,
            format!("{} near full nodes", summary.nearfull_nodes.len()),
        );
    }
    for node in summary.full_nodes.iter().chain(summary.nearfull_nodes.iter()) {
        if let Some(stat) = map.node_stat.get(node) {
            let kind = if summary.full_nodes.contains(node) {
                "full"
            } else {
                "near full"
            };
            report.detail.push(format!(
                "node {} is {} at {:.0}%",
                node,
                kind,
                stat.usage_ratio() * 100.0
            ));
        }
    }

    report
}

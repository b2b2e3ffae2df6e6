//! Metrics collection
//!
//! Prometheus-compatible counters and gauges for the PG monitor:
//! - node report dispositions (accepted, unchanged, queued, rejected)
//! - proposal / commit / loss counts
//! - PG creation notifications
//! - committed map shape (version, PGs, stale nodes)

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Process-wide metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    pub reports_accepted: Counter,
    pub reports_unchanged: Counter,
    pub reports_queued: Counter,
    pub reports_rejected: Counter,
    pub proposals: Counter,
    pub proposals_lost: Counter,
    pub commits: Counter,
    pub pg_creates_sent: Counter,
    pub http_requests: Counter,
    pub http_errors: Counter,

    pub map_version: Gauge,
    pub num_pgs: Gauge,
    pub creating_pgs: Gauge,
    pub stale_nodes: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            reports_accepted: Counter::new(),
            reports_unchanged: Counter::new(),
            reports_queued: Counter::new(),
            reports_rejected: Counter::new(),
            proposals: Counter::new(),
            proposals_lost: Counter::new(),
            commits: Counter::new(),
            pg_creates_sent: Counter::new(),
            http_requests: Counter::new(),
            http_errors: Counter::new(),
            map_version: Gauge::new(),
            num_pgs: Gauge::new(),
            creating_pgs: Gauge::new(),
            stale_nodes: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 10] = [
            ("pgmon_reports_accepted_total", "Node reports folded into a delta", &self.reports_accepted),
            ("pgmon_reports_unchanged_total", "Node reports acknowledged without mutation", &self.reports_unchanged),
            ("pgmon_reports_queued_total", "Node reports queued behind an in-flight proposal", &self.reports_queued),
            ("pgmon_reports_rejected_total", "Node reports rejected at the boundary", &self.reports_rejected),
            ("pgmon_proposals_total", "Deltas handed to consensus", &self.proposals),
            ("pgmon_proposals_lost_total", "Proposals lost and retried", &self.proposals_lost),
            ("pgmon_commits_total", "Deltas applied to the committed map", &self.commits),
            ("pgmon_pg_creates_sent_total", "PG creation notifications sent", &self.pg_creates_sent),
            ("pgmon_http_requests_total", "HTTP requests served", &self.http_requests),
            ("pgmon_http_errors_total", "HTTP requests answered with an error", &self.http_errors),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.get());
        }

        let gauges: [(&str, &str, u64); 5] = [
            ("pgmon_map_version", "Committed PG map version", self.map_version.get()),
            ("pgmon_pgs", "Placement groups in the committed map", self.num_pgs.get()),
            ("pgmon_creating_pgs", "Placement groups waiting for creation", self.creating_pgs.get()),
            ("pgmon_stale_nodes", "Nodes flagged stale", self.stale_nodes.get()),
            ("pgmon_uptime_seconds", "Server uptime in seconds", self.uptime_seconds()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, value);
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();

        assert_eq!(counter.get(), 0);
        counter.inc();
        assert_eq!(counter.get(), 1);
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new();
        gauge.set(10);
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_prometheus_output() {
        let registry = MetricsRegistry::new();
        registry.commits.add(3);
        registry.stale_nodes.set(2);

        let out = registry.to_prometheus();
        assert!(out.contains("# TYPE pgmon_commits_total counter"));
        assert!(out.contains("pgmon_commits_total 3"));
        assert!(out.contains("pgmon_stale_nodes 2"));
    }
}

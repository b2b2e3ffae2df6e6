//! Per-node report bookkeeping: liveness timestamps, last report fingerprint
//! and PG creation notification throttling.
//!
//! Pure bookkeeping, never replicated: each coordinator replica keeps its own.

use crate::common::elapsed_since;
use crate::coordinator::pg_map::NodeId;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeReportRecord {
    /// When the last report was accepted (cleared on election start)
    pub last_report: Option<Instant>,
    /// Fingerprint of the last report that was folded into a delta
    pub fingerprint: Option<String>,
    /// When a creation notification was last sent to this node
    pub last_create_sent: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct ReportThrottle {
    records: BTreeMap<NodeId, NodeReportRecord>,
}

/// Move `slot` forward to `now`, never backwards
fn advance(slot: &mut Option<Instant>, now: Instant) {
    *slot = Some(match *slot {
        Some(prev) if prev > now => prev,
        _ => now,
    });
}

impl ReportThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: &str) -> Option<&NodeReportRecord> {
        self.records.get(node)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Same content as the last accepted report?
    pub fn is_unchanged(&self, node: &str, fingerprint: &str) -> bool {
        self.records
            .get(node)
            .and_then(|r| r.fingerprint.as_deref())
            .is_some_and(|fp| fp == fingerprint)
    }

    /// Liveness refresh for a report that needed no mutation
    pub fn touch(&mut self, node: &str, now: Instant) {
        let record = self.records.entry(node.to_string()).or_default();
        advance(&mut record.last_report, now);
    }

    /// Remember a report that was folded into the pending delta
    pub fn record_report(&mut self, node: &str, fingerprint: String, now: Instant) {
        let record = self.records.entry(node.to_string()).or_default();
        advance(&mut record.last_report, now);
        record.fingerprint = Some(fingerprint);
    }

    /// Drop the fingerprint so the next report from `node` is folded again
    pub fn forget_fingerprint(&mut self, node: &str) {
        if let Some(record) = self.records.get_mut(node) {
            record.fingerprint = None;
        }
    }

    /// Nodes whose last report is older than `timeout`.
    /// Nodes that never reported are not considered.
    pub fn overdue(&self, now: Instant, timeout: Duration) -> Vec<(NodeId, Duration)> {
        self.records
            .iter()
            .filter_map(|(node, record)| {
                let silent = elapsed_since(now, record.last_report?);
                (silent > timeout).then(|| (node.clone(), silent))
            })
            .collect()
    }

    /// May a creation notification go out to `node` now?
    pub fn can_send_create(&self, node: &str, now: Instant, cooldown: Duration) -> bool {
        match self.records.get(node).and_then(|r| r.last_create_sent) {
            Some(sent) => elapsed_since(now, sent) >= cooldown,
            None => true,
        }
    }

    pub fn record_create_sent(&mut self, node: &str, now: Instant) {
        let record = self.records.entry(node.to_string()).or_default();
        advance(&mut record.last_create_sent, now);
    }

    /// Forget every liveness timestamp; nodes are re-armed by their next
    /// report. Fingerprints and creation times are kept.
    pub fn reset_liveness(&mut self) {
        for record in self.records.values_mut() {
            record.last_report = None;
        }
    }
}

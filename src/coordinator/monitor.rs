//! PG monitor: the consensus-integrated state machine
//!
//! Holds the committed `PgMap`, the pending `Incremental` being folded
//! between rounds and at most one in-flight proposal. All mutation goes
//! through `&mut self`; the owner serializes inputs.
//!
//! Node reports are classified before anything changes:
//! - same fingerprint as the last accepted report: acknowledged, liveness
//!   refreshed, nothing else
//! - otherwise folded into the pending delta (or queued while a proposal is
//!   in flight) and a proposal is requested
//!
//! Deferred work (stats acks, PG creation notifications) is collected in an
//! outbox the owner drains with `take_outbound`.

use crate::common::{elapsed_since, fingerprint, MonitorConfig, Result, METRICS};
use crate::coordinator::consensus::{
    dispatch, ConsensusParticipant, ProposalId, ReplicatedService,
};
use crate::coordinator::health::{self, HealthReport, HealthStatus};
use crate::coordinator::node_map::NodeMap;
use crate::coordinator::pg_map::{
    Incremental, NodeId, NodeStat, PgId, PgMap, PgStat, PgState, PoolStat,
};
use crate::coordinator::throttle::ReportThrottle;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

/// Upper bound on commit/propose rounds handled by one `pump`
const MAX_PUMP_ROUNDS: usize = 64;

/// Completion token handed out for every accepted mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Periodic usage report of one storage node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    /// Node map epoch the node was running with
    pub epoch: u64,
    pub node_stat: NodeStat,
    #[serde(default)]
    pub pg_stats: BTreeMap<PgId, PgStat>,
}

impl NodeReport {
    pub fn validate(&self) -> Result<()> {
        let s = &self.node_stat;
        if s.kb_used > s.kb || s.kb_avail > s.kb {
            return Err(crate::Error::Malformed(format!(
                "node usage exceeds capacity: kb={} used={} avail={}",
                s.kb, s.kb_used, s.kb_avail
            )));
        }
        for (pgid, stat) in &self.pg_stats {
            if !stat.state.is_known() {
                return Err(crate::Error::Malformed(format!(
                    "pg {} has unknown state bits {:#x}",
                    pgid,
                    stat.state.bits()
                )));
            }
            if stat.num_objects_unfound > stat.num_objects {
                return Err(crate::Error::Malformed(format!(
                    "pg {} reports more unfound than total objects",
                    pgid
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ack", rename_all = "snake_case")]
pub enum Ack {
    /// Nothing to change
    Unchanged,
    /// Folded into the pending delta. The proposal carrying it may still be
    /// deferred by the batching window; `StatsAck` follows the commit.
    Accepted { request: RequestId },
    /// Waiting for the in-flight proposal to finish
    Queued { request: RequestId },
}

/// Messages for storage nodes, produced by the monitor, sent by its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// The stats of `request` are part of committed map `version`
    StatsAck {
        node: NodeId,
        request: RequestId,
        version: u64,
        pgs: Vec<PgId>,
    },
    /// Create these PGs; one message per node per cooldown window
    CreatePgs {
        node: NodeId,
        epoch: u64,
        pgs: Vec<PgId>,
    },
}

/// Read-only questions answered from the committed map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum Query {
    PoolStats { pools: Vec<u64> },
    Statfs,
    PgStat,
    PgDump,
    PgMap { pgid: PgId },
    NodeStats,
    Health,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatfsReply {
    pub kb: u64,
    pub kb_used: u64,
    pub kb_avail: u64,
    pub num_objects: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PgStatSummary {
    pub version: u64,
    pub num_pgs: u64,
    pub by_state: BTreeMap<String, u64>,
    pub num_objects: u64,
    pub num_bytes: u64,
    pub kb: u64,
    pub kb_used: u64,
    pub kb_avail: u64,
    pub stale_nodes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum QueryResponse {
    PoolStats { pools: BTreeMap<u64, PoolStat> },
    Statfs(StatfsReply),
    PgStat(PgStatSummary),
    PgDump(PgMap),
    PgMap { pgid: PgId, stat: PgStat },
    NodeStats { nodes: BTreeMap<NodeId, NodeStat> },
    Health(HealthReport),
}

/// Mutating admin commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    SetFullRatio { ratio: f32 },
    SetNearfullRatio { ratio: f32 },
    ForceCreatePg { pgid: PgId },
}

/// Mutations deferred while a proposal is in flight
#[derive(Debug, Clone)]
enum Queued {
    Report {
        node: NodeId,
        report: NodeReport,
        fingerprint: String,
        request: RequestId,
    },
    Ratios {
        full: f32,
        nearfull: f32,
    },
    ForceCreate {
        pgid: PgId,
    },
    NodeMapScan,
}

/// Reporter waiting for its stats to commit
#[derive(Debug, Clone)]
struct Waiter {
    node: NodeId,
    request: RequestId,
    pgs: Vec<PgId>,
}

#[derive(Debug)]
struct InFlight {
    proposal: ProposalId,
    delta: Incremental,
    waiters: Vec<Waiter>,
}

pub(crate) fn parse_ratio(value: &str) -> Result<f32> {
    let ratio: f32 = value
        .trim()
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid ratio: {}", value)))?;
    validate_ratio(ratio)?;
    Ok(ratio)
}

/// Zero is allowed and means "no change"
fn validate_ratio(ratio: f32) -> Result<()> {
    if (0.0..=1.0).contains(&ratio) {
        Ok(())
    } else {
        Err(crate::Error::InvalidConfig(format!(
            "ratio must be within [0, 1], got {}",
            ratio
        )))
    }
}

pub struct PgMonitor<C: ConsensusParticipant> {
    config: MonitorConfig,
    consensus: C,
    map: PgMap,
    node_map: NodeMap,
    pending: Option<Incremental>,
    pending_waiters: Vec<Waiter>,
    /// First mutation of the current pending delta (batching window)
    pending_since: Option<Instant>,
    force_propose: bool,
    in_flight: Option<InFlight>,
    waiting: VecDeque<Queued>,
    throttle: ReportThrottle,
    next_request: u64,
    outbox: Vec<Outbound>,
    consensus_error: Option<String>,
}

impl<C: ConsensusParticipant> PgMonitor<C> {
    pub fn new(config: MonitorConfig, node_map: NodeMap, consensus: C) -> Self {
        let mut monitor = Self {
            config,
            consensus,
            map: PgMap::default(),
            node_map,
            pending: None,
            pending_waiters: Vec::new(),
            pending_since: None,
            force_propose: false,
            in_flight: None,
            waiting: VecDeque::new(),
            throttle: ReportThrottle::new(),
            next_request: 1,
            outbox: Vec::new(),
            consensus_error: None,
        };
        if monitor.consensus.last_committed() == 0 {
            monitor.create_initial();
        }
        monitor
    }

    // === Accessors ===

    pub fn map(&self) -> &PgMap {
        &self.map
    }

    pub fn node_map(&self) -> &NodeMap {
        &self.node_map
    }

    pub fn pending(&self) -> Option<&Incremental> {
        self.pending.as_ref()
    }

    /// Delta currently handed to consensus
    pub fn in_flight(&self) -> Option<&Incremental> {
        self.in_flight.as_ref().map(|f| &f.delta)
    }

    pub fn queued(&self) -> usize {
        self.waiting.len()
    }

    pub fn throttle(&self) -> &ReportThrottle {
        &self.throttle
    }

    pub fn consensus(&self) -> &C {
        &self.consensus
    }

    pub fn consensus_mut(&mut self) -> &mut C {
        &mut self.consensus
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Drain messages for storage nodes
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        id
    }

    fn not_leader(&self) -> crate::Error {
        crate::Error::NotLeader(
            self.consensus
                .leader()
                .unwrap_or_else(|| "unknown".to_string()),
        )
    }

    /// Stale as the pending delta would leave it
    fn is_node_stale(&self, node: &str) -> bool {
        match &self.pending {
            Some(p) if p.stale_add.contains(node) => true,
            Some(p) if p.stale_clear.contains(node) => false,
            _ => self.map.stale_nodes.contains(node),
        }
    }

    fn mark_pending_dirty(&mut self, now: Instant) {
        self.pending_since.get_or_insert(now);
    }

    // === Node reports ===

    /// Decode and process a report payload (JSON `NodeReport`)
    pub fn handle_report(&mut self, node: &str, payload: &[u8], now: Instant) -> Result<Ack> {
        let report: NodeReport = match serde_json::from_slice(payload) {
            Ok(report) => report,
            Err(e) => {
                METRICS.reports_rejected.inc();
                tracing::warn!(node, error = %e, "rejecting undecodable report");
                return Err(crate::Error::Malformed(e.to_string()));
            }
        };
        self.handle_node_report(node, report, now)
    }

    pub fn handle_node_report(
        &mut self,
        node: &str,
        report: NodeReport,
        now: Instant,
    ) -> Result<Ack> {
        if let Err(e) = report.validate() {
            METRICS.reports_rejected.inc();
            tracing::warn!(node, error = %e, "rejecting malformed report");
            return Err(e);
        }
        if !self.node_map.is_recognized(node) {
            METRICS.reports_rejected.inc();
            tracing::warn!(node, "rejecting report from unknown node");
            return Err(crate::Error::UnknownNode(node.to_string()));
        }

        let fp = fingerprint(&report)?;
        if self.throttle.is_unchanged(node, &fp) && !self.is_node_stale(node) {
            self.throttle.touch(node, now);
            METRICS.reports_unchanged.inc();
            tracing::trace!(node, "report unchanged");
            return Ok(Ack::Unchanged);
        }

        if !self.consensus.is_leader() {
            return Err(self.not_leader());
        }

        let request = self.next_request_id();
        if self.in_flight.is_some() {
            self.throttle.record_report(node, fp.clone(), now);
            self.waiting.push_back(Queued::Report {
                node: node.to_string(),
                report,
                fingerprint: fp,
                request,
            });
            METRICS.reports_queued.inc();
            tracing::debug!(node, %request, "report queued behind in-flight proposal");
            return Ok(Ack::Queued { request });
        }

        self.fold_report(node, report, fp, request, now);
        self.request_proposal(now, false);
        Ok(Ack::Accepted { request })
    }

    fn fold_report(
        &mut self,
        node: &str,
        report: NodeReport,
        fp: String,
        request: RequestId,
        now: Instant,
    ) {
        let clear_stale = self.is_node_stale(node);
        let version = self.map.version + 1;
        let pending = self
            .pending
            .get_or_insert_with(|| Incremental::new(version));

        pending.update_node_stat(node, report.node_stat);
        if clear_stale {
            tracing::info!(node, "node reporting again, clearing stale flag");
            pending.clear_stale(node);
        }

        let mut pgs = Vec::with_capacity(report.pg_stats.len());
        for (pgid, mut stat) in report.pg_stats {
            let created_epoch = match pending.pg_stat(&self.map, &pgid) {
                Some(current) => current.created_epoch,
                None => {
                    tracing::debug!(node, %pgid, "stats for nonexistent pg, skipping");
                    continue;
                }
            };
            if let Some(committed) = self.map.pg_stat.get(&pgid) {
                if committed.reported_epoch > stat.reported_epoch {
                    tracing::debug!(
                        node,
                        %pgid,
                        have = committed.reported_epoch,
                        got = stat.reported_epoch,
                        "older pg stats, skipping"
                    );
                    continue;
                }
            }
            stat.created_epoch = created_epoch;
            stat.state.remove(PgState::STALE);
            if stat.primary.is_none() {
                stat.primary = Some(node.to_string());
            }
            pending.update_pg_stat(pgid, stat);
            pgs.push(pgid);
        }

        self.pending_waiters.push(Waiter {
            node: node.to_string(),
            request,
            pgs,
        });
        self.throttle.record_report(node, fp, now);
        self.mark_pending_dirty(now);
        METRICS.reports_accepted.inc();
        tracing::debug!(node, %request, "report folded into pending delta");
    }

    // === Proposals ===

    fn request_proposal(&mut self, now: Instant, force: bool) {
        if force {
            self.force_propose = true;
        }
        self.maybe_propose(now);
    }

    /// Propose the pending delta if nothing is in flight and either the
    /// batching window elapsed or a forced proposal was requested
    pub fn maybe_propose(&mut self, now: Instant) -> bool {
        if self.in_flight.is_some() || !self.consensus.is_leader() {
            return false;
        }
        match &self.pending {
            Some(pending) if !pending.is_empty() => {}
            _ => return false,
        }
        let window_elapsed = self
            .pending_since
            .map_or(true, |since| elapsed_since(now, since) >= self.config.propose_interval());
        if !(self.force_propose || window_elapsed) {
            return false;
        }
        self.propose_pending()
    }

    fn propose_pending(&mut self) -> bool {
        let payload = match self.encode_pending() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode pending delta");
                return false;
            }
        };
        match self.consensus.propose(payload) {
            Ok(proposal) => {
                let delta = self.pending.take().unwrap_or_default();
                tracing::info!(
                    %proposal,
                    version = delta.version,
                    pgs = delta.pg_stat_updates.len(),
                    nodes = delta.node_stat_updates.len(),
                    "proposing pending delta"
                );
                self.in_flight = Some(InFlight {
                    proposal,
                    delta,
                    waiters: std::mem::take(&mut self.pending_waiters),
                });
                self.pending_since = None;
                self.force_propose = false;
                METRICS.proposals.inc();
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "proposal not accepted, keeping delta pending");
                false
            }
        }
    }

    /// Deliver every consensus event available now
    pub fn pump(&mut self, now: Instant) -> Result<()> {
        for _ in 0..MAX_PUMP_ROUNDS {
            let events = self.consensus.poll();
            if events.is_empty() {
                return Ok(());
            }
            if let Err(e) = dispatch(self, events, now) {
                tracing::error!(error = %e, "failed to apply committed state");
                self.consensus_error = Some(e.to_string());
                return Err(e);
            }
        }
        Ok(())
    }

    fn replay_waiting(&mut self, now: Instant) {
        while self.in_flight.is_none() {
            let Some(item) = self.waiting.pop_front() else {
                break;
            };
            match item {
                Queued::Report {
                    node,
                    report,
                    fingerprint,
                    request,
                } => self.fold_report(&node, report, fingerprint, request, now),
                Queued::Ratios { full, nearfull } => self.fold_ratios(full, nearfull, now),
                Queued::ForceCreate { pgid } => self.fold_force_create(pgid, now),
                Queued::NodeMapScan => {
                    self.register_node_map(now);
                }
            }
        }
    }

    // === Periodic work ===

    /// Liveness sweep, creation notifications and batching flush
    pub fn tick(&mut self, now: Instant) {
        if !self.consensus.is_leader() {
            return;
        }
        self.handle_node_timeouts(now);
        self.send_pg_creates(now);
        self.maybe_propose(now);
    }

    // Skipped entirely while a proposal is in flight, so sustained proposal
    // traffic postpones stale detection until a commit leaves a gap
    fn handle_node_timeouts(&mut self, now: Instant) {
        if self.in_flight.is_some() {
            return;
        }
        let timeout = self.config.report_timeout();
        let mut marked = 0;
        for (node, silent) in self.throttle.overdue(now, timeout) {
            if !self.node_map.is_recognized(&node) || self.is_node_stale(&node) {
                continue;
            }
            tracing::warn!(
                node = %node,
                silent_secs = silent.as_secs(),
                timeout_secs = timeout.as_secs(),
                "no report from node within timeout, marking stale"
            );
            let version = self.map.version + 1;
            self.pending
                .get_or_insert_with(|| Incremental::new(version))
                .mark_stale(&node);
            marked += 1;
        }
        if marked > 0 {
            self.mark_pending_dirty(now);
            self.request_proposal(now, false);
        }
    }

    /// One notification per responsible node per cooldown window
    fn send_pg_creates(&mut self, now: Instant) {
        let mut by_node: BTreeMap<NodeId, Vec<PgId>> = BTreeMap::new();
        for pgid in &self.map.summary().creating_pgs {
            let node = self.node_map.responsible_node(*pgid).or_else(|| {
                self.map
                    .pg_stat
                    .get(pgid)
                    .and_then(|stat| stat.primary.clone())
            });
            match node {
                Some(node) => by_node.entry(node).or_default().push(*pgid),
                None => tracing::debug!(%pgid, "no node available to create pg"),
            }
        }

        let cooldown = self.config.pg_create_interval();
        for (node, pgs) in by_node {
            if !self.throttle.can_send_create(&node, now, cooldown) {
                tracing::trace!(node = %node, "pg create throttled");
                continue;
            }
            tracing::info!(node = %node, count = pgs.len(), "sending pg creates");
            self.throttle.record_create_sent(&node, now);
            METRICS.pg_creates_sent.inc();
            self.outbox.push(Outbound::CreatePgs {
                node,
                epoch: self.node_map.epoch,
                pgs,
            });
        }
    }

    // === Node map ===

    /// Adopt a newer node map and register the PGs it implies
    pub fn check_node_map(&mut self, node_map: NodeMap, now: Instant) {
        if node_map.epoch < self.node_map.epoch {
            tracing::debug!(
                have = self.node_map.epoch,
                got = node_map.epoch,
                "ignoring older node map"
            );
            return;
        }
        self.node_map = node_map;
        if !self.consensus.is_leader() {
            return;
        }
        if self.in_flight.is_some() {
            self.waiting.push_back(Queued::NodeMapScan);
            return;
        }
        if self.register_node_map(now) {
            self.request_proposal(now, false);
        }
    }

    /// Fold PG registrations and removals for the current node map into the
    /// pending delta. Returns whether anything was folded.
    fn register_node_map(&mut self, now: Instant) -> bool {
        let epoch = self.node_map.epoch;
        let scanned = self
            .pending
            .as_ref()
            .and_then(|p| p.pg_scan_epoch)
            .unwrap_or(self.map.last_pg_scan);
        if epoch <= scanned {
            return false;
        }

        let version = self.map.version + 1;
        let pending = self
            .pending
            .get_or_insert_with(|| Incremental::new(version));
        pending.node_map_epoch = Some(epoch);
        pending.pg_scan_epoch = Some(epoch);

        let mut created = 0;
        for pgid in self.node_map.expected_pgs() {
            if pending.pg_stat(&self.map, &pgid).is_none() {
                let primary = self.node_map.responsible_node(pgid);
                pending.update_pg_stat(pgid, PgStat::creating(epoch, primary));
                created += 1;
            }
        }

        let doomed: Vec<PgId> = self
            .map
            .pg_stat
            .keys()
            .chain(pending.pg_stat_updates.keys())
            .filter(|pgid| !self.node_map.has_pool(pgid.pool))
            .copied()
            .collect();
        let removed = doomed.len();
        for pgid in doomed {
            pending.remove_pg(pgid);
        }

        for node in self.map.node_stat.keys() {
            if !self.node_map.is_recognized(node) {
                pending.remove_node_stat(node);
            }
        }
        for node in &self.map.stale_nodes {
            if !self.node_map.is_recognized(node) {
                pending.clear_stale(node);
            }
        }

        tracing::info!(epoch, created, removed, "registered pgs for node map");
        self.mark_pending_dirty(now);
        true
    }

    // === Capacity ratios ===

    /// Live configuration change of a capacity ratio
    pub fn on_config_change(&mut self, key: &str, value: &str, now: Instant) -> Result<Ack> {
        let ratio = parse_ratio(value)?;
        match key {
            "full_ratio" | "mon_osd_full_ratio" => self.update_full_ratios(ratio, 0.0, now),
            "nearfull_ratio" | "mon_osd_nearfull_ratio" => {
                self.update_full_ratios(0.0, ratio, now)
            }
            _ => Err(crate::Error::InvalidConfig(format!(
                "unknown config key: {}",
                key
            ))),
        }
    }

    /// Full and nearfull ratios once everything accepted so far commits:
    /// queued changes over the pending delta over the in-flight one over
    /// the committed map
    pub fn effective_ratios(&self) -> (f32, f32) {
        let mut full = self.map.full_ratio;
        let mut nearfull = self.map.nearfull_ratio;
        let deltas = self
            .in_flight
            .iter()
            .map(|f| &f.delta)
            .chain(self.pending.as_ref());
        for delta in deltas {
            if let Some(ratio) = delta.full_ratio.filter(|r| *r > 0.0) {
                full = ratio;
            }
            if let Some(ratio) = delta.nearfull_ratio.filter(|r| *r > 0.0) {
                nearfull = ratio;
            }
        }
        for queued in &self.waiting {
            if let Queued::Ratios { full: f, nearfull: n } = queued {
                if *f > 0.0 {
                    full = *f;
                }
                if *n > 0.0 {
                    nearfull = *n;
                }
            }
        }
        (full, nearfull)
    }

    /// Fold nonzero ratios into the pending delta and force a proposal
    pub fn update_full_ratios(&mut self, full: f32, nearfull: f32, now: Instant) -> Result<Ack> {
        validate_ratio(full)?;
        validate_ratio(nearfull)?;
        if full == 0.0 && nearfull == 0.0 {
            return Ok(Ack::Unchanged);
        }
        if !self.consensus.is_leader() {
            return Err(self.not_leader());
        }
        let request = self.next_request_id();
        if self.in_flight.is_some() {
            self.waiting.push_back(Queued::Ratios { full, nearfull });
            return Ok(Ack::Queued { request });
        }
        self.fold_ratios(full, nearfull, now);
        self.request_proposal(now, true);
        Ok(Ack::Accepted { request })
    }

    fn fold_ratios(&mut self, full: f32, nearfull: f32, now: Instant) {
        let version = self.map.version + 1;
        let pending = self
            .pending
            .get_or_insert_with(|| Incremental::new(version));
        let mut changed = pending.set_full_ratio(full);
        changed |= pending.set_nearfull_ratio(nearfull);
        if changed {
            tracing::info!(full, nearfull, "capacity ratios updated");
            self.force_propose = true;
            self.mark_pending_dirty(now);
        }
    }

    // === Admin commands ===

    /// Decode and run a mutating admin command (JSON `Command`)
    pub fn handle_command(&mut self, payload: &[u8], now: Instant) -> Result<Ack> {
        let command: Command = serde_json::from_slice(payload)?;
        self.run_command(command, now)
    }

    pub fn run_command(&mut self, command: Command, now: Instant) -> Result<Ack> {
        match command {
            Command::SetFullRatio { ratio } => self.update_full_ratios(ratio, 0.0, now),
            Command::SetNearfullRatio { ratio } => self.update_full_ratios(0.0, ratio, now),
            Command::ForceCreatePg { pgid } => self.force_create_pg(pgid, now),
        }
    }

    fn force_create_pg(&mut self, pgid: PgId, now: Instant) -> Result<Ack> {
        let current = match &self.pending {
            Some(pending) => pending.pg_stat(&self.map, &pgid),
            None => self.map.pg_stat.get(&pgid),
        };
        match current {
            None => return Err(crate::Error::NotFound(format!("pg {}", pgid))),
            Some(stat) if stat.state.contains(PgState::CREATING) => return Ok(Ack::Unchanged),
            Some(_) => {}
        }
        if !self.consensus.is_leader() {
            return Err(self.not_leader());
        }
        let request = self.next_request_id();
        if self.in_flight.is_some() {
            self.waiting.push_back(Queued::ForceCreate { pgid });
            return Ok(Ack::Queued { request });
        }
        self.fold_force_create(pgid, now);
        self.request_proposal(now, true);
        Ok(Ack::Accepted { request })
    }

    fn fold_force_create(&mut self, pgid: PgId, now: Instant) {
        let epoch = self.node_map.epoch;
        let primary = self.node_map.responsible_node(pgid);
        let version = self.map.version + 1;
        tracing::info!(%pgid, epoch, "forcing pg creation");
        self.pending
            .get_or_insert_with(|| Incremental::new(version))
            .update_pg_stat(pgid, PgStat::creating(epoch, primary));
        self.force_propose = true;
        self.mark_pending_dirty(now);
    }

    // === Queries ===

    /// Decode and answer a read-only query (JSON `Query`)
    pub fn handle_query(&self, payload: &[u8]) -> Result<QueryResponse> {
        let query: Query = serde_json::from_slice(payload)?;
        self.answer(&query)
    }

    pub fn answer(&self, query: &Query) -> Result<QueryResponse> {
        let summary = self.map.summary();
        let response = match query {
            Query::PoolStats { pools } => QueryResponse::PoolStats {
                pools: pools
                    .iter()
                    .filter_map(|pool| summary.pool_sum.get(pool).map(|s| (*pool, *s)))
                    .collect(),
            },
            Query::Statfs => QueryResponse::Statfs(StatfsReply {
                kb: summary.node_sum.kb,
                kb_used: summary.node_sum.kb_used,
                kb_avail: summary.node_sum.kb_avail,
                num_objects: summary.pg_sum.num_objects,
            }),
            Query::PgStat => QueryResponse::PgStat(self.pg_stat_summary()),
            Query::PgDump => QueryResponse::PgDump(self.map.clone()),
            Query::PgMap { pgid } => {
                let stat = self
                    .map
                    .pg_stat
                    .get(pgid)
                    .cloned()
                    .ok_or_else(|| crate::Error::NotFound(format!("pg {}", pgid)))?;
                QueryResponse::PgMap { pgid: *pgid, stat }
            }
            Query::NodeStats => QueryResponse::NodeStats {
                nodes: self.map.node_stat.clone(),
            },
            Query::Health => QueryResponse::Health(self.get_health()),
        };
        Ok(response)
    }

    pub fn pg_stat_summary(&self) -> PgStatSummary {
        let summary = self.map.summary();
        PgStatSummary {
            version: self.map.version,
            num_pgs: summary.num_pg,
            by_state: summary
                .num_pg_by_state
                .iter()
                .map(|(state, n)| (state.to_string(), *n))
                .collect(),
            num_objects: summary.pg_sum.num_objects,
            num_bytes: summary.pg_sum.num_bytes,
            kb: summary.node_sum.kb,
            kb_used: summary.node_sum.kb_used,
            kb_avail: summary.node_sum.kb_avail,
            stale_nodes: self.map.stale_nodes.len(),
        }
    }

    /// Health of the committed map plus the state of consensus itself
    pub fn get_health(&self) -> HealthReport {
        let mut report = health::evaluate(&self.map);
        if let Some(err) = &self.consensus_error {
            report.raise(
                HealthStatus::Err,
                format!("committed state could not be applied: {}", err),
            );
        }
        if self.consensus.leader().is_none() {
            report.raise(
                HealthStatus::Warn,
                "no coordinator leader: proposals are not being committed".to_string(),
            );
        }
        report
    }

    fn refresh_gauges(&self) {
        let summary = self.map.summary();
        METRICS.map_version.set(self.map.version);
        METRICS.num_pgs.set(summary.num_pg);
        METRICS.creating_pgs.set(summary.creating_pgs.len() as u64);
        METRICS.stale_nodes.set(self.map.stale_nodes.len() as u64);
    }
}

impl<C: ConsensusParticipant> ReplicatedService for PgMonitor<C> {
    fn create_initial(&mut self) {
        tracing::info!(
            full_ratio = self.config.full_ratio,
            nearfull_ratio = self.config.nearfull_ratio,
            "creating initial pg map"
        );
        self.map = PgMap::default();
        let mut pending = Incremental::new(1);
        pending.set_full_ratio(self.config.full_ratio);
        pending.set_nearfull_ratio(self.config.nearfull_ratio);
        self.pending = Some(pending);
        self.force_propose = true;
    }

    fn update_from_committed(&mut self, payload: &[u8]) -> Result<()> {
        let inc = Incremental::decode(payload)?;
        if inc.version <= self.map.version {
            tracing::debug!(version = inc.version, have = self.map.version, "already applied");
            return Ok(());
        }
        if inc.version != self.map.version + 1 {
            return Err(crate::Error::Consensus(format!(
                "version gap: have {}, committed {}",
                self.map.version, inc.version
            )));
        }
        self.map.apply_incremental(&inc);
        self.consensus_error = None;
        METRICS.commits.inc();
        self.refresh_gauges();
        tracing::info!(version = self.map.version, "applied committed delta");
        Ok(())
    }

    fn load_snapshot(&mut self, payload: &[u8]) -> Result<()> {
        let map = PgMap::decode(payload)?;
        if map.version <= self.map.version {
            tracing::warn!(
                version = map.version,
                have = self.map.version,
                "ignoring snapshot that is not newer than the committed map"
            );
            return Ok(());
        }
        tracing::info!(version = map.version, have = self.map.version, "loaded pg map snapshot");

        // The snapshot owns the version slot of the in-flight delta; whether
        // our stats made it in is unknown, so reporters must resend
        if let Some(covered) = self
            .in_flight
            .take_if(|f| f.delta.version <= map.version)
        {
            tracing::warn!(
                proposal = %covered.proposal,
                version = covered.delta.version,
                "in-flight proposal superseded by snapshot"
            );
            for waiter in &covered.waiters {
                self.throttle.forget_fingerprint(&waiter.node);
            }
        }
        self.map = map;
        self.consensus_error = None;
        self.refresh_gauges();
        Ok(())
    }

    fn create_pending(&mut self) {
        let version = self.map.version + 1;
        self.pending
            .get_or_insert_with(|| Incremental::new(version));
    }

    fn encode_pending(&mut self) -> Result<Vec<u8>> {
        let version = self.map.version + 1;
        let pending = self
            .pending
            .get_or_insert_with(|| Incremental::new(version));
        pending.version = version;
        pending.stamp = Some(Utc::now());
        pending.encode()
    }

    fn on_committed(&mut self, proposal: Option<ProposalId>, now: Instant) {
        if let Some(proposal) = proposal {
            match self.in_flight.take() {
                Some(done) if done.proposal == proposal => {
                    for waiter in done.waiters {
                        self.outbox.push(Outbound::StatsAck {
                            node: waiter.node,
                            request: waiter.request,
                            version: self.map.version,
                            pgs: waiter.pgs,
                        });
                    }
                }
                other => {
                    tracing::warn!(%proposal, "commit for a proposal that is not in flight");
                    self.in_flight = other;
                }
            }
        }

        if let Some(pending) = self.pending.as_mut() {
            pending.version = self.map.version + 1;
        }
        if !self.consensus.is_leader() {
            return;
        }
        self.replay_waiting(now);
        self.register_node_map(now);
        self.send_pg_creates(now);
        self.maybe_propose(now);
    }

    fn on_proposal_lost(&mut self, proposal: ProposalId, now: Instant) {
        let lost = match self.in_flight.take() {
            Some(lost) if lost.proposal == proposal => lost,
            other => {
                self.in_flight = other;
                return;
            }
        };
        METRICS.proposals_lost.inc();
        tracing::warn!(%proposal, version = lost.delta.version, "proposal lost, retrying");

        let mut restored = lost.delta;
        if let Some(newer) = self.pending.take() {
            restored.merge(newer);
        }
        self.pending = Some(restored);
        let mut waiters = lost.waiters;
        waiters.append(&mut self.pending_waiters);
        self.pending_waiters = waiters;
        self.force_propose = true;
        self.mark_pending_dirty(now);

        self.replay_waiting(now);
        self.maybe_propose(now);
    }

    fn on_election_start(&mut self) {
        tracing::info!("election started, resetting node liveness clocks");
        self.throttle.reset_liveness();
    }

    fn on_leadership_changed(&mut self, leader: bool, now: Instant) {
        if leader {
            tracing::info!("became leader");
            self.throttle.reset_liveness();
            self.register_node_map(now);
            self.maybe_propose(now);
        } else {
            tracing::info!(leader = ?self.consensus.leader(), "lost leadership");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ClusterSeed, PoolSeed};
    use crate::coordinator::consensus::ConsensusEvent;
    use crate::coordinator::raft_node::RaftNode;
    use std::time::Duration;

    fn config() -> MonitorConfig {
        MonitorConfig {
            report_timeout_secs: 30,
            pg_create_interval_secs: 10,
            propose_interval_ms: 0,
            ..Default::default()
        }
    }

    fn leader_monitor(now: Instant) -> PgMonitor<RaftNode> {
        let node_map = NodeMap::from_seed(&ClusterSeed {
            nodes: vec!["osd.0".into(), "osd.1".into()],
            pools: vec![PoolSeed { id: 1, pg_num: 2 }],
        });
        let mut raft = RaftNode::new("coord-1".into());
        raft.become_leader();
        let mut monitor = PgMonitor::new(config(), node_map, raft);
        monitor.pump(now).unwrap();
        monitor
    }

    fn report(used: u64) -> NodeReport {
        NodeReport {
            epoch: 1,
            node_stat: NodeStat {
                kb: 1000,
                kb_used: used,
                kb_avail: 1000 - used,
                num_pgs: 1,
            },
            pg_stats: BTreeMap::new(),
        }
    }

    #[test]
    fn test_bootstrap_commits_ratios_and_pgs() {
        let monitor = leader_monitor(Instant::now());
        let map = monitor.map();
        assert!(map.version >= 1);
        assert_eq!(map.full_ratio, 0.95);
        assert_eq!(map.last_pg_scan, 1);
        assert_eq!(map.summary().creating_pgs.len(), 2);
        assert!(monitor.pending().map_or(true, |p| p.is_empty()));
    }

    #[test]
    fn test_malformed_and_unknown_rejected() {
        let now = Instant::now();
        let mut monitor = leader_monitor(now);

        let err = monitor.handle_report("osd.0", b"not json", now).unwrap_err();
        assert!(matches!(err, crate::Error::Malformed(_)));

        let mut bad = report(10);
        bad.node_stat.kb_used = 5000;
        let err = monitor.handle_node_report("osd.0", bad, now).unwrap_err();
        assert!(matches!(err, crate::Error::Malformed(_)));

        let err = monitor
            .handle_node_report("osd.9", report(10), now)
            .unwrap_err();
        assert!(matches!(err, crate::Error::UnknownNode(_)));
        assert!(monitor.throttle().get("osd.9").is_none());
        assert!(monitor.throttle().get("osd.0").is_none());
    }

    #[test]
    fn test_report_while_in_flight_is_queued_then_replayed() {
        let now = Instant::now();
        let mut monitor = leader_monitor(now);
        monitor.consensus_mut().hold_commits(true);

        let first = monitor.handle_node_report("osd.0", report(10), now).unwrap();
        assert!(matches!(first, Ack::Accepted { .. }));
        assert!(monitor.in_flight().is_some());

        let second = monitor.handle_node_report("osd.1", report(20), now).unwrap();
        let Ack::Queued { request } = second else {
            panic!("expected queued ack, got {:?}", second);
        };
        assert_eq!(monitor.queued(), 1);
        // The in-flight delta is frozen
        assert!(!monitor
            .in_flight()
            .unwrap()
            .node_stat_updates
            .contains_key("osd.1"));

        monitor.consensus_mut().hold_commits(false);
        monitor.pump(now).unwrap();

        assert_eq!(monitor.queued(), 0);
        assert_eq!(monitor.map().node_stat["osd.1"].kb_used, 20);
        let acks: Vec<_> = monitor
            .take_outbound()
            .into_iter()
            .filter_map(|m| match m {
                Outbound::StatsAck { request, .. } => Some(request),
                _ => None,
            })
            .collect();
        assert!(acks.contains(&request));
    }

    #[test]
    fn test_lost_proposal_is_retried_with_content() {
        let now = Instant::now();
        let mut monitor = leader_monitor(now);
        monitor.consensus_mut().hold_commits(true);
        monitor.handle_node_report("osd.0", report(10), now).unwrap();
        let version = monitor.map().version;

        // Leadership lost: the proposal never commits
        monitor.consensus_mut().step_down(5, None);
        monitor.pump(now).unwrap();
        assert!(monitor.in_flight().is_none());
        assert!(monitor.pending().unwrap().node_stat_updates.contains_key("osd.0"));
        assert_eq!(monitor.map().version, version);

        // Leadership regained: the same content is proposed again
        monitor.consensus_mut().hold_commits(false);
        monitor.consensus_mut().become_leader();
        monitor.pump(now).unwrap();
        assert_eq!(monitor.map().node_stat["osd.0"].kb_used, 10);
        assert!(monitor.pending().map_or(true, |p| p.is_empty()));
    }

    #[test]
    fn test_follower_rejects_mutation_but_answers_queries() {
        let now = Instant::now();
        let node_map = NodeMap::from_seed(&ClusterSeed {
            nodes: vec!["osd.0".into()],
            pools: vec![],
        });
        let mut raft = RaftNode::new("coord-2".into());
        raft.step_down(1, Some("coord-1".into()));
        let mut monitor = PgMonitor::new(config(), node_map, raft);

        let err = monitor
            .handle_node_report("osd.0", report(10), now)
            .unwrap_err();
        assert!(matches!(err, crate::Error::NotLeader(ref l) if l == "coord-1"));

        let response = monitor.handle_query(br#"{"query":"statfs"}"#).unwrap();
        assert!(matches!(response, QueryResponse::Statfs(_)));
    }

    #[test]
    fn test_config_change_validation() {
        let now = Instant::now();
        let mut monitor = leader_monitor(now);

        assert!(monitor.on_config_change("full_ratio", "1.5", now).is_err());
        assert!(monitor.on_config_change("full_ratio", "abc", now).is_err());
        assert!(monitor.on_config_change("bogus", "0.5", now).is_err());
        assert_eq!(
            monitor.on_config_change("full_ratio", "0", now).unwrap(),
            Ack::Unchanged
        );

        monitor
            .on_config_change("mon_osd_nearfull_ratio", "0.8", now)
            .unwrap();
        monitor.pump(now).unwrap();
        assert_eq!(monitor.map().nearfull_ratio, 0.8);
        assert_eq!(monitor.map().full_ratio, 0.95);
    }

    #[test]
    fn test_force_create_pg() {
        let now = Instant::now();
        let mut monitor = leader_monitor(now);
        let pgid = PgId::new(1, 0);

        // Already creating after bootstrap
        let ack = monitor
            .handle_command(br#"{"command":"force_create_pg","pgid":"1.0"}"#, now)
            .unwrap();
        assert_eq!(ack, Ack::Unchanged);

        let err = monitor
            .run_command(
                Command::ForceCreatePg {
                    pgid: PgId::new(7, 0),
                },
                now,
            )
            .unwrap_err();
        assert!(matches!(err, crate::Error::NotFound(_)));

        // Primary reports the PG active, then an operator forces re-creation
        let mut active = report(10);
        active.pg_stats.insert(
            pgid,
            PgStat {
                state: PgState::ACTIVE | PgState::CLEAN,
                reported_epoch: 1,
                ..Default::default()
            },
        );
        monitor.handle_node_report("osd.0", active, now).unwrap();
        monitor.pump(now).unwrap();
        assert!(!monitor.map().summary().creating_pgs.contains(&pgid));

        let ack = monitor
            .run_command(Command::ForceCreatePg { pgid }, now)
            .unwrap();
        assert!(matches!(ack, Ack::Accepted { .. }));
        monitor.pump(now).unwrap();
        assert!(monitor.map().summary().creating_pgs.contains(&pgid));
    }

    #[test]
    fn test_batching_window_defers_proposal() {
        let now = Instant::now();
        let mut monitor = leader_monitor(now);
        monitor.config.propose_interval_ms = 1_000;

        // Accepted into the pending delta before any proposal goes out
        let ack = monitor.handle_node_report("osd.0", report(10), now).unwrap();
        assert!(matches!(ack, Ack::Accepted { .. }));
        monitor.handle_node_report("osd.1", report(20), now).unwrap();
        assert!(monitor.in_flight().is_none());
        assert_eq!(monitor.pending().unwrap().node_stat_updates.len(), 2);

        monitor.tick(now + Duration::from_millis(500));
        assert!(monitor.in_flight().is_none());

        monitor.tick(now + Duration::from_millis(1_000));
        let delta = monitor.in_flight().unwrap();
        assert_eq!(delta.node_stat_updates.len(), 2);
    }

    #[test]
    fn test_queries() {
        let now = Instant::now();
        let mut monitor = leader_monitor(now);
        monitor.handle_node_report("osd.0", report(250), now).unwrap();
        monitor.pump(now).unwrap();

        match monitor.answer(&Query::PoolStats { pools: vec![1, 42] }).unwrap() {
            QueryResponse::PoolStats { pools } => {
                assert_eq!(pools.len(), 1);
                assert_eq!(pools[&1].num_pgs, 2);
            }
            other => panic!("unexpected response {:?}", other),
        }
        match monitor.answer(&Query::Statfs).unwrap() {
            QueryResponse::Statfs(reply) => assert_eq!(reply.kb_used, 250),
            other => panic!("unexpected response {:?}", other),
        }
        match monitor.answer(&Query::PgStat).unwrap() {
            QueryResponse::PgStat(summary) => {
                assert_eq!(summary.num_pgs, 2);
                assert_eq!(summary.by_state.get("creating"), Some(&2));
            }
            other => panic!("unexpected response {:?}", other),
        }
        let err = monitor
            .answer(&Query::PgMap {
                pgid: PgId::new(9, 9),
            })
            .unwrap_err();
        assert!(matches!(err, crate::Error::NotFound(_)));
        assert!(monitor.handle_query(b"{}").is_err());
    }

    #[test]
    fn test_timeouts_wait_for_in_flight_commit() {
        let t0 = Instant::now();
        let late = t0 + Duration::from_secs(31);
        let mut monitor = leader_monitor(t0);
        monitor.handle_node_report("osd.0", report(10), t0).unwrap();
        monitor.pump(t0).unwrap();

        monitor.consensus_mut().hold_commits(true);
        monitor.handle_node_report("osd.1", report(20), t0).unwrap();
        assert!(monitor.in_flight().is_some());

        monitor.tick(late);
        assert!(monitor.map().stale_nodes.is_empty());
        assert!(monitor.pending().map_or(true, |p| p.stale_add.is_empty()));

        monitor.consensus_mut().hold_commits(false);
        monitor.pump(late).unwrap();
        monitor.tick(late);
        monitor.pump(late).unwrap();
        assert!(monitor.map().stale_nodes.contains("osd.0"));
    }

    fn snapshot(map: &PgMap) -> Vec<ConsensusEvent> {
        vec![ConsensusEvent::Snapshot {
            index: map.version,
            payload: map.encode().unwrap(),
        }]
    }

    #[test]
    fn test_older_snapshot_is_ignored() {
        let now = Instant::now();
        let mut monitor = leader_monitor(now);
        monitor.handle_node_report("osd.0", report(10), now).unwrap();
        monitor.pump(now).unwrap();
        let before = monitor.map().clone();
        assert!(before.version >= 2);

        dispatch(&mut monitor, snapshot(&PgMap::default()), now).unwrap();
        assert_eq!(monitor.map(), &before);

        dispatch(&mut monitor, snapshot(&before), now).unwrap();
        assert_eq!(monitor.map(), &before);
    }

    #[test]
    fn test_newer_snapshot_replaces_map() {
        let now = Instant::now();
        let mut monitor = leader_monitor(now);

        let mut newer = monitor.map().clone();
        newer.version += 3;
        newer.node_stat.insert(
            "osd.1".into(),
            NodeStat {
                kb: 1000,
                kb_used: 500,
                kb_avail: 500,
                num_pgs: 0,
            },
        );
        newer.recompute();

        dispatch(&mut monitor, snapshot(&newer), now).unwrap();
        assert_eq!(monitor.map().version, newer.version);
        assert_eq!(monitor.map().summary().node_sum.kb_used, 500);

        // Later deltas build on the snapshot version
        monitor.handle_node_report("osd.0", report(10), now).unwrap();
        monitor.pump(now).unwrap();
        assert_eq!(monitor.map().version, newer.version + 1);
        assert_eq!(monitor.map().summary().node_sum.kb_used, 510);
    }

    #[test]
    fn test_snapshot_covering_in_flight_proposal() {
        let now = Instant::now();
        let mut monitor = leader_monitor(now);
        monitor.consensus_mut().hold_commits(true);

        monitor.handle_node_report("osd.0", report(10), now).unwrap();
        let in_flight_version = monitor.in_flight().unwrap().version;

        let mut newer = monitor.map().clone();
        newer.version = in_flight_version;
        dispatch(&mut monitor, snapshot(&newer), now).unwrap();

        assert!(monitor.in_flight().is_none());
        assert_eq!(monitor.map().version, in_flight_version);

        // The same report is folded again instead of being treated as a duplicate
        let ack = monitor.handle_node_report("osd.0", report(10), now).unwrap();
        assert!(matches!(ack, Ack::Accepted { .. }));
        assert_eq!(monitor.in_flight().unwrap().version, in_flight_version + 1);

        monitor.consensus_mut().hold_commits(false);
        monitor.pump(now).unwrap();
        assert_eq!(monitor.map().version, in_flight_version + 1);
        assert_eq!(monitor.map().node_stat["osd.0"].kb_used, 10);
    }
}

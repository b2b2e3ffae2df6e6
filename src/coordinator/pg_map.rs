//! PG map: committed placement-group state and its incremental deltas
//!
//! `PgMap` is the quorum-agreed snapshot. `Incremental` is a sparse delta
//! against it, folded last-writer-wins per key while requests arrive and
//! applied as a whole once consensus commits it. Aggregates live in
//! `PgMapSummary` and are recomputed by a full scan after every apply, so
//! re-applying a delta never double counts.

use crate::common::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub type NodeId = String;

/// Fallback ratios for a map that has never seen a configured value
pub const DEFAULT_FULL_RATIO: f32 = 0.95;
pub const DEFAULT_NEARFULL_RATIO: f32 = 0.85;

/// Placement group identifier: pool and seed, printed as `pool.seed_hex`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PgId {
    pub pool: u64,
    pub seed: u32,
}

impl PgId {
    pub fn new(pool: u64, seed: u32) -> Self {
        Self { pool, seed }
    }
}

impl fmt::Display for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:x}", self.pool, self.seed)
    }
}

impl FromStr for PgId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (pool, seed) = s
            .split_once('.')
            .ok_or_else(|| crate::Error::Malformed(format!("invalid pgid: {}", s)))?;
        let pool = pool
            .parse()
            .map_err(|_| crate::Error::Malformed(format!("invalid pool in pgid: {}", s)))?;
        let seed = u32::from_str_radix(seed, 16)
            .map_err(|_| crate::Error::Malformed(format!("invalid seed in pgid: {}", s)))?;
        Ok(Self { pool, seed })
    }
}

// String form so PG ids can key JSON objects in dumps.
impl Serialize for PgId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PgId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// PG state flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PgState(u32);

impl PgState {
    pub const CREATING: PgState = PgState(1 << 0);
    pub const ACTIVE: PgState = PgState(1 << 1);
    pub const CLEAN: PgState = PgState(1 << 2);
    pub const DOWN: PgState = PgState(1 << 3);
    pub const PEERING: PgState = PgState(1 << 4);
    pub const DEGRADED: PgState = PgState(1 << 5);
    pub const INCONSISTENT: PgState = PgState(1 << 6);
    pub const STALE: PgState = PgState(1 << 7);

    const NAMES: [(PgState, &'static str); 8] = [
        (PgState::CREATING, "creating"),
        (PgState::ACTIVE, "active"),
        (PgState::CLEAN, "clean"),
        (PgState::DOWN, "down"),
        (PgState::PEERING, "peering"),
        (PgState::DEGRADED, "degraded"),
        (PgState::INCONSISTENT, "inconsistent"),
        (PgState::STALE, "stale"),
    ];

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: PgState) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PgState) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PgState) {
        self.0 &= !other.0;
    }

    /// Every flag this crate knows about
    pub fn is_known(&self) -> bool {
        let known = Self::NAMES.iter().fold(0, |acc, (flag, _)| acc | flag.0);
        self.0 & !known == 0
    }

    pub fn parse_name(name: &str) -> Option<PgState> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(flag, _)| *flag)
    }
}

impl std::ops::BitOr for PgState {
    type Output = PgState;

    fn bitor(self, rhs: PgState) -> PgState {
        PgState(self.0 | rhs.0)
    }
}

impl fmt::Display for PgState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "unknown")
        } else {
            write!(f, "{}", names.join("+"))
        }
    }
}

/// Statistics of one PG as last reported by its primary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgStat {
    pub state: PgState,
    /// Node map epoch the reporting node had when it produced this stat
    pub reported_epoch: u64,
    #[serde(default)]
    pub created_epoch: u64,
    #[serde(default)]
    pub acting: Vec<NodeId>,
    #[serde(default)]
    pub primary: Option<NodeId>,
    #[serde(default)]
    pub num_objects: u64,
    #[serde(default)]
    pub num_objects_degraded: u64,
    #[serde(default)]
    pub num_objects_unfound: u64,
    #[serde(default)]
    pub num_bytes: u64,
}

impl PgStat {
    /// A freshly registered PG waiting for its node to create it
    pub fn creating(epoch: u64, primary: Option<NodeId>) -> Self {
        Self {
            state: PgState::CREATING,
            reported_epoch: epoch,
            created_epoch: epoch,
            primary,
            ..Default::default()
        }
    }
}

/// Usage statistics of one storage node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStat {
    pub kb: u64,
    pub kb_used: u64,
    pub kb_avail: u64,
    #[serde(default)]
    pub num_pgs: u32,
}

impl NodeStat {
    pub fn usage_ratio(&self) -> f32 {
        if self.kb == 0 {
            0.0
        } else {
            self.kb_used as f32 / self.kb as f32
        }
    }

    fn add(&mut self, other: &NodeStat) {
        self.kb += other.kb;
        self.kb_used += other.kb_used;
        self.kb_avail += other.kb_avail;
        self.num_pgs += other.num_pgs;
    }
}

/// Object counts summed over a set of PGs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStat {
    pub num_pgs: u64,
    pub num_objects: u64,
    pub num_objects_degraded: u64,
    pub num_objects_unfound: u64,
    pub num_bytes: u64,
}

impl PoolStat {
    fn add(&mut self, stat: &PgStat) {
        self.num_pgs += 1;
        self.num_objects += stat.num_objects;
        self.num_objects_degraded += stat.num_objects_degraded;
        self.num_objects_unfound += stat.num_objects_unfound;
        self.num_bytes += stat.num_bytes;
    }
}

/// Aggregates derived from a full scan of the map; never encoded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PgMapSummary {
    pub num_pg: u64,
    pub num_pg_by_state: BTreeMap<PgState, u64>,
    pub pg_sum: PoolStat,
    pub pool_sum: BTreeMap<u64, PoolStat>,
    pub node_sum: NodeStat,
    pub creating_pgs: BTreeSet<PgId>,
    pub full_nodes: BTreeSet<NodeId>,
    pub nearfull_nodes: BTreeSet<NodeId>,
}

impl PgMapSummary {
    /// Number of PGs with `flag` set, whatever else they carry
    pub fn pgs_with(&self, flag: PgState) -> u64 {
        self.num_pg_by_state
            .iter()
            .filter(|(state, _)| state.contains(flag))
            .map(|(_, n)| *n)
            .sum()
    }
}

/// The committed PG map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PgMap {
    pub version: u64,
    pub stamp: Option<DateTime<Utc>>,
    pub last_node_map_epoch: u64,
    pub last_pg_scan: u64,
    pub full_ratio: f32,
    pub nearfull_ratio: f32,
    pub pg_stat: BTreeMap<PgId, PgStat>,
    pub node_stat: BTreeMap<NodeId, NodeStat>,
    pub stale_nodes: BTreeSet<NodeId>,
    #[serde(skip)]
    summary: PgMapSummary,
}

impl Default for PgMap {
    fn default() -> Self {
        Self::new(DEFAULT_FULL_RATIO, DEFAULT_NEARFULL_RATIO)
    }
}

impl PgMap {
    pub fn new(full_ratio: f32, nearfull_ratio: f32) -> Self {
        Self {
            version: 0,
            stamp: None,
            last_node_map_epoch: 0,
            last_pg_scan: 0,
            full_ratio,
            nearfull_ratio,
            pg_stat: BTreeMap::new(),
            node_stat: BTreeMap::new(),
            stale_nodes: BTreeSet::new(),
            summary: PgMapSummary::default(),
        }
    }

    pub fn summary(&self) -> &PgMapSummary {
        &self.summary
    }

    /// Apply a committed delta as a whole, then rebuild the aggregates.
    ///
    /// Re-applying the same delta leaves the map unchanged.
    pub fn apply_incremental(&mut self, inc: &Incremental) {
        self.version = inc.version;
        if inc.stamp.is_some() {
            self.stamp = inc.stamp;
        }

        for (pgid, stat) in &inc.pg_stat_updates {
            self.pg_stat.insert(*pgid, stat.clone());
        }
        for pgid in &inc.pg_remove {
            self.pg_stat.remove(pgid);
        }
        for (node, stat) in &inc.node_stat_updates {
            self.node_stat.insert(node.clone(), *stat);
        }
        for node in &inc.node_stat_rm {
            self.node_stat.remove(node);
        }
        for node in &inc.stale_clear {
            self.stale_nodes.remove(node);
        }
        for node in &inc.stale_add {
            self.stale_nodes.insert(node.clone());
        }

        if let Some(epoch) = inc.node_map_epoch {
            self.last_node_map_epoch = epoch;
        }
        if let Some(epoch) = inc.pg_scan_epoch {
            self.last_pg_scan = epoch;
        }
        if let Some(ratio) = inc.full_ratio.filter(|r| *r > 0.0) {
            self.full_ratio = ratio;
        }
        if let Some(ratio) = inc.nearfull_ratio.filter(|r| *r > 0.0) {
            self.nearfull_ratio = ratio;
        }

        self.refresh_stale_flags();
        self.recompute();
    }

    /// A PG is stale exactly when its primary is a stale node
    fn refresh_stale_flags(&mut self) {
        let stale_nodes = &self.stale_nodes;
        for stat in self.pg_stat.values_mut() {
            let stale = stat
                .primary
                .as_ref()
                .is_some_and(|p| stale_nodes.contains(p));
            if stale {
                stat.state.insert(PgState::STALE);
            } else {
                stat.state.remove(PgState::STALE);
            }
        }
    }

    /// Rebuild every aggregate from scratch
    pub fn recompute(&mut self) {
        let mut summary = PgMapSummary::default();

        for (pgid, stat) in &self.pg_stat {
            summary.num_pg += 1;
            *summary.num_pg_by_state.entry(stat.state).or_insert(0) += 1;
            summary.pg_sum.add(stat);
            summary.pool_sum.entry(pgid.pool).or_default().add(stat);
            if stat.state.contains(PgState::CREATING) {
                summary.creating_pgs.insert(*pgid);
            }
        }

        for (node, stat) in &self.node_stat {
            summary.node_sum.add(stat);
            let ratio = stat.usage_ratio();
            if ratio >= self.full_ratio {
                summary.full_nodes.insert(node.clone());
            } else if ratio >= self.nearfull_ratio {
                summary.nearfull_nodes.insert(node.clone());
            }
        }

        self.summary = summary;
    }

    /// PGs whose primary is `node`
    pub fn pgs_of_node<'a>(&'a self, node: &'a str) -> impl Iterator<Item = PgId> + 'a {
        self.pg_stat
            .iter()
            .filter(move |(_, stat)| stat.primary.as_deref() == Some(node))
            .map(|(pgid, _)| *pgid)
    }

    /// Full-map payload for consensus snapshots
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut map: PgMap = bincode::deserialize(bytes)
            .map_err(|e| crate::Error::MapCorrupted(e.to_string()))?;
        map.recompute();
        Ok(map)
    }
}

/// Sparse delta against a `PgMap`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Incremental {
    pub version: u64,
    pub stamp: Option<DateTime<Utc>>,
    pub pg_stat_updates: BTreeMap<PgId, PgStat>,
    pub pg_remove: BTreeSet<PgId>,
    pub node_stat_updates: BTreeMap<NodeId, NodeStat>,
    pub node_stat_rm: BTreeSet<NodeId>,
    pub stale_add: BTreeSet<NodeId>,
    pub stale_clear: BTreeSet<NodeId>,
    pub node_map_epoch: Option<u64>,
    pub pg_scan_epoch: Option<u64>,
    pub full_ratio: Option<f32>,
    pub nearfull_ratio: Option<f32>,
}

impl Incremental {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }

    /// Nothing to propose (version and stamp do not count)
    pub fn is_empty(&self) -> bool {
        self.pg_stat_updates.is_empty()
            && self.pg_remove.is_empty()
            && self.node_stat_updates.is_empty()
            && self.node_stat_rm.is_empty()
            && self.stale_add.is_empty()
            && self.stale_clear.is_empty()
            && self.node_map_epoch.is_none()
            && self.pg_scan_epoch.is_none()
            && self.full_ratio.is_none()
            && self.nearfull_ratio.is_none()
    }

    pub fn update_pg_stat(&mut self, pgid: PgId, stat: PgStat) {
        self.pg_remove.remove(&pgid);
        self.pg_stat_updates.insert(pgid, stat);
    }

    pub fn remove_pg(&mut self, pgid: PgId) {
        self.pg_stat_updates.remove(&pgid);
        self.pg_remove.insert(pgid);
    }

    pub fn update_node_stat(&mut self, node: &str, stat: NodeStat) {
        self.node_stat_rm.remove(node);
        self.node_stat_updates.insert(node.to_string(), stat);
    }

    pub fn remove_node_stat(&mut self, node: &str) {
        self.node_stat_updates.remove(node);
        self.node_stat_rm.insert(node.to_string());
    }

    pub fn mark_stale(&mut self, node: &str) {
        self.stale_clear.remove(node);
        self.stale_add.insert(node.to_string());
    }

    pub fn clear_stale(&mut self, node: &str) {
        self.stale_add.remove(node);
        self.stale_clear.insert(node.to_string());
    }

    /// Zero means "no change requested"; returns whether anything was set
    pub fn set_full_ratio(&mut self, ratio: f32) -> bool {
        if ratio == 0.0 {
            return false;
        }
        self.full_ratio = Some(ratio);
        true
    }

    /// Zero means "no change requested"; returns whether anything was set
    pub fn set_nearfull_ratio(&mut self, ratio: f32) -> bool {
        if ratio == 0.0 {
            return false;
        }
        self.nearfull_ratio = Some(ratio);
        true
    }

    /// PG stat as this delta would leave it, falling back to `base`
    pub fn pg_stat<'a>(&'a self, base: &'a PgMap, pgid: &PgId) -> Option<&'a PgStat> {
        if self.pg_remove.contains(pgid) {
            return None;
        }
        self.pg_stat_updates
            .get(pgid)
            .or_else(|| base.pg_stat.get(pgid))
    }

    /// Fold a later delta into this one, last writer wins per key and field
    pub fn merge(&mut self, later: Incremental) {
        self.version = self.version.max(later.version);
        if later.stamp.is_some() {
            self.stamp = later.stamp;
        }
        for (pgid, stat) in later.pg_stat_updates {
            self.update_pg_stat(pgid, stat);
        }
        for pgid in later.pg_remove {
            self.remove_pg(pgid);
        }
        for (node, stat) in later.node_stat_updates {
            self.update_node_stat(&node, stat);
        }
        for node in later.node_stat_rm {
            self.remove_node_stat(&node);
        }
        for node in later.stale_add {
            self.mark_stale(&node);
        }
        for node in later.stale_clear {
            self.clear_stale(&node);
        }
        if later.node_map_epoch.is_some() {
            self.node_map_epoch = later.node_map_epoch;
        }
        if later.pg_scan_epoch.is_some() {
            self.pg_scan_epoch = later.pg_scan_epoch;
        }
        if let Some(ratio) = later.full_ratio {
            self.set_full_ratio(ratio);
        }
        if let Some(ratio) = later.nearfull_ratio {
            self.set_nearfull_ratio(ratio);
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| crate::Error::MapCorrupted(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_clean(primary: &str, objects: u64) -> PgStat {
        PgStat {
            state: PgState::ACTIVE | PgState::CLEAN,
            reported_epoch: 1,
            acting: vec![primary.to_string()],
            primary: Some(primary.to_string()),
            num_objects: objects,
            num_bytes: objects * 4096,
            ..Default::default()
        }
    }

    #[test]
    fn test_pgid_display_and_parse() {
        let pgid = PgId::new(3, 0x1f);
        assert_eq!(pgid.to_string(), "3.1f");
        assert_eq!("3.1f".parse::<PgId>().unwrap(), pgid);
        assert!("3".parse::<PgId>().is_err());
        assert!("x.1".parse::<PgId>().is_err());
    }

    #[test]
    fn test_pg_state_display() {
        assert_eq!((PgState::ACTIVE | PgState::CLEAN).to_string(), "active+clean");
        assert_eq!(PgState::default().to_string(), "unknown");
        assert_eq!(PgState::parse_name("stale"), Some(PgState::STALE));
        assert!(!PgState(1 << 20).is_known());
    }

    #[test]
    fn test_apply_recomputes_summary() {
        let mut map = PgMap::default();
        let mut inc = Incremental::new(1);
        inc.update_pg_stat(PgId::new(1, 0), active_clean("osd.0", 10));
        inc.update_pg_stat(PgId::new(1, 1), PgStat::creating(1, Some("osd.1".into())));
        inc.update_node_stat(
            "osd.0",
            NodeStat {
                kb: 100,
                kb_used: 96,
                kb_avail: 4,
                num_pgs: 1,
            },
        );
        map.apply_incremental(&inc);

        let summary = map.summary();
        assert_eq!(map.version, 1);
        assert_eq!(summary.num_pg, 2);
        assert_eq!(summary.pg_sum.num_objects, 10);
        assert_eq!(summary.pool_sum[&1].num_pgs, 2);
        assert!(summary.creating_pgs.contains(&PgId::new(1, 1)));
        assert!(summary.full_nodes.contains("osd.0"));
        assert_eq!(summary.pgs_with(PgState::ACTIVE), 1);
    }

    #[test]
    fn test_reapply_is_idempotent() {
        let mut inc = Incremental::new(1);
        inc.update_pg_stat(PgId::new(1, 0), active_clean("osd.0", 10));
        inc.update_node_stat(
            "osd.0",
            NodeStat {
                kb: 100,
                kb_used: 10,
                kb_avail: 90,
                num_pgs: 1,
            },
        );

        let mut once = PgMap::default();
        once.apply_incremental(&inc);
        let mut twice = once.clone();
        twice.apply_incremental(&inc);

        assert_eq!(once, twice);
        assert_eq!(twice.summary().pg_sum.num_objects, 10);
        assert_eq!(twice.summary().node_sum.kb_used, 10);
    }

    #[test]
    fn test_stale_flag_follows_primary() {
        let mut map = PgMap::default();
        let mut inc = Incremental::new(1);
        inc.update_pg_stat(PgId::new(1, 0), active_clean("osd.0", 1));
        inc.update_pg_stat(PgId::new(1, 1), active_clean("osd.1", 1));
        inc.mark_stale("osd.0");
        map.apply_incremental(&inc);

        assert!(map.pg_stat[&PgId::new(1, 0)].state.contains(PgState::STALE));
        assert!(!map.pg_stat[&PgId::new(1, 1)].state.contains(PgState::STALE));
        // Stats survive the stale flag
        assert_eq!(map.pg_stat[&PgId::new(1, 0)].num_objects, 1);

        let mut inc = Incremental::new(2);
        inc.clear_stale("osd.0");
        map.apply_incremental(&inc);
        assert!(!map.pg_stat[&PgId::new(1, 0)].state.contains(PgState::STALE));
        assert!(map.stale_nodes.is_empty());
    }

    #[test]
    fn test_zero_ratio_is_no_change() {
        let mut inc = Incremental::new(1);
        assert!(!inc.set_full_ratio(0.0));
        assert!(inc.is_empty());
        assert!(inc.set_nearfull_ratio(0.8));

        let mut map = PgMap::default();
        map.apply_incremental(&inc);
        assert_eq!(map.full_ratio, DEFAULT_FULL_RATIO);
        assert_eq!(map.nearfull_ratio, 0.8);
    }

    #[test]
    fn test_merge_is_last_writer_wins() {
        let pgid = PgId::new(1, 0);
        let mut first = Incremental::new(1);
        first.update_pg_stat(pgid, active_clean("osd.0", 1));
        first.mark_stale("osd.2");

        let mut second = Incremental::new(1);
        second.update_pg_stat(pgid, active_clean("osd.0", 7));
        second.remove_pg(PgId::new(1, 1));
        second.clear_stale("osd.2");

        first.merge(second);
        assert_eq!(first.pg_stat_updates[&pgid].num_objects, 7);
        assert!(first.pg_remove.contains(&PgId::new(1, 1)));
        assert!(first.stale_add.is_empty());
        assert!(first.stale_clear.contains("osd.2"));
    }

    #[test]
    fn test_decode_rebuilds_summary() {
        let mut map = PgMap::default();
        let mut inc = Incremental::new(4);
        inc.update_pg_stat(PgId::new(2, 3), active_clean("osd.0", 5));
        map.apply_incremental(&inc);

        let decoded = PgMap::decode(&map.encode().unwrap()).unwrap();
        assert_eq!(decoded, map);
        assert_eq!(decoded.summary().num_pg, 1);

        let inc_decoded = Incremental::decode(&inc.encode().unwrap()).unwrap();
        assert_eq!(inc_decoded, inc);
        assert!(PgMap::decode(b"garbage").is_err());
    }
}

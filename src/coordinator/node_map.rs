//! Node map: the externally supplied view of storage nodes and pools
//!
//! The monitor does not own membership. It consumes the current node map to
//! decide which nodes may report, which PGs should exist and which node is
//! responsible for creating a PG.

use crate::common::{select_primary, ClusterSeed};
use crate::coordinator::pg_map::{NodeId, PgId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Storage node membership state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Up,
    Down,
    Decommissioned,
}

impl NodeState {
    /// Can this node still send usage reports?
    pub fn can_report(&self) -> bool {
        matches!(self, NodeState::Up | NodeState::Down)
    }

    /// Can this node be made responsible for new PGs?
    pub fn is_up(&self) -> bool {
        matches!(self, NodeState::Up)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Up => write!(f, "up"),
            NodeState::Down => write!(f, "down"),
            NodeState::Decommissioned => write!(f, "decommissioned"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub pg_num: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMap {
    pub epoch: u64,
    pub nodes: BTreeMap<NodeId, NodeState>,
    pub pools: BTreeMap<u64, PoolInfo>,
}

impl NodeMap {
    /// Build epoch 1 from the configured seed: every node up
    pub fn from_seed(seed: &ClusterSeed) -> Self {
        Self {
            epoch: 1,
            nodes: seed
                .nodes
                .iter()
                .map(|n| (n.clone(), NodeState::Up))
                .collect(),
            pools: seed
                .pools
                .iter()
                .map(|p| (p.id, PoolInfo { pg_num: p.pg_num }))
                .collect(),
        }
    }

    pub fn state(&self, node: &str) -> Option<NodeState> {
        self.nodes.get(node).copied()
    }

    /// Known and not decommissioned
    pub fn is_recognized(&self, node: &str) -> bool {
        self.state(node).is_some_and(|s| s.can_report())
    }

    pub fn up_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, state)| state.is_up())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn has_pool(&self, pool: u64) -> bool {
        self.pools.contains_key(&pool)
    }

    /// Every PG the pools of this map define
    pub fn expected_pgs(&self) -> impl Iterator<Item = PgId> + '_ {
        self.pools
            .iter()
            .flat_map(|(pool, info)| (0..info.pg_num).map(move |seed| PgId::new(*pool, seed)))
    }

    /// Node that must create `pgid`, chosen among up nodes
    pub fn responsible_node(&self, pgid: PgId) -> Option<NodeId> {
        select_primary(&pgid.to_string(), &self.up_nodes())
    }
}

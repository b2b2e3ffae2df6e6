//! Coordinator implementation
//!
//! The coordinator is responsible for:
//! - The committed PG map and its incremental deltas
//! - Classifying node reports and batching mutations into proposals
//! - Node liveness and PG creation throttling
//! - Cluster health
//! - Consensus via the replicated-service hooks

pub mod consensus;
pub mod health;
pub mod http;
pub mod monitor;
pub mod node_map;
pub mod pg_map;
pub mod raft_node;
pub mod ratios;
pub mod server;
pub mod throttle;

pub use consensus::{ConsensusEvent, ConsensusParticipant, ProposalId, ReplicatedService};
pub use health::{HealthReport, HealthStatus};
pub use monitor::{Ack, Command, NodeReport, Outbound, PgMonitor, Query, QueryResponse, RequestId};
pub use node_map::{NodeMap, NodeState};
pub use pg_map::{Incremental, NodeId, NodeStat, PgId, PgMap, PgStat, PgState};
pub use raft_node::RaftNode;
pub use server::{Coordinator, MonitorHandle, MonitorService};

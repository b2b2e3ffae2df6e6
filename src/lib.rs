//! # pgmon
//!
//! A placement-group monitor for a replicated object-storage cluster:
//! - A quorum-committed PG map updated through incremental deltas
//! - Report classification: unchanged reports never reach consensus
//! - Node liveness tracking and throttled PG creation requests
//! - Cluster health derived from the committed map
//! - Live capacity thresholds (full / near-full ratios)
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!  storage nodes ──report──▶ ┌──────────────────────────────┐
//!                            │ PgMonitor (single writer)    │
//!  operators ──query/cmd───▶ │  committed PgMap             │
//!                            │  pending Incremental ──┐     │
//!                            │  in-flight proposal ◀──┘     │
//!                            └──────────┬───────────────────┘
//!                                       │ propose / poll
//!                            ┌──────────▼───────────────────┐
//!                            │ ConsensusParticipant (Raft)  │
//!                            └──────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a coordinator
//! ```bash
//! pgmon-coord serve \
//!   --id coord-1 \
//!   --bind 0.0.0.0:6800 \
//!   --config ./pgmon.toml
//! ```
//!
//! ### Use the CLI
//! ```bash
//! # Cluster health
//! pgmon health --coordinator http://localhost:6800
//!
//! # PG summary and full dump
//! pgmon pg stat
//! pgmon pg dump
//!
//! # Capacity thresholds
//! pgmon set-full-ratio 0.9
//! pgmon set-nearfull-ratio 0.8
//! ```

pub mod common;
pub mod coordinator;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{Coordinator, PgMonitor};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");

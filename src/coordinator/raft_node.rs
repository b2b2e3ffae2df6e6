//! In-memory Raft participant
//!
//! Keeps a replicated log in memory and reports commits through `poll`.
//! Quorum is simulated: a leader commits everything it has appended unless
//! commits are held, which lets callers keep a proposal in flight. Followers
//! learn entries through `handle_append_entries`.

use crate::common::raft::{AppendRequest, AppendResponse, LogEntry};
use crate::common::Result;
use crate::coordinator::consensus::{ConsensusEvent, ConsensusParticipant, ProposalId};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

pub struct RaftNode {
    node_id: String,
    role: RaftRole,
    term: u64,
    leader_id: Option<String>,
    log: Vec<LogEntry>,
    commit_index: u64,
    /// Last index already reported through `poll`
    delivered_index: u64,
    /// Log index → proposal made on this node
    own: BTreeMap<u64, ProposalId>,
    next_proposal: u64,
    hold_commits: bool,
    events: Vec<ConsensusEvent>,
}

impl RaftNode {
    pub fn new(node_id: String) -> Self {
        Self {
            node_id,
            role: RaftRole::Follower,
            term: 0,
            leader_id: None,
            log: Vec::new(),
            commit_index: 0,
            delivered_index: 0,
            own: BTreeMap::new(),
            next_proposal: 1,
            hold_commits: false,
            events: Vec::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn get_role(&self) -> RaftRole {
        self.role
    }

    pub fn get_term(&self) -> u64 {
        self.term
    }

    pub fn get_log(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    /// Keep appended entries uncommitted until released
    pub fn hold_commits(&mut self, hold: bool) {
        self.hold_commits = hold;
    }

    /// Become leader (single-node clusters and tests)
    pub fn become_leader(&mut self) {
        if self.role == RaftRole::Leader {
            return;
        }
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.node_id.clone());
        self.events.push(ConsensusEvent::LeadershipChanged { leader: true });
    }

    /// Start election
    pub fn start_election(&mut self) -> u64 {
        self.term += 1;
        self.role = RaftRole::Candidate;
        self.leader_id = None;
        self.events.push(ConsensusEvent::ElectionStarted);
        self.term
    }

    /// Step down to follower. Uncommitted entries are dropped and local
    /// proposals among them are reported lost.
    pub fn step_down(&mut self, new_term: u64, leader_id: Option<String>) {
        let was_leader = self.role == RaftRole::Leader;
        self.role = RaftRole::Follower;
        self.term = self.term.max(new_term);
        self.leader_id = leader_id;
        self.truncate_uncommitted();
        if was_leader {
            self.events
                .push(ConsensusEvent::LeadershipChanged { leader: false });
        }
    }

    fn truncate_uncommitted(&mut self) {
        let lost: Vec<u64> = self
            .own
            .range(self.commit_index + 1..)
            .map(|(index, _)| *index)
            .collect();
        for index in lost {
            if let Some(proposal) = self.own.remove(&index) {
                tracing::info!(node = %self.node_id, index, %proposal, "proposal lost");
                self.events.push(ConsensusEvent::ProposalLost(proposal));
            }
        }
        self.log.truncate(self.commit_index as usize);
    }

    /// Build the request that ships entries after `prev_log_index`
    pub fn append_request(&self, prev_log_index: u64) -> AppendRequest {
        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            self.log
                .get(prev_log_index as usize - 1)
                .map(|e| e.term)
                .unwrap_or(0)
        };
        AppendRequest {
            term: self.term,
            leader_id: self.node_id.clone(),
            prev_log_index,
            prev_log_term,
            entries: self
                .log
                .iter()
                .skip(prev_log_index as usize)
                .cloned()
                .collect(),
            leader_commit: self.commit_index,
        }
    }

    /// Follower side of log replication
    pub fn handle_append_entries(&mut self, req: AppendRequest) -> AppendResponse {
        if req.term < self.term {
            return AppendResponse {
                term: self.term,
                success: false,
                conflict_index: 0,
            };
        }
        if req.term > self.term || self.role != RaftRole::Follower {
            self.step_down(req.term, Some(req.leader_id.clone()));
        }
        self.leader_id = Some(req.leader_id.clone());

        let prev = req.prev_log_index as usize;
        let prev_matches = prev == 0
            || self
                .log
                .get(prev - 1)
                .is_some_and(|e| e.term == req.prev_log_term);
        if prev > self.log.len() || !prev_matches {
            return AppendResponse {
                term: self.term,
                success: false,
                conflict_index: self.log.len().min(prev) as u64,
            };
        }

        self.log.truncate(prev);
        self.log.extend(req.entries);
        let last_index = self.log.len() as u64;
        self.commit_index = self.commit_index.max(req.leader_commit.min(last_index));

        AppendResponse {
            term: self.term,
            success: true,
            conflict_index: 0,
        }
    }
}

impl ConsensusParticipant for RaftNode {
    fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    fn leader(&self) -> Option<String> {
        self.leader_id.clone()
    }

    fn last_committed(&self) -> u64 {
        self.commit_index
    }

    fn propose(&mut self, payload: Vec<u8>) -> Result<ProposalId> {
        if !self.is_leader() {
            return Err(crate::Error::NotLeader(
                self.leader().unwrap_or_else(|| "unknown".to_string()),
            ));
        }
        let index = self.log.len() as u64 + 1;
        self.log.push(LogEntry {
            term: self.term,
            index,
            data: payload,
        });
        let proposal = ProposalId(self.next_proposal);
        self.next_proposal += 1;
        self.own.insert(index, proposal);
        tracing::debug!(node = %self.node_id, index, %proposal, "appended proposal");
        Ok(proposal)
    }

    fn poll(&mut self) -> Vec<ConsensusEvent> {
        if self.is_leader() && !self.hold_commits {
            self.commit_index = self.log.len() as u64;
        }

        let mut events = std::mem::take(&mut self.events);
        while self.delivered_index < self.commit_index {
            self.delivered_index += 1;
            let index = self.delivered_index;
            if let Some(entry) = self.log.get(index as usize - 1) {
                events.push(ConsensusEvent::Committed {
                    index,
                    payload: entry.data.clone(),
                    proposal: self.own.remove(&index),
                });
            }
        }
        events
    }
}

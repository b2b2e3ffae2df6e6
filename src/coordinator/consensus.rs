//! Consensus seam
//!
//! `ConsensusParticipant` is what the monitor needs from a replication engine:
//! leadership, asynchronous proposal and an event stream. `ReplicatedService`
//! is the set of lifecycle hooks the engine drives on the state machine.
//! `dispatch` delivers a batch of engine events to the hooks in order.

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Handle correlating a proposal with its commit or loss
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProposalId(pub u64);

impl std::fmt::Display for ProposalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// A value reached quorum; `proposal` is set when it was proposed here
    Committed {
        index: u64,
        payload: Vec<u8>,
        proposal: Option<ProposalId>,
    },
    /// Full state received from a peer (recovery)
    Snapshot { index: u64, payload: Vec<u8> },
    /// A local proposal will never commit
    ProposalLost(ProposalId),
    ElectionStarted,
    LeadershipChanged { leader: bool },
}

pub trait ConsensusParticipant: Send {
    fn is_leader(&self) -> bool;

    /// Current leader, if known
    fn leader(&self) -> Option<String>;

    /// Index of the last committed entry, 0 for an empty log
    fn last_committed(&self) -> u64;

    /// Hand a payload to the engine. Returns immediately; the outcome is
    /// reported later through `poll`.
    fn propose(&mut self, payload: Vec<u8>) -> Result<ProposalId>;

    /// Drain pending events
    fn poll(&mut self) -> Vec<ConsensusEvent>;
}

/// Lifecycle hooks driven by the consensus engine
pub trait ReplicatedService {
    /// Bootstrap state when nothing was ever committed
    fn create_initial(&mut self);

    /// Apply one committed payload
    fn update_from_committed(&mut self, payload: &[u8]) -> Result<()>;

    /// Replace local state with a full snapshot
    fn load_snapshot(&mut self, payload: &[u8]) -> Result<()>;

    /// Make sure a pending delta exists
    fn create_pending(&mut self);

    /// Encode the pending delta for one proposal round and freeze it
    fn encode_pending(&mut self) -> Result<Vec<u8>>;

    fn on_committed(&mut self, proposal: Option<ProposalId>, now: Instant);

    fn on_proposal_lost(&mut self, proposal: ProposalId, now: Instant);

    fn on_election_start(&mut self);

    fn on_leadership_changed(&mut self, leader: bool, now: Instant);
}

/// Deliver engine events to `service`, stopping at the first apply failure
pub fn dispatch<S>(service: &mut S, events: Vec<ConsensusEvent>, now: Instant) -> Result<()>
where
    S: ReplicatedService + ?Sized,
{
    for event in events {
        match event {
            ConsensusEvent::Committed {
                index,
                payload,
                proposal,
            } => {
                tracing::debug!(index, ?proposal, "committed entry");
                service.update_from_committed(&payload)?;
                service.on_committed(proposal, now);
            }
            ConsensusEvent::Snapshot { index, payload } => {
                tracing::info!(index, "installing snapshot");
                service.load_snapshot(&payload)?;
                service.on_committed(None, now);
            }
            ConsensusEvent::ProposalLost(proposal) => {
                service.on_proposal_lost(proposal, now);
            }
            ConsensusEvent::ElectionStarted => service.on_election_start(),
            ConsensusEvent::LeadershipChanged { leader } => {
                service.on_leadership_changed(leader, now)
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        fail_apply: bool,
    }

    impl ReplicatedService for Recorder {
        fn create_initial(&mut self) {
            self.calls.push("initial".into());
        }
        fn update_from_committed(&mut self, payload: &[u8]) -> Result<()> {
            if self.fail_apply {
                return Err(crate::Error::Consensus("gap".into()));
            }
            self.calls.push(format!("apply {}", payload.len()));
            Ok(())
        }
        fn load_snapshot(&mut self, _payload: &[u8]) -> Result<()> {
            self.calls.push("snapshot".into());
            Ok(())
        }
        fn create_pending(&mut self) {}
        fn encode_pending(&mut self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn on_committed(&mut self, proposal: Option<ProposalId>, _now: Instant) {
            self.calls.push(format!("committed {:?}", proposal));
        }
        fn on_proposal_lost(&mut self, proposal: ProposalId, _now: Instant) {
            self.calls.push(format!("lost {}", proposal));
        }
        fn on_election_start(&mut self) {
            self.calls.push("election".into());
        }
        fn on_leadership_changed(&mut self, leader: bool, _now: Instant) {
            self.calls.push(format!("leader {}", leader));
        }
    }

    #[test]
    fn test_dispatch_order() {
        let mut service = Recorder::default();
        let events = vec![
            ConsensusEvent::ElectionStarted,
            ConsensusEvent::LeadershipChanged { leader: true },
            ConsensusEvent::Committed {
                index: 1,
                payload: vec![1, 2, 3],
                proposal: Some(ProposalId(7)),
            },
            ConsensusEvent::ProposalLost(ProposalId(8)),
        ];
        dispatch(&mut service, events, Instant::now()).unwrap();

        assert_eq!(
            service.calls,
            vec![
                "election",
                "leader true",
                "apply 3",
                "committed Some(ProposalId(7))",
                "lost p8",
            ]
        );
    }

    #[test]
    fn test_dispatch_stops_on_apply_error() {
        let mut service = Recorder {
            fail_apply: true,
            ..Default::default()
        };
        let events = vec![
            ConsensusEvent::Committed {
                index: 1,
                payload: vec![],
                proposal: None,
            },
            ConsensusEvent::ElectionStarted,
        ];
        assert!(dispatch(&mut service, events, Instant::now()).is_err());
        assert!(service.calls.is_empty());
    }
}

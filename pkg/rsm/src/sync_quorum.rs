//! Sync-quorum tracker (C5): outstanding read-linearization requests
//! in-flight on the leader.
//!
//! Strictly Proposer-private, same as the peer-status table. A request is
//! resolved the moment its vote set satisfies the quorum, or discarded the
//! moment that becomes infeasible.

use std::collections::BTreeSet;

use crate::quorum::Quorum;
use crate::types::NodeId;

#[derive(Debug, Clone)]
pub struct SyncRequest<R> {
    pub ref_: R,
    pub votes: BTreeSet<NodeId>,
    pub failed_votes: BTreeSet<NodeId>,
}

impl<R> SyncRequest<R> {
    pub fn new(ref_: R, failed_votes: BTreeSet<NodeId>) -> Self {
        SyncRequest {
            ref_,
            votes: BTreeSet::new(),
            failed_votes,
        }
    }
}

/// Outcome of folding a new vote or failure into a `SyncRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Pending,
    Satisfied,
    Infeasible,
}

#[derive(Debug, Default)]
pub struct SyncQuorumTracker<R> {
    requests: Vec<SyncRequest<R>>,
}

impl<R> SyncQuorumTracker<R> {
    pub fn new() -> Self {
        Self { requests: Vec::new() }
    }

    pub fn start(&mut self, ref_: R, failed_votes: BTreeSet<NodeId>) {
        self.requests.push(SyncRequest::new(ref_, failed_votes));
    }

    pub fn record_vote(
        &mut self,
        all_peers: &BTreeSet<NodeId>,
        quorum: &Quorum,
        peer: &NodeId,
        granted: bool,
    ) -> Vec<(SyncRequest<R>, SyncOutcome)>
    where
        R: Clone,
    {
        let mut resolved = Vec::new();
        self.requests.retain_mut(|req| {
            if granted {
                req.votes.insert(peer.clone());
            } else {
                req.failed_votes.insert(peer.clone());
            }
            match Self::evaluate(all_peers, quorum, req) {
                SyncOutcome::Pending => true,
                outcome => {
                    resolved.push((req.clone(), outcome));
                    false
                }
            }
        });
        resolved
    }

    /// Called on peer-down: counts the peer as failed unless it already
    /// voted, and re-evaluates every outstanding request.
    pub fn peer_down(
        &mut self,
        all_peers: &BTreeSet<NodeId>,
        quorum: &Quorum,
        peer: &NodeId,
    ) -> Vec<(SyncRequest<R>, SyncOutcome)>
    where
        R: Clone,
    {
        let mut resolved = Vec::new();
        self.requests.retain_mut(|req| {
            if !req.votes.contains(peer) {
                req.failed_votes.insert(peer.clone());
            }
            match Self::evaluate(all_peers, quorum, req) {
                SyncOutcome::Pending => true,
                outcome => {
                    resolved.push((req.clone(), outcome));
                    false
                }
            }
        });
        resolved
    }

    /// Re-evaluate all outstanding requests against a new quorum/peer set,
    /// called on config change.
    pub fn reevaluate_all(
        &mut self,
        all_peers: &BTreeSet<NodeId>,
        quorum: &Quorum,
    ) -> Vec<(SyncRequest<R>, SyncOutcome)>
    where
        R: Clone,
    {
        let mut resolved = Vec::new();
        self.requests.retain_mut(|req| match Self::evaluate(all_peers, quorum, req) {
            SyncOutcome::Pending => true,
            outcome => {
                resolved.push((req.clone(), outcome));
                false
            }
        });
        resolved
    }

    fn evaluate<T>(all_peers: &BTreeSet<NodeId>, quorum: &Quorum, req: &SyncRequest<T>) -> SyncOutcome {
        if quorum.have_quorum(&req.votes) {
            SyncOutcome::Satisfied
        } else if !quorum.feasible(all_peers, &req.failed_votes) {
            SyncOutcome::Infeasible
        } else {
            SyncOutcome::Pending
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

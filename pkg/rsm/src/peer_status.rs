//! Peer-status table (C2): per-follower replication bookkeeping.
//!
//! Strictly Proposer-private. Reads and writes only ever happen on the
//! Proposer's own task, so this is a plain `BTreeMap`, not anything
//! lock-protected.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::quorum::Quorum;
use crate::types::{NodeId, Seqno};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerStatus {
    /// Set when the peer may hold divergent uncommitted entries that must be
    /// overwritten even if nothing new is pending.
    pub needs_sync: bool,
    pub sent_seqno: Seqno,
    pub sent_commit_seqno: Seqno,
    pub acked_seqno: Seqno,
    pub acked_commit_seqno: Seqno,
}

impl PeerStatus {
    /// Initialize from a promise received during `EstablishingTerm`, per
    /// spec \S4.4: if the peer already voted in our term, trust its reported
    /// position; otherwise assume only its committed prefix is safe and mark
    /// it for a forced resync if it has any uncommitted tail.
    pub fn from_promise(
        peer_term_voted: Option<&crate::types::Term>,
        our_term: &crate::types::Term,
        peer_committed_seqno: Seqno,
        peer_high_seqno: Seqno,
    ) -> Self {
        if peer_term_voted == Some(our_term) {
            PeerStatus {
                needs_sync: false,
                sent_seqno: 0,
                sent_commit_seqno: 0,
                acked_seqno: peer_high_seqno,
                acked_commit_seqno: peer_committed_seqno,
            }
        } else {
            PeerStatus {
                needs_sync: peer_high_seqno > peer_committed_seqno,
                sent_seqno: 0,
                sent_commit_seqno: 0,
                acked_seqno: peer_committed_seqno,
                acked_commit_seqno: peer_committed_seqno,
            }
        }
    }

    /// Record that an append for `(up_to_seqno, up_to_commit_seqno)` was just
    /// sent to this peer.
    pub fn record_sent(&mut self, up_to_seqno: Seqno, up_to_commit_seqno: Seqno) {
        self.sent_seqno = up_to_seqno;
        self.sent_commit_seqno = up_to_commit_seqno;
    }

    /// Roll back the "sent" watermarks after a transport failure so the next
    /// replication pass resends from the last acked point.
    pub fn reset_sent(&mut self) {
        self.sent_seqno = self.acked_seqno;
        self.sent_commit_seqno = self.acked_commit_seqno;
    }

    /// Record an `append` acknowledgement, enforcing invariant I1
    /// (`acked <= sent`) by clamping.
    pub fn record_acked(&mut self, peer_high_seqno: Seqno, peer_committed_seqno: Seqno) {
        self.acked_seqno = peer_high_seqno.min(self.sent_seqno);
        self.acked_commit_seqno = peer_committed_seqno.min(self.sent_commit_seqno);
    }

    pub fn needs_replication(&self, pending_high_seqno: Seqno, committed_seqno: Seqno) -> bool {
        self.needs_sync
            || pending_high_seqno > self.sent_seqno
            || committed_seqno > self.sent_commit_seqno
    }
}

/// The peer -> status map, rebuilt on term establishment.
#[derive(Debug, Clone, Default)]
pub struct PeerStatusTable {
    statuses: BTreeMap<NodeId, PeerStatus>,
}

impl PeerStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.statuses.clear();
    }

    pub fn insert(&mut self, peer: NodeId, status: PeerStatus) {
        self.statuses.insert(peer, status);
    }

    pub fn get(&self, peer: &NodeId) -> Option<&PeerStatus> {
        self.statuses.get(peer)
    }

    pub fn get_mut(&mut self, peer: &NodeId) -> Option<&mut PeerStatus> {
        self.statuses.get_mut(peer)
    }

    pub fn contains(&self, peer: &NodeId) -> bool {
        self.statuses.contains_key(peer)
    }

    /// Remove a peer's row, e.g. when its monitor signals DOWN.
    pub fn remove(&mut self, peer: &NodeId) {
        if self.statuses.remove(peer).is_some() {
            debug!(peer = %peer, "removed peer status on down");
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &PeerStatus)> {
        self.statuses.iter()
    }

    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.statuses.keys()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

/// `deduceCommit` (\S4.4.2): the highest seqno acknowledged by a set of
/// peers that together satisfy `quorum`, or `None` if no prefix of the
/// acked-descending order ever does.
///
/// Adds peers to a growing vote set in descending order of their acked
/// seqno; the first seqno at which the vote set satisfies the quorum is the
/// answer, since every peer added after that point only acked an equal or
/// lower seqno.
pub fn deduce_commit(statuses: &PeerStatusTable, quorum: &Quorum) -> Option<Seqno> {
    let mut by_seqno: Vec<(Seqno, NodeId)> = statuses
        .iter()
        .map(|(peer, status)| (status.acked_seqno, peer.clone()))
        .collect();
    by_seqno.sort_by(|a, b| b.0.cmp(&a.0));

    let mut votes: BTreeSet<NodeId> = BTreeSet::new();
    for (seqno, peer) in by_seqno {
        votes.insert(peer);
        if quorum.have_quorum(&votes) {
            return Some(seqno);
        }
    }
    None
}

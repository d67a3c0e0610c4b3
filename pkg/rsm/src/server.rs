//! The Server interface (\S6): the per-node façade a Proposer and its RSMs
//! sit behind, and the only path by which they reach each other.
//!
//! Keeping this as two narrow traits rather than letting the Proposer hold
//! a reference to concrete RSMs (or vice versa) is the explicit-channel
//! replacement for the teacher's original cyclic actor references: a
//! Proposer only ever calls back up to its Server, never sideways into an
//! RSM, and an RSM only ever calls up to its Server, never into a Proposer
//! it does not own.

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{HistoryId, Seqno, Term};

/// Proposer -> Server: announces that this proposer has reached the
/// `Proposing` state for `(history_id, term)` and is ready to accept client
/// work up to `high_seqno`.
pub trait ProposerServerHandle: Send + Sync {
    fn proposer_ready(&self, history_id: HistoryId, term: Term, high_seqno: Seqno);
}

/// RSM -> Server: forwarding hooks an RSM runtime uses to reach whichever
/// Proposer currently holds leadership for its history/term, since an RSM
/// is never handed a direct reference to a Proposer it doesn't own.
#[async_trait]
pub trait RsmServerHandle: Send + Sync {
    /// Forward a client command destined for `rsm_name` to the matching
    /// Proposer, tagged with a caller-chosen correlation `ref_`.
    async fn rsm_command(
        &self,
        history_id: HistoryId,
        term: Term,
        rsm_name: String,
        ref_: u64,
        command: Vec<u8>,
    );

    /// Ask the matching Proposer to run a read-quorum round, resolving once
    /// linearizability as of this call is established.
    async fn sync_quorum(&self, history_id: HistoryId, term: Term) -> Result<()>;

    /// Notify the Server that this RSM observed a term change, so it can
    /// reroute pending client work.
    fn announce_term(&self, history_id: HistoryId, term: Term);
}

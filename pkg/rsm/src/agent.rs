//! The Agent interface (\S6): per-node persistent log + metadata store.
//!
//! Out of scope per the spec -- this crate only depends on the shape of
//! this trait. A real implementation durably persists the log and metadata;
//! an in-memory fake sufficient to drive the scenarios in \S8 lives under
//! `tests/support` behind the same trait.

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{HistoryId, LogEntry, LogPosition, Metadata, NodeId, Seqno, Term};

/// A token returned by `Agent::monitor`, compared against the monitor ref
/// active at send time to discard stale replies (\S5, \S7 stale-response
/// defense).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonitorRef(pub u64);

/// Successful outcome of an `append` call, as reported by the peer's Agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendAck {
    pub high_seqno: Seqno,
    pub committed_seqno: Seqno,
}

#[async_trait]
pub trait Agent: Send + Sync {
    /// Establish `term` as the local node's current term, returning the
    /// resulting metadata snapshot.
    async fn establish_local_term(&self, history_id: HistoryId, term: Term) -> Result<Metadata>;

    /// Ask `peer`'s agent to establish `term` on our behalf, completing the
    /// promise phase of leader establishment.
    async fn establish_term(
        &self,
        peer: NodeId,
        history_id: HistoryId,
        term: Term,
        log_position: LogPosition,
    ) -> Result<Metadata>;

    /// Replicate `entries` to `peer`, informing it of the current commit
    /// point.
    async fn append(
        &self,
        peer: NodeId,
        history_id: HistoryId,
        term: Term,
        committed_seqno: Seqno,
        entries: Vec<LogEntry>,
    ) -> Result<AppendAck>;

    /// A zero-entry position probe used for periodic liveness/sync checks.
    async fn ensure_term(&self, peer: NodeId, history_id: HistoryId, term: Term) -> Result<()>;

    /// Synchronous (from the Proposer's perspective -- awaited inline, never
    /// spawned) backfill read used when replicating entries older than what
    /// is still buffered in the pending queue.
    async fn get_log(
        &self,
        history_id: HistoryId,
        term: Term,
        from_seqno: Seqno,
        to_seqno: Seqno,
    ) -> Result<Vec<LogEntry>>;

    /// Full log read used by an RSM's reader subprocess to catch up.
    async fn get_full_log(&self, peer: NodeId) -> Result<Vec<LogEntry>>;

    /// Used by an RSM at startup to discover the current history/commit
    /// point without going through term establishment.
    async fn get_metadata(&self) -> Result<Metadata>;

    /// Register interest in `peer`'s liveness, returning a fresh ref that
    /// the caller stamps on outgoing requests. A `DOWN` for `peer` is
    /// delivered out of band as a `PeerDown` event on the owning
    /// component's mailbox (see `proposer::ProposerEvent`,
    /// `rsm::RsmEvent`), not through this trait.
    fn monitor(&self, peer: NodeId) -> MonitorRef;
}

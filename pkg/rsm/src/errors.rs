//! Crate-wide error taxonomy.
//!
//! Mirrors the split in the spec between errors that are fatal to the current
//! leadership term and errors that are recoverable on a per-peer basis. The
//! latter never reach here as `Err` values -- they are absorbed where they
//! occur (see `proposer::proposing`) and only ever show up in logs.

use crate::types::{HistoryId, LogPosition, Metadata, Term};

error_chain! {
    errors {
        /// The local Agent refused to establish the term we asked for.
        LocalEstablishTermFailed {
            description("local agent refused to establish term")
        }

        /// A peer (or the local agent) reported a strictly higher term.
        ConflictingTerm(t: Term) {
            description("conflicting term observed")
            display("conflicting term observed: {:?}", t)
        }

        /// A peer belongs to a different, incompatible history.
        HistoryMismatch(h: HistoryId) {
            description("history mismatch")
            display("history mismatch against {:?}", h)
        }

        /// A peer reported it is behind the position we expected of it.
        Behind(pos: LogPosition) {
            description("peer is behind")
            display("peer is behind at {:?}", pos)
        }

        /// A peer's log has diverged and must be resynchronized from `meta`.
        MissingEntries(meta: Box<Metadata>) {
            description("peer is missing entries")
        }

        /// `ESTABLISH_TERM_TIMEOUT` elapsed before a quorum of promises arrived.
        EstablishTermTimeout {
            description("establish term timed out")
        }

        /// The quorum became infeasible given the currently known failed votes.
        NoQuorum {
            description("no quorum reachable")
        }

        /// The local agent died; we can no longer be leader.
        AgentTerminated {
            description("local agent terminated")
        }

        /// Any other transport/agent failure not classified above.
        UnexpectedError(detail: String) {
            description("unexpected error")
            display("unexpected error: {}", detail)
        }

        /// A `casConfig` request whose expected revision did not match.
        CasFailed(current: crate::types::ConfigRevision) {
            description("cas config failed")
            display("cas config failed, current revision is {:?}", current)
        }

        /// A command/query/getAppliedRevision was addressed to a non-leader.
        NotLeader {
            description("not leader")
        }

        /// A pending client request was flushed because the term ended.
        LeaderGone {
            description("leader gone")
        }

        /// A `syncRevision` request's timer fired before it was satisfied.
        Timeout {
            description("timed out waiting for revision to apply")
        }

        /// The RSM's reader subprocess died; the runtime must stop.
        ReaderDied {
            description("log reader task died")
        }
    }
}

impl Clone for ErrorKind {
    fn clone(&self) -> Self {
        // `ErrorKind` isn't `Clone` by default because of the boxed foreign
        // link variants; all of our own variants are plain data so we can
        // reconstruct them directly. Used when the same stop-reason must be
        // delivered to several pending clients.
        match self {
            ErrorKind::Msg(s) => ErrorKind::Msg(s.clone()),
            ErrorKind::LocalEstablishTermFailed => ErrorKind::LocalEstablishTermFailed,
            ErrorKind::ConflictingTerm(t) => ErrorKind::ConflictingTerm(t.clone()),
            ErrorKind::HistoryMismatch(h) => ErrorKind::HistoryMismatch(h.clone()),
            ErrorKind::Behind(p) => ErrorKind::Behind(p.clone()),
            ErrorKind::MissingEntries(m) => ErrorKind::MissingEntries(m.clone()),
            ErrorKind::EstablishTermTimeout => ErrorKind::EstablishTermTimeout,
            ErrorKind::NoQuorum => ErrorKind::NoQuorum,
            ErrorKind::AgentTerminated => ErrorKind::AgentTerminated,
            ErrorKind::UnexpectedError(d) => ErrorKind::UnexpectedError(d.clone()),
            ErrorKind::CasFailed(r) => ErrorKind::CasFailed(r.clone()),
            ErrorKind::NotLeader => ErrorKind::NotLeader,
            ErrorKind::LeaderGone => ErrorKind::LeaderGone,
            ErrorKind::Timeout => ErrorKind::Timeout,
            ErrorKind::ReaderDied => ErrorKind::ReaderDied,
        }
    }
}

//! Pending-entries queue (C3): the in-memory buffer of proposed-but-not-yet-
//! committed log entries.
//!
//! Backed by a `VecDeque` ordered by seqno. All entries in the queue satisfy
//! `seqno > committed_seqno` at the moment they were pushed; `drop_committed`
//! is the only way entries leave other than being read for replication.

use std::collections::VecDeque;

use crate::types::{LogEntry, Seqno};

#[derive(Debug, Default)]
pub struct PendingLog {
    entries: VecDeque<LogEntry>,
}

impl PendingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: LogEntry) {
        debug_assert!(
            self.entries.back().map_or(true, |e| entry.seqno == e.seqno + 1),
            "pending log entries must be contiguous by seqno"
        );
        self.entries.push_back(entry);
    }

    /// Drop the prefix of entries with `seqno <= new_committed_seqno`.
    pub fn drop_committed(&mut self, new_committed_seqno: Seqno) {
        while self
            .entries
            .front()
            .map_or(false, |e| e.seqno <= new_committed_seqno)
        {
            self.entries.pop_front();
        }
    }

    /// Every pending entry with `seqno` in `(from, to]`, in order. Entries
    /// older than the oldest buffered one are the caller's responsibility to
    /// backfill from the Agent's durable log.
    pub fn range(&self, from: Seqno, to: Seqno) -> impl Iterator<Item = &LogEntry> {
        self.entries
            .iter()
            .filter(move |e| e.seqno > from && e.seqno <= to)
    }

    /// The lowest seqno currently buffered, if any.
    pub fn oldest_seqno(&self) -> Option<Seqno> {
        self.entries.front().map(|e| e.seqno)
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}

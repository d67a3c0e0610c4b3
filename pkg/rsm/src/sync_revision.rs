//! Sync-revision tracker (C7): an ordered wait-queue of clients blocked
//! until a given `(historyId, seqno)` has been applied.
//!
//! Strictly RSM-runtime-private. Kept sorted by `(seqno, ref)` so that once
//! `appliedSeqno` advances, satisfying requests is a prefix scan rather than
//! a full pass. Each entry carries the history id that was current when the
//! request was enqueued, so a history-id change can discard stale waiters.

use std::collections::BTreeMap;

use crate::types::{HistoryId, Seqno};

/// Ticket type distinguishing one pending timer firing from a stale,
/// already-cancelled one (the "idempotent timer drain" from \S9.1).
pub type Generation = u64;

#[derive(Debug, Clone)]
pub struct SyncRevisionEntry<F> {
    pub from: F,
    pub history_id: HistoryId,
    pub generation: Generation,
}

#[derive(Debug)]
pub struct SyncRevisionTracker<F, R> {
    /// Ordered by `(seqno, ref)` via `BTreeMap`'s key ordering.
    requests: BTreeMap<(Seqno, R), SyncRevisionEntry<F>>,
    next_generation: Generation,
}

impl<F, R: Ord + Clone> Default for SyncRevisionTracker<F, R> {
    fn default() -> Self {
        SyncRevisionTracker {
            requests: BTreeMap::new(),
            next_generation: 0,
        }
    }
}

impl<F, R: Ord + Clone> SyncRevisionTracker<F, R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a new wait, returning the generation to stamp on its timer.
    pub fn enqueue(&mut self, seqno: Seqno, ref_: R, from: F, history_id: HistoryId) -> Generation {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.requests.insert(
            (seqno, ref_),
            SyncRevisionEntry {
                from,
                history_id,
                generation,
            },
        );
        generation
    }

    /// Remove and return a single request by its key, e.g. because its timer
    /// fired. The caller passes the `Generation` its timer was stamped with;
    /// if the live entry at that key carries a different generation (the key
    /// was satisfied/removed and then reused by a later wait before this
    /// timer fired), the late timer is ignored and the live entry is left in
    /// place. Returns `None` if there was nothing to remove or the
    /// generation didn't match.
    pub fn take(&mut self, seqno: Seqno, ref_: &R, generation: Generation) -> Option<SyncRevisionEntry<F>> {
        if self.requests.get(&(seqno, ref_.clone()))?.generation != generation {
            return None;
        }
        self.requests.remove(&(seqno, ref_.clone()))
    }

    /// Pop and return every request with `seqno <= applied_seqno`, in
    /// ascending seqno order, as a prefix scan.
    pub fn drain_satisfied(&mut self, applied_seqno: Seqno) -> Vec<(R, SyncRevisionEntry<F>)> {
        let ready_keys: Vec<(Seqno, R)> = self
            .requests
            .keys()
            .take_while(|(s, _)| *s <= applied_seqno)
            .cloned()
            .collect();
        let mut out = Vec::with_capacity(ready_keys.len());
        for key in ready_keys {
            if let Some(entry) = self.requests.remove(&key) {
                out.push((key.1, entry));
            }
        }
        out
    }

    /// Remove and return every request whose stored history id differs from
    /// `current_history_id` -- called when the applied history id changes.
    pub fn drain_history_mismatch(
        &mut self,
        current_history_id: &HistoryId,
    ) -> Vec<(R, SyncRevisionEntry<F>)> {
        let stale_keys: Vec<(Seqno, R)> = self
            .requests
            .iter()
            .filter(|(_, entry)| &entry.history_id != current_history_id)
            .map(|(k, _)| k.clone())
            .collect();
        let mut out = Vec::with_capacity(stale_keys.len());
        for key in stale_keys {
            if let Some(entry) = self.requests.remove(&key) {
                out.push((key.1, entry));
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Remove and return every outstanding request, e.g. when the owning
    /// runtime is shutting down and every waiter must be flushed.
    pub fn drain_all(&mut self) -> Vec<(R, SyncRevisionEntry<F>)> {
        std::mem::take(&mut self.requests)
            .into_iter()
            .map(|((_, ref_), entry)| (ref_, entry))
            .collect()
    }
}

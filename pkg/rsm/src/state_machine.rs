//! The pluggable deterministic state machine ("mod") capability set that an
//! RSM runtime drives (\S4.6).
//!
//! Expressed as a generic trait bound on the RSM runtime rather than a
//! trait object: each named RSM (e.g. a membership table, a KV store) is a
//! concrete type known at construction time, so there is no need to pay for
//! dynamic dispatch or to smuggle heterogeneous `Data` types behind `dyn`.

use crate::types::Revision;

/// Result of `handle_command`: either the command is accepted and should be
/// proposed to the log (with the speculative, not-yet-applied state it
/// would produce), or rejected outright with a reply the client sees
/// immediately.
pub enum CommandOutcome<D> {
    Apply(D),
    Reject(Vec<u8>),
}

pub trait StateMachine: Send + 'static {
    type Data: Clone + Send + 'static;

    /// Build the initial data value from a `Config`'s opaque per-RSM
    /// payload, run once when the RSM is first created.
    fn init(&self, config_payload: &[u8]) -> Self::Data;

    /// Speculatively validate `cmd` against the current (possibly
    /// not-yet-committed) data, without mutating anything.
    fn handle_command(&self, data: &Self::Data, cmd: &[u8]) -> CommandOutcome<Self::Data>;

    /// Answer a read-only query against the current data.
    fn handle_query(&self, data: &Self::Data, query: &[u8]) -> Vec<u8>;

    /// Apply a committed command at `revision`, producing the reply bytes
    /// delivered to whichever client is still waiting and the new data.
    fn apply_command(&self, data: Self::Data, cmd: &[u8], revision: Revision) -> (Vec<u8>, Self::Data);

    /// Informational, non-command updates the RSM runtime delivers out of
    /// band (e.g. membership/liveness hints). Most mods ignore these.
    fn handle_info(&self, data: Self::Data, _info: &[u8]) -> Self::Data {
        data
    }

    /// Called once when the RSM is shutting down.
    fn terminate(&self, _data: &Self::Data) {}
}

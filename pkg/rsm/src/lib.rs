//! Replicated state-machine core: a Multi-Paxos-family consensus engine
//! (Proposer, C4) driving one or more pluggable deterministic state
//! machines (RSM runtime, C6) over a replicated log.
//!
//! This crate implements only the leader-side consensus core and the
//! per-mod apply/query/sync-revision runtime; the persistent log/metadata
//! store (`Agent`), failure detection (`PeerLiveness`), and message routing
//! (`Server`) are external collaborators this crate only depends on the
//! shape of.

#[macro_use]
extern crate error_chain;

pub mod agent;
pub mod config;
pub mod errors;
pub mod liveness;
pub mod pending_log;
pub mod peer_status;
pub mod proposer;
pub mod quorum;
pub mod runtime;
pub mod server;
pub mod state_machine;
pub mod sync_quorum;
pub mod sync_revision;
pub mod types;

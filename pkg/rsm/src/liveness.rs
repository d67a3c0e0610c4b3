//! Peer Liveness interface (\S6): membership-independent failure detection
//! shared across every Proposer/RSM instance on a node.
//!
//! Out of scope for this crate's implementation; a fake built from a
//! `tokio::sync::watch` over the live set is enough to drive the test
//! scenarios in \S8.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::types::NodeId;

#[async_trait]
pub trait PeerLiveness: Send + Sync {
    /// Current best-effort live set, used by `checkPeers` to decide which
    /// unmonitored voters are worth probing.
    async fn get_live_peers(&self) -> BTreeSet<NodeId>;
}

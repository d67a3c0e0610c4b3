//! The replicated data model: histories, terms, revisions, log entries,
//! configurations, and the per-node metadata handed back by the Agent.
//!
//! These types are pure data -- no behavior lives here beyond small derived
//! accessors. `Quorum` construction from a `Config`/`Transition` lives in
//! `quorum.rs` since it depends on knowing which node is "self".

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Opaque identifier naming an epoch of log continuity.
pub type HistoryId = Vec<u8>;

/// Identifies a single node in the cluster.
pub type NodeId = String;

/// A strictly monotone pair `(number, leader-id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    pub number: u64,
    pub leader_id: NodeId,
}

impl Term {
    pub fn new(number: u64, leader_id: impl Into<NodeId>) -> Self {
        Term {
            number,
            leader_id: leader_id.into(),
        }
    }
}

pub type Seqno = u64;

/// `(historyId, seqno)` -- the externally visible version of a log entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub history_id: HistoryId,
    pub seqno: Seqno,
}

/// `(historyId, term, seqno)` -- the full revision attached to a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullRevision {
    pub history_id: HistoryId,
    pub term: Term,
    pub seqno: Seqno,
}

impl FullRevision {
    pub fn revision(&self) -> Revision {
        Revision {
            history_id: self.history_id.clone(),
            seqno: self.seqno,
        }
    }
}

/// A single log position, used for establish-term probes and proposal
/// acknowledgements where only `(term, seqno)` matter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub term: Term,
    pub seqno: Seqno,
}

/// Per-RSM configuration embedded in a `Config` entry. Opaque to the core
/// beyond its name; the payload is handed to the matching `StateMachine`
/// implementation at RSM startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsmConfig {
    pub payload: Vec<u8>,
}

/// A stable, committed cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub voters: BTreeSet<NodeId>,
    pub state_machines: BTreeMap<String, RsmConfig>,
}

impl Config {
    pub fn with_voters(voters: BTreeSet<NodeId>) -> Self {
        Config {
            voters,
            state_machines: BTreeMap::new(),
        }
    }
}

/// A joint, in-progress configuration change. Remains active until its own
/// seqno is committed, at which point `future` is adopted as a new `Config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub current: Config,
    pub future: Config,
}

/// The revision at which the *active* configuration (stable or in-transition)
/// was installed. Used to CAS config changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRevision {
    pub history_id: HistoryId,
    pub term: Term,
    pub seqno: Seqno,
}

/// The active configuration tracked by the Proposer: either a stable config
/// or a joint transition in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveConfig {
    Stable(Config),
    InTransition(Transition),
}

impl ActiveConfig {
    pub fn voters(&self) -> BTreeSet<NodeId> {
        match self {
            ActiveConfig::Stable(c) => c.voters.clone(),
            ActiveConfig::InTransition(t) => {
                t.current.voters.union(&t.future.voters).cloned().collect()
            }
        }
    }

    pub fn state_machines(&self) -> &BTreeMap<String, RsmConfig> {
        match self {
            ActiveConfig::Stable(c) => &c.state_machines,
            ActiveConfig::InTransition(t) => &t.current.state_machines,
        }
    }
}

/// A command destined for one particular state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsmCommand {
    /// Client-chosen identifier echoed back in the apply reply.
    pub id: u64,
    pub rsm_name: String,
    pub payload: Vec<u8>,
}

/// The value carried by a single log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogValue {
    RsmCommand(RsmCommand),
    Config(Config),
    Transition(Transition),
}

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub history_id: HistoryId,
    pub term: Term,
    pub seqno: Seqno,
    pub value: LogValue,
}

impl LogEntry {
    pub fn revision(&self) -> Revision {
        Revision {
            history_id: self.history_id.clone(),
            seqno: self.seqno,
        }
    }

    pub fn full_revision(&self) -> FullRevision {
        FullRevision {
            history_id: self.history_id.clone(),
            term: self.term.clone(),
            seqno: self.seqno,
        }
    }
}

/// Status of an externally-supplied quorum-failover recovery artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchStatus {
    Pending,
    Resolved,
}

/// `{ historyId, coordinator, peers, status, opaque }` -- a recovery artifact
/// indicating a forced quorum-failover to the given peer set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub history_id: HistoryId,
    pub coordinator: NodeId,
    pub peers: BTreeSet<NodeId>,
    pub status: BranchStatus,
    pub opaque: Vec<u8>,
}

/// Per-node metadata as returned by the Agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub history_id: HistoryId,
    pub term: Term,
    /// The term this node most recently cast a vote/promise in.
    pub term_voted: Option<Term>,
    pub high_seqno: Seqno,
    pub committed_seqno: Seqno,
    pub config: ActiveConfig,
    pub config_revision: ConfigRevision,
    pub pending_branch: Option<Branch>,
}

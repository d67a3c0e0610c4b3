//! In-memory fakes for the Agent, Peer Liveness and Server collaborators,
//! sufficient to drive the Proposer and RSM runtime through the scenarios
//! in \S8 without a network or disk.
//!
//! All nodes in a `Cluster` live in a single process and share state behind
//! plain `std::sync::Mutex`es; every `Agent` method completes without ever
//! holding a lock across an `.await`, so this is safe to call directly from
//! async code without deadlocking the runtime.

pub mod echo_kv;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use tokio::sync::watch;

use rsm_core::agent::{Agent, AppendAck, MonitorRef};
use rsm_core::errors::{ErrorKind, Result};
use rsm_core::liveness::PeerLiveness;
use rsm_core::proposer::{CasConfigReply, ProposerHandle};
use rsm_core::runtime::RsmHandle;
use rsm_core::server::{ProposerServerHandle, RsmServerHandle};
use rsm_core::types::{
    ActiveConfig, Branch, Config, ConfigRevision, HistoryId, LogEntry, LogValue, Metadata, NodeId,
    RsmCommand, Seqno, Term,
};

static TRACING_INIT: Once = Once::new();

/// Install a `tracing-subscriber` fmt layer honoring `RUST_LOG`, once per
/// test binary, so the spans the Proposer/RSM emit are visible when a
/// scenario is run with `RUST_LOG=debug cargo test -- --nocapture`.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// One node's durable log + metadata, as a real Agent implementation would
/// own it. Entries are stored 1-indexed by seqno (`log[0]` is seqno 1).
struct NodeState {
    history_id: HistoryId,
    term: Option<Term>,
    term_voted: Option<Term>,
    log: Vec<LogEntry>,
    committed_seqno: Seqno,
    config: ActiveConfig,
    config_revision: ConfigRevision,
    pending_branch: Option<Branch>,
}

impl NodeState {
    fn new(history_id: HistoryId, config: Config) -> Self {
        NodeState {
            history_id: history_id.clone(),
            term: None,
            term_voted: None,
            log: Vec::new(),
            committed_seqno: 0,
            config: ActiveConfig::Stable(config),
            config_revision: ConfigRevision {
                history_id,
                term: Term::new(0, ""),
                seqno: 0,
            },
            pending_branch: None,
        }
    }

    fn snapshot(&self) -> Metadata {
        Metadata {
            history_id: self.history_id.clone(),
            term: self.term.clone().unwrap_or_else(|| Term::new(0, "")),
            term_voted: self.term_voted.clone(),
            high_seqno: self.log.len() as Seqno,
            committed_seqno: self.committed_seqno,
            config: self.config.clone(),
            config_revision: self.config_revision.clone(),
            pending_branch: self.pending_branch.clone(),
        }
    }

    fn try_establish(&mut self, history_id: &HistoryId, term: &Term) -> Result<Metadata> {
        if let Some(cur) = &self.term {
            if *cur > *term {
                return Err(ErrorKind::ConflictingTerm(cur.clone()).into());
            }
        }
        if !self.history_id.is_empty() && self.history_id != *history_id {
            return Err(ErrorKind::HistoryMismatch(self.history_id.clone()).into());
        }
        self.term = Some(term.clone());
        self.term_voted = Some(term.clone());
        Ok(self.snapshot())
    }

    fn try_append(
        &mut self,
        history_id: &HistoryId,
        term: &Term,
        committed_seqno: Seqno,
        entries: Vec<LogEntry>,
    ) -> Result<AppendAck> {
        if let Some(cur) = &self.term {
            if *cur > *term {
                return Err(ErrorKind::ConflictingTerm(cur.clone()).into());
            }
        }
        if !self.history_id.is_empty() && self.history_id != *history_id {
            return Err(ErrorKind::HistoryMismatch(self.history_id.clone()).into());
        }
        self.term = Some(term.clone());

        if let Some(first) = entries.first() {
            let expected_next = self.log.len() as Seqno + 1;
            if first.seqno > expected_next {
                return Err(ErrorKind::MissingEntries(Box::new(self.snapshot())).into());
            }
            let last_seqno = entries.last().unwrap().seqno;
            for entry in entries {
                match &entry.value {
                    LogValue::Config(c) => {
                        self.config = ActiveConfig::Stable(c.clone());
                        self.config_revision = ConfigRevision {
                            history_id: entry.history_id.clone(),
                            term: entry.term.clone(),
                            seqno: entry.seqno,
                        };
                    }
                    LogValue::Transition(t) => {
                        self.config = ActiveConfig::InTransition(t.clone());
                        self.config_revision = ConfigRevision {
                            history_id: entry.history_id.clone(),
                            term: entry.term.clone(),
                            seqno: entry.seqno,
                        };
                    }
                    LogValue::RsmCommand(_) => {}
                }
                let idx = (entry.seqno - 1) as usize;
                if idx < self.log.len() {
                    self.log[idx] = entry;
                } else {
                    self.log.push(entry);
                }
            }
            // The leader's view of the log past the last entry it just sent
            // supersedes whatever this node held there -- matters for branch
            // resolution, which forces an overwrite below the old highSeqno.
            self.log.truncate(last_seqno as usize);
        }

        self.committed_seqno = self.committed_seqno.max(committed_seqno.min(self.log.len() as Seqno));
        Ok(AppendAck {
            high_seqno: self.log.len() as Seqno,
            committed_seqno: self.committed_seqno,
        })
    }

    fn try_ensure_term(&mut self, history_id: &HistoryId, term: &Term) -> Result<()> {
        if let Some(cur) = &self.term {
            if *cur > *term {
                return Err(ErrorKind::ConflictingTerm(cur.clone()).into());
            }
        }
        if !self.history_id.is_empty() && self.history_id != *history_id {
            return Err(ErrorKind::HistoryMismatch(self.history_id.clone()).into());
        }
        self.term = Some(term.clone());
        Ok(())
    }
}

/// A whole in-memory cluster: every node's state plus a monitor-ref
/// generator shared by every `InMemoryAgent` created from it.
pub struct Cluster {
    nodes: Mutex<BTreeMap<NodeId, Arc<Mutex<NodeState>>>>,
    next_monitor_ref: AtomicU64,
    rsms: Mutex<BTreeMap<NodeId, Vec<RsmHandle>>>,
}

impl Cluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Cluster {
            nodes: Mutex::new(BTreeMap::new()),
            next_monitor_ref: AtomicU64::new(0),
            rsms: Mutex::new(BTreeMap::new()),
        })
    }

    /// Register an RSM runtime living on `node` to receive this cluster's
    /// stand-in for the Agent's "metadata(meta) when commit advances" push
    /// (\S4.4 event inputs) -- a real Agent implementation watches its own
    /// durable commit position and calls `RsmHandle::metadata` directly,
    /// outside of the `Agent` trait itself.
    pub fn register_rsm(self: &Arc<Self>, node: impl Into<NodeId>, handle: RsmHandle) {
        self.rsms.lock().unwrap().entry(node.into()).or_default().push(handle);
    }

    fn notify_rsms(&self, peer: &NodeId) {
        let snapshot = self.state(peer).lock().unwrap().snapshot();
        for rsm in self.rsms.lock().unwrap().get(peer).into_iter().flatten() {
            rsm.metadata(snapshot.clone());
        }
    }

    /// Register a node with the given starting config, shared by every
    /// future call to `agent_for` that names it.
    pub fn add_node(self: &Arc<Self>, id: impl Into<NodeId>, history_id: HistoryId, config: Config) {
        let id = id.into();
        self.nodes
            .lock()
            .unwrap()
            .insert(id, Arc::new(Mutex::new(NodeState::new(history_id, config))));
    }

    /// Seed a node's durable log with synthetic entries, a committed seqno,
    /// and (optionally) a pending branch -- for tests that need to start a
    /// Proposer past a non-trivial history, e.g. branch resolution.
    pub fn seed(
        self: &Arc<Self>,
        id: impl Into<NodeId>,
        entries: Vec<LogEntry>,
        committed_seqno: Seqno,
        pending_branch: Option<Branch>,
    ) {
        let state = self.state(&id.into());
        let mut state = state.lock().unwrap();
        state.log = entries;
        state.committed_seqno = committed_seqno;
        state.pending_branch = pending_branch;
    }

    fn state(&self, peer: &NodeId) -> Arc<Mutex<NodeState>> {
        self.nodes
            .lock()
            .unwrap()
            .get(peer)
            .unwrap_or_else(|| panic!("no such node in test cluster: {}", peer))
            .clone()
    }

    /// Build an `Agent` handle bound to `self_id`, i.e. the agent a
    /// Proposer/RSM running on that node would hold.
    pub fn agent_for(self: &Arc<Self>, self_id: impl Into<NodeId>) -> Arc<InMemoryAgent> {
        Arc::new(InMemoryAgent {
            self_id: self_id.into(),
            cluster: self.clone(),
        })
    }
}

pub struct InMemoryAgent {
    self_id: NodeId,
    cluster: Arc<Cluster>,
}

#[async_trait]
impl Agent for InMemoryAgent {
    async fn establish_local_term(&self, history_id: HistoryId, term: Term) -> Result<Metadata> {
        self.cluster.state(&self.self_id).lock().unwrap().try_establish(&history_id, &term)
    }

    async fn establish_term(
        &self,
        peer: NodeId,
        history_id: HistoryId,
        term: Term,
        _log_position: rsm_core::types::LogPosition,
    ) -> Result<Metadata> {
        self.cluster.state(&peer).lock().unwrap().try_establish(&history_id, &term)
    }

    async fn append(
        &self,
        peer: NodeId,
        history_id: HistoryId,
        term: Term,
        committed_seqno: Seqno,
        entries: Vec<LogEntry>,
    ) -> Result<AppendAck> {
        let ack = self
            .cluster
            .state(&peer)
            .lock()
            .unwrap()
            .try_append(&history_id, &term, committed_seqno, entries)?;
        self.cluster.notify_rsms(&peer);
        Ok(ack)
    }

    async fn ensure_term(&self, peer: NodeId, history_id: HistoryId, term: Term) -> Result<()> {
        self.cluster.state(&peer).lock().unwrap().try_ensure_term(&history_id, &term)
    }

    async fn get_log(
        &self,
        _history_id: HistoryId,
        _term: Term,
        from_seqno: Seqno,
        to_seqno: Seqno,
    ) -> Result<Vec<LogEntry>> {
        let state = self.cluster.state(&self.self_id);
        let state = state.lock().unwrap();
        let from = from_seqno as usize;
        let to = (to_seqno as usize).min(state.log.len());
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(state.log[from..to].to_vec())
    }

    async fn get_full_log(&self, peer: NodeId) -> Result<Vec<LogEntry>> {
        Ok(self.cluster.state(&peer).lock().unwrap().log.clone())
    }

    async fn get_metadata(&self) -> Result<Metadata> {
        Ok(self.cluster.state(&self.self_id).lock().unwrap().snapshot())
    }

    fn monitor(&self, _peer: NodeId) -> MonitorRef {
        MonitorRef(self.cluster.next_monitor_ref.fetch_add(1, Ordering::SeqCst))
    }
}

/// A liveness view backed by a `watch` channel so tests can flip nodes
/// live/dead between phases of a scenario.
#[derive(Clone)]
pub struct FakeLiveness {
    live: watch::Receiver<std::collections::BTreeSet<NodeId>>,
}

pub struct FakeLivenessController {
    tx: watch::Sender<std::collections::BTreeSet<NodeId>>,
}

impl FakeLivenessController {
    pub fn set_live(&self, live: std::collections::BTreeSet<NodeId>) {
        let _ = self.tx.send(live);
    }
}

pub fn fake_liveness(initial: std::collections::BTreeSet<NodeId>) -> (Arc<FakeLiveness>, FakeLivenessController) {
    let (tx, rx) = watch::channel(initial);
    (Arc::new(FakeLiveness { live: rx }), FakeLivenessController { tx })
}

#[async_trait]
impl PeerLiveness for FakeLiveness {
    async fn get_live_peers(&self) -> std::collections::BTreeSet<NodeId> {
        self.live.borrow().clone()
    }
}

/// The per-node Server facade: routes an RSM's outgoing calls to whichever
/// Proposer currently runs on this same test node, and fans a Proposer's
/// `proposer_ready` out to every RSM registered with it.
#[derive(Default)]
struct TestServerInner {
    proposer: Option<ProposerHandle>,
    rsms: Vec<RsmHandle>,
    last_ready: Option<(HistoryId, Term, Seqno)>,
}

pub struct TestServer {
    inner: Mutex<TestServerInner>,
}

impl TestServer {
    pub fn new() -> Arc<Self> {
        Arc::new(TestServer {
            inner: Mutex::new(TestServerInner::default()),
        })
    }

    pub fn set_proposer(&self, handle: ProposerHandle) {
        self.inner.lock().unwrap().proposer = Some(handle);
    }

    pub fn register_rsm(&self, handle: RsmHandle) {
        self.inner.lock().unwrap().rsms.push(handle);
    }

    fn proposer(&self) -> Option<ProposerHandle> {
        self.inner.lock().unwrap().proposer.clone()
    }
}

impl ProposerServerHandle for TestServer {
    fn proposer_ready(&self, history_id: HistoryId, term: Term, high_seqno: Seqno) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_ready = Some((history_id.clone(), term.clone(), high_seqno));
        for rsm in &inner.rsms {
            rsm.term_started(history_id.clone(), term.clone(), high_seqno);
        }
    }
}

#[async_trait]
impl RsmServerHandle for TestServer {
    async fn rsm_command(&self, _history_id: HistoryId, _term: Term, rsm_name: String, ref_: u64, command: Vec<u8>) {
        if let Some(proposer) = self.proposer() {
            proposer.submit_commands(vec![RsmCommand {
                id: ref_,
                rsm_name,
                payload: command,
            }]);
        }
    }

    async fn sync_quorum(&self, _history_id: HistoryId, _term: Term) -> Result<()> {
        match self.proposer() {
            Some(proposer) => proposer
                .sync_quorum()
                .await
                .unwrap_or_else(|_| Err(ErrorKind::LeaderGone.into())),
            None => Err(ErrorKind::NotLeader.into()),
        }
    }

    fn announce_term(&self, history_id: HistoryId, _term: Term) {
        let inner = self.inner.lock().unwrap();
        if let Some((ready_history_id, ready_term, high_seqno)) = inner.last_ready.clone() {
            if ready_history_id == history_id {
                for rsm in &inner.rsms {
                    rsm.term_started(ready_history_id.clone(), ready_term.clone(), high_seqno);
                }
            }
        }
    }
}

/// Helper exposed to tests needing the `CasConfigReply` variants by name
/// without importing the proposer module directly in every test file.
pub type CasReply = CasConfigReply;

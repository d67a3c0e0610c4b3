//! RSM runtime (C6): the per-state-machine driver that consumes committed
//! log entries in order, applies them to a user-supplied `StateMachine`, and
//! answers queries and revision-sync requests with linearizable guarantees.
//!
//! One runtime per named state machine, generic over the concrete mod type
//! so there is exactly one monomorphized instance per RSM rather than a
//! shared `dyn StateMachine`. Like the Proposer, it owns an exclusive
//! mailbox and never blocks on anything but that mailbox and the reader
//! subprocess it spawns for itself.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::agent::Agent;
use crate::config::RsmConfigTunables;
use crate::errors::{Error, ErrorKind, Result};
use crate::server::RsmServerHandle;
use crate::state_machine::{CommandOutcome, StateMachine};
use crate::sync_revision::{Generation, SyncRevisionTracker};
use crate::types::{HistoryId, LogEntry, LogValue, Metadata, NodeId, Revision, Seqno, Term};

/// Whether this runtime currently believes it is serving as leader, and if
/// so the term and the high seqno as of the moment it took over (used to
/// answer `getAppliedRevision` before any entry of the new term has
/// actually applied).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader {
        history_id: HistoryId,
        term: Term,
        term_seqno: Seqno,
    },
}

/// Which flavor of `getAppliedRevision` a caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedRevisionKind {
    /// Whatever this leader has applied so far, no cross-peer check.
    Leader,
    /// As above, but only after a read-quorum round confirms linearizability.
    Quorum,
}

pub type AppliedRevision = (HistoryId, Seqno);

/// Collaborators an RSM runtime is constructed with.
pub struct RsmDeps<M: StateMachine> {
    pub self_id: NodeId,
    pub rsm_name: String,
    pub agent: Arc<dyn Agent>,
    pub server: Arc<dyn RsmServerHandle>,
    pub config: RsmConfigTunables,
    pub mod_: M,
}

/// Everything that can arrive on an RSM runtime's mailbox.
enum RsmEvent {
    Command {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Query {
        payload: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    },
    SyncRevision {
        history_id: HistoryId,
        seqno: Seqno,
        timeout: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    GetAppliedRevision {
        kind: AppliedRevisionKind,
        reply: oneshot::Sender<Result<AppliedRevision>>,
    },
    GetAppliedRevisionQuorumDone {
        history_id: HistoryId,
        term: Term,
        reply: oneshot::Sender<Result<AppliedRevision>>,
        result: Result<()>,
    },
    TermStarted {
        history_id: HistoryId,
        term: Term,
        high_seqno: Seqno,
    },
    TermFinished {
        history_id: HistoryId,
        term: Term,
    },
    Metadata(Metadata),
    EntriesLoaded {
        up_to_seqno: Seqno,
        result: Result<Vec<LogEntry>>,
    },
    SyncRevisionTimeout {
        seqno: Seqno,
        ref_: u64,
        generation: Generation,
    },
}

/// A cheap, cloneable reference to a running RSM runtime's mailbox.
#[derive(Clone)]
pub struct RsmHandle {
    tx: mpsc::UnboundedSender<RsmEvent>,
}

impl RsmHandle {
    pub async fn command(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RsmEvent::Command { payload, reply });
        rx.await.unwrap_or_else(|_| Err(ErrorKind::LeaderGone.into()))
    }

    pub async fn query(&self, payload: Vec<u8>) -> Vec<u8> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RsmEvent::Query { payload, reply });
        rx.await.unwrap_or_default()
    }

    pub async fn sync_revision(&self, history_id: HistoryId, seqno: Seqno, timeout: Duration) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RsmEvent::SyncRevision {
            history_id,
            seqno,
            timeout,
            reply,
        });
        rx.await.unwrap_or_else(|_| Err(ErrorKind::LeaderGone.into()))
    }

    pub async fn get_applied_revision(&self, kind: AppliedRevisionKind) -> Result<AppliedRevision> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RsmEvent::GetAppliedRevision { kind, reply });
        rx.await.unwrap_or_else(|_| Err(ErrorKind::LeaderGone.into()))
    }

    pub fn term_started(&self, history_id: HistoryId, term: Term, high_seqno: Seqno) {
        let _ = self.tx.send(RsmEvent::TermStarted {
            history_id,
            term,
            high_seqno,
        });
    }

    pub fn term_finished(&self, history_id: HistoryId, term: Term) {
        let _ = self.tx.send(RsmEvent::TermFinished { history_id, term });
    }

    pub fn metadata(&self, meta: Metadata) {
        let _ = self.tx.send(RsmEvent::Metadata(meta));
    }
}

/// Spawn a new RSM runtime. Returns immediately; startup (fetching initial
/// metadata from the Agent and running `mod.init`) happens on the spawned
/// task.
pub fn spawn<M: StateMachine>(deps: RsmDeps<M>) -> RsmHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let self_tx = tx.clone();
    tokio::spawn(run(deps, self_tx, rx));
    RsmHandle { tx }
}

async fn run<M: StateMachine>(
    deps: RsmDeps<M>,
    self_tx: mpsc::UnboundedSender<RsmEvent>,
    mut events: mpsc::UnboundedReceiver<RsmEvent>,
) {
    let meta = match deps.agent.get_metadata().await {
        Ok(meta) => meta,
        Err(err) => {
            warn!(rsm_name = %deps.rsm_name, error = %err, "rsm runtime failed to fetch initial metadata");
            return;
        }
    };

    let config_payload = meta
        .config
        .state_machines()
        .get(&deps.rsm_name)
        .map(|rsm_config| rsm_config.payload.clone())
        .unwrap_or_default();
    let data = deps.mod_.init(&config_payload);

    // \S6: a freshly (re)started RSM may have missed the `termStarted` that
    // the leadership service already broadcast for this history/term before
    // this runtime subscribed; announcing ourselves prompts the Server to
    // redeliver it if one is still active rather than sitting as a Follower
    // forever.
    deps.server.announce_term(meta.history_id.clone(), meta.term.clone());

    let mut runtime = Runtime {
        deps,
        self_tx,
        role: Role::Follower,
        data: Some(data),
        applied_history_id: meta.history_id,
        applied_seqno: 0,
        available_seqno: meta.committed_seqno,
        reader_outstanding: false,
        pending_clients: BTreeMap::new(),
        next_client_ref: 0,
        sync_revision: SyncRevisionTracker::new(),
        next_sync_revision_ref: 0,
    };
    runtime.maybe_start_reader();

    loop {
        let Some(event) = events.recv().await else {
            return;
        };
        if let Err(reason) = runtime.handle_event(event).await {
            warn!(rsm_name = %runtime.deps.rsm_name, error = %reason, "rsm runtime stopped");
            runtime.shut_down(reason);
            return;
        }
    }
}

struct Runtime<M: StateMachine> {
    deps: RsmDeps<M>,
    self_tx: mpsc::UnboundedSender<RsmEvent>,
    role: Role,
    data: Option<M::Data>,
    applied_history_id: HistoryId,
    applied_seqno: Seqno,
    available_seqno: Seqno,
    reader_outstanding: bool,
    pending_clients: BTreeMap<u64, oneshot::Sender<Result<Vec<u8>>>>,
    next_client_ref: u64,
    sync_revision: SyncRevisionTracker<oneshot::Sender<Result<()>>, u64>,
    next_sync_revision_ref: u64,
}

impl<M: StateMachine> Runtime<M> {
    async fn handle_event(&mut self, event: RsmEvent) -> Result<()> {
        match event {
            RsmEvent::Command { payload, reply } => {
                self.handle_command(payload, reply).await;
                Ok(())
            }
            RsmEvent::Query { payload, reply } => {
                let data = self.data.as_ref().expect("rsm data missing between events");
                let _ = reply.send(self.deps.mod_.handle_query(data, &payload));
                Ok(())
            }
            RsmEvent::SyncRevision {
                history_id,
                seqno,
                timeout,
                reply,
            } => {
                self.handle_sync_revision(history_id, seqno, timeout, reply);
                Ok(())
            }
            RsmEvent::GetAppliedRevision { kind, reply } => {
                self.handle_get_applied_revision(kind, reply);
                Ok(())
            }
            RsmEvent::GetAppliedRevisionQuorumDone {
                history_id,
                term,
                reply,
                result,
            } => {
                self.handle_quorum_done(history_id, term, reply, result);
                Ok(())
            }
            RsmEvent::TermStarted {
                history_id,
                term,
                high_seqno,
            } => {
                self.on_term_started(history_id, term, high_seqno);
                Ok(())
            }
            RsmEvent::TermFinished { history_id, term } => {
                self.on_term_finished(history_id, term);
                Ok(())
            }
            RsmEvent::Metadata(meta) => {
                if meta.committed_seqno > self.available_seqno {
                    self.available_seqno = meta.committed_seqno;
                }
                self.maybe_start_reader();
                Ok(())
            }
            RsmEvent::EntriesLoaded { up_to_seqno, result } => {
                self.reader_outstanding = false;
                let entries = result.map_err(|_| Error::from(ErrorKind::ReaderDied))?;
                self.apply_entries(up_to_seqno, entries);
                self.maybe_start_reader();
                Ok(())
            }
            RsmEvent::SyncRevisionTimeout { seqno, ref_, generation } => {
                if let Some(entry) = self.sync_revision.take(seqno, &ref_, generation) {
                    let _ = entry.from.send(Err(ErrorKind::Timeout.into()));
                }
                Ok(())
            }
        }
    }

    async fn handle_command(&mut self, payload: Vec<u8>, reply: oneshot::Sender<Result<Vec<u8>>>) {
        let (history_id, term) = match &self.role {
            Role::Leader { history_id, term, .. } => (history_id.clone(), term.clone()),
            Role::Follower => {
                let _ = reply.send(Err(ErrorKind::NotLeader.into()));
                return;
            }
        };

        let data = self.data.as_ref().expect("rsm data missing between events");
        match self.deps.mod_.handle_command(data, &payload) {
            CommandOutcome::Reject(reply_bytes) => {
                let _ = reply.send(Ok(reply_bytes));
            }
            CommandOutcome::Apply(_speculative_data) => {
                let ref_ = self.next_client_ref;
                self.next_client_ref += 1;
                self.pending_clients.insert(ref_, reply);
                self.deps
                    .server
                    .rsm_command(history_id, term, self.deps.rsm_name.clone(), ref_, payload)
                    .await;
            }
        }
    }

    fn handle_sync_revision(
        &mut self,
        history_id: HistoryId,
        seqno: Seqno,
        timeout: Duration,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if history_id != self.applied_history_id {
            let _ = reply.send(Err(ErrorKind::HistoryMismatch(self.applied_history_id.clone()).into()));
            return;
        }
        if seqno <= self.applied_seqno {
            let _ = reply.send(Ok(()));
            return;
        }

        let ref_ = self.next_sync_revision_ref;
        self.next_sync_revision_ref += 1;
        let generation = self.sync_revision.enqueue(seqno, ref_, reply, history_id);

        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = self_tx.send(RsmEvent::SyncRevisionTimeout { seqno, ref_, generation });
        });
    }

    fn handle_get_applied_revision(&mut self, kind: AppliedRevisionKind, reply: oneshot::Sender<Result<AppliedRevision>>) {
        let (history_id, term, term_seqno) = match &self.role {
            Role::Leader {
                history_id,
                term,
                term_seqno,
            } => (history_id.clone(), term.clone(), *term_seqno),
            Role::Follower => {
                let _ = reply.send(Err(ErrorKind::NotLeader.into()));
                return;
            }
        };

        match kind {
            AppliedRevisionKind::Leader => {
                let _ = reply.send(Ok((history_id, term_seqno.max(self.applied_seqno))));
            }
            AppliedRevisionKind::Quorum => {
                let server = self.deps.server.clone();
                let self_tx = self.self_tx.clone();
                let history_for_task = history_id.clone();
                let term_for_task = term.clone();
                tokio::spawn(async move {
                    let result = server.sync_quorum(history_for_task, term_for_task).await;
                    let _ = self_tx.send(RsmEvent::GetAppliedRevisionQuorumDone {
                        history_id,
                        term,
                        reply,
                        result,
                    });
                });
            }
        }
    }

    fn handle_quorum_done(
        &mut self,
        history_id: HistoryId,
        term: Term,
        reply: oneshot::Sender<Result<AppliedRevision>>,
        result: Result<()>,
    ) {
        if let Err(err) = result {
            let _ = reply.send(Err(err));
            return;
        }
        match &self.role {
            Role::Leader {
                term: current_term,
                term_seqno,
                ..
            } if *current_term == term => {
                let _ = reply.send(Ok((history_id, self.applied_seqno.max(*term_seqno))));
            }
            _ => {
                let _ = reply.send(Err(ErrorKind::NotLeader.into()));
            }
        }
    }

    fn on_term_started(&mut self, history_id: HistoryId, term: Term, high_seqno: Seqno) {
        match &self.role {
            Role::Follower => {
                info!(?history_id, ?term, high_seqno, "rsm became leader");
                self.role = Role::Leader {
                    history_id,
                    term,
                    term_seqno: high_seqno,
                };
            }
            Role::Leader { .. } => {
                warn!(?history_id, ?term, "termStarted observed while already leader, ignoring");
            }
        }
    }

    fn on_term_finished(&mut self, history_id: HistoryId, term: Term) {
        let matches = matches!(
            &self.role,
            Role::Leader { history_id: h, term: t, .. } if *h == history_id && *t == term
        );
        if !matches {
            return;
        }
        self.role = Role::Follower;
        for (_, reply) in std::mem::take(&mut self.pending_clients) {
            let _ = reply.send(Err(ErrorKind::LeaderGone.into()));
        }
    }

    fn maybe_start_reader(&mut self) {
        if self.reader_outstanding || self.available_seqno <= self.applied_seqno {
            return;
        }
        self.reader_outstanding = true;
        let up_to_seqno = self.available_seqno;
        let agent = self.deps.agent.clone();
        let self_id = self.deps.self_id.clone();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = agent.get_full_log(self_id).await;
            let _ = self_tx.send(RsmEvent::EntriesLoaded { up_to_seqno, result });
        });
    }

    fn apply_entries(&mut self, up_to_seqno: Seqno, entries: Vec<LogEntry>) {
        let history_before = self.applied_history_id.clone();
        let mut replies: Vec<(u64, Term, Vec<u8>)> = Vec::new();

        for entry in entries
            .into_iter()
            .filter(|e| e.seqno > self.applied_seqno && e.seqno <= up_to_seqno)
        {
            let LogEntry {
                history_id,
                term,
                seqno,
                value,
            } = entry;
            match value {
                LogValue::RsmCommand(cmd) if cmd.rsm_name == self.deps.rsm_name => {
                    let revision = Revision { history_id, seqno };
                    let data = self.data.take().expect("rsm data missing between events");
                    let (reply_bytes, new_data) = self.deps.mod_.apply_command(data, &cmd.payload, revision);
                    self.data = Some(new_data);
                    replies.push((cmd.id, term, reply_bytes));
                }
                LogValue::Config(_) => {
                    if history_id != self.applied_history_id {
                        info!(old = ?self.applied_history_id, new = ?history_id, "rsm adopting new history id from config entry");
                        self.applied_history_id = history_id;
                    }
                }
                LogValue::RsmCommand(_) | LogValue::Transition(_) => {}
            }
        }

        self.applied_seqno = up_to_seqno;

        if history_before != self.applied_history_id {
            for (_, entry) in self.sync_revision.drain_history_mismatch(&self.applied_history_id) {
                let _ = entry.from.send(Err(ErrorKind::HistoryMismatch(self.applied_history_id.clone()).into()));
            }
        }
        for (_, entry) in self.sync_revision.drain_satisfied(self.applied_seqno) {
            let _ = entry.from.send(Ok(()));
        }

        if let Role::Leader { term: leader_term, .. } = &self.role {
            for (id, entry_term, reply_bytes) in replies {
                if entry_term == *leader_term {
                    if let Some(reply) = self.pending_clients.remove(&id) {
                        let _ = reply.send(Ok(reply_bytes));
                    }
                }
            }
        }
    }

    fn shut_down(mut self, reason: Error) {
        for (_, reply) in std::mem::take(&mut self.pending_clients) {
            let _ = reply.send(Err(Error::from(reason.kind().clone())));
        }
        for (_, entry) in self.sync_revision.drain_all() {
            let _ = entry.from.send(Err(Error::from(reason.kind().clone())));
        }
    }
}

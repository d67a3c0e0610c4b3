//! Proposer (C4): the leader-side state machine.
//!
//! Runs as its own task, driven by a single mailbox (`ProposerEvent`) the
//! way every component in this crate is -- the Proposer never blocks on
//! anything but its own mailbox and the Agent's synchronous `get_log`
//! backfill read (\S5). External RPCs (`establishTerm`, `append`,
//! `ensureTerm`) are fired from spawned tasks that post their result back
//! onto the same mailbox, so the state machine body never awaits a peer
//! directly.

mod establishing;
mod proposing;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::agent::{Agent, MonitorRef};
use crate::config::ProposerConfig;
use crate::errors::{Error, ErrorKind, Result};
use crate::liveness::PeerLiveness;
use crate::server::ProposerServerHandle;
use crate::types::{Config, ConfigRevision, HistoryId, NodeId, Term};

pub use proposing::ProposingState;

/// Collaborators a Proposer is constructed with. Shared as `Arc<dyn _>`
/// trait objects since the concrete Agent/Liveness/Server implementations
/// are injected per node and owned elsewhere.
#[derive(Clone)]
pub struct ProposerDeps {
    pub self_id: NodeId,
    pub agent: Arc<dyn Agent>,
    pub liveness: Arc<dyn PeerLiveness>,
    pub server: Arc<dyn ProposerServerHandle>,
    pub config: ProposerConfig,
}

/// A `casConfig` reply: either the new revision on success, or the current
/// revision the caller's expectation was compared against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasConfigReply {
    Ok(ConfigRevision),
    CasFailed(ConfigRevision),
}

/// Work a client (via the Server) submits to a live Proposer.
pub enum ClientRequest {
    /// A batch of RSM commands from a single `appendCommands` call; all
    /// entries in the batch receive strictly increasing seqnos (\S5).
    Commands(Vec<crate::types::RsmCommand>),
    CasConfig {
        expected: ConfigRevision,
        new_config: Config,
        reply: oneshot::Sender<CasConfigReply>,
    },
    SyncQuorum {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// What an outstanding `ensureTerm` probe was sent for, so its reply is
/// routed back to the right bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureTermPurpose {
    CheckPeers,
    SyncQuorum(u64),
}

/// Everything that can arrive on a Proposer's mailbox.
pub enum ProposerEvent {
    Client(ClientRequest),
    NodeUp(NodeId),
    NodeDown(NodeId),
    AgentDown { peer: NodeId, monitor_ref: MonitorRef },
    AppendReply {
        peer: NodeId,
        monitor_ref: MonitorRef,
        result: Result<crate::agent::AppendAck>,
    },
    EnsureTermReply {
        peer: NodeId,
        monitor_ref: MonitorRef,
        purpose: EnsureTermPurpose,
        result: Result<()>,
    },
}

/// A cheap, cloneable reference to a running Proposer's mailbox.
#[derive(Clone)]
pub struct ProposerHandle {
    tx: mpsc::UnboundedSender<ProposerEvent>,
}

impl ProposerHandle {
    pub fn submit_commands(&self, commands: Vec<crate::types::RsmCommand>) {
        let _ = self.tx.send(ProposerEvent::Client(ClientRequest::Commands(commands)));
    }

    pub fn cas_config(
        &self,
        expected: ConfigRevision,
        new_config: Config,
    ) -> oneshot::Receiver<CasConfigReply> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ProposerEvent::Client(ClientRequest::CasConfig {
            expected,
            new_config,
            reply,
        }));
        rx
    }

    pub fn sync_quorum(&self) -> oneshot::Receiver<Result<()>> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ProposerEvent::Client(ClientRequest::SyncQuorum { reply }));
        rx
    }

    pub fn node_up(&self, peer: NodeId) {
        let _ = self.tx.send(ProposerEvent::NodeUp(peer));
    }

    pub fn node_down(&self, peer: NodeId) {
        let _ = self.tx.send(ProposerEvent::NodeDown(peer));
    }

    pub fn agent_down(&self, peer: NodeId, monitor_ref: MonitorRef) {
        let _ = self.tx.send(ProposerEvent::AgentDown { peer, monitor_ref });
    }
}

/// Spawn a new Proposer for `(history_id, term)`. Returns immediately; the
/// `EstablishingTerm` phase runs on the spawned task.
pub fn spawn(deps: ProposerDeps, history_id: HistoryId, term: Term) -> ProposerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let self_tx = tx.clone();
    tokio::spawn(run(deps, history_id, term, self_tx, rx));
    ProposerHandle { tx }
}

async fn run(
    deps: ProposerDeps,
    history_id: HistoryId,
    term: Term,
    self_tx: mpsc::UnboundedSender<ProposerEvent>,
    mut events: mpsc::UnboundedReceiver<ProposerEvent>,
) {
    let mut queued: VecDeque<ClientRequest> = VecDeque::new();

    let established = match establishing::run(&deps, &history_id, &term, &mut events, &mut queued).await {
        Ok(established) => established,
        Err(err) => {
            warn!(?history_id, ?term, error = %err, "proposer stopped during establishing term");
            flush_queued(queued, err.kind());
            return;
        }
    };

    info!(?history_id, ?term, high_seqno = established.high_seqno, "proposer established term, entering proposing");

    let mut state = ProposingState::new(deps, history_id, term, established, self_tx);
    for queued_request in queued {
        state.handle_client_request(queued_request).await;
    }

    if let Err(err) = state.run(events).await {
        warn!(history_id = ?state.history_id, term = ?state.term, error = %err, "proposer stopped");
        state.shut_down(err);
    }
}

fn flush_queued(queued: VecDeque<ClientRequest>, kind: &ErrorKind) {
    for request in queued {
        match request {
            ClientRequest::CasConfig { reply, .. } => {
                // The caller sees a dropped oneshot as "leaderGone"-equivalent;
                // there is no revision to report since we never got to propose.
                drop(reply);
            }
            ClientRequest::SyncQuorum { reply } => {
                let _ = reply.send(Err(Error::from(kind.clone())));
            }
            ClientRequest::Commands(_) => {}
        }
    }
}

//! `Proposing` (\S4.4): the steady-state leader loop.

use std::collections::{BTreeMap, VecDeque};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::establishing::Established;
use super::{CasConfigReply, ClientRequest, EnsureTermPurpose, ProposerDeps, ProposerEvent};
use crate::agent::MonitorRef;
use crate::errors::{Error, ErrorKind, Result};
use crate::peer_status::{self, PeerStatus, PeerStatusTable};
use crate::pending_log::PendingLog;
use crate::quorum::Quorum;
use crate::sync_quorum::{SyncOutcome, SyncQuorumTracker};
use crate::types::{
    ActiveConfig, Branch, Config, ConfigRevision, HistoryId, LogEntry, LogValue, NodeId, RsmCommand,
    Seqno, Term, Transition,
};

pub struct ProposingState {
    deps: ProposerDeps,
    self_tx: mpsc::UnboundedSender<ProposerEvent>,
    pub history_id: HistoryId,
    pub term: Term,
    quorum: Quorum,
    peer_statuses: PeerStatusTable,
    pending: PendingLog,
    committed_seqno: Seqno,
    high_seqno: Seqno,
    pending_high_seqno: Seqno,
    config: ActiveConfig,
    config_revision: ConfigRevision,
    config_change_from: Option<oneshot::Sender<CasConfigReply>>,
    postponed_config_requests: VecDeque<(ConfigRevision, Config, oneshot::Sender<CasConfigReply>)>,
    sync_quorum: SyncQuorumTracker<u64>,
    next_sync_ref: u64,
    pending_sync_replies: BTreeMap<u64, oneshot::Sender<Result<()>>>,
    monitor_refs: BTreeMap<NodeId, MonitorRef>,
    pending_branch: Option<Branch>,
}

impl ProposingState {
    pub fn new(
        deps: ProposerDeps,
        history_id: HistoryId,
        term: Term,
        established: Established,
        self_tx: mpsc::UnboundedSender<ProposerEvent>,
    ) -> Self {
        ProposingState {
            deps,
            self_tx,
            history_id,
            term,
            quorum: established.quorum,
            peer_statuses: established.peer_statuses,
            pending: PendingLog::new(),
            committed_seqno: established.committed_seqno,
            high_seqno: established.high_seqno,
            pending_high_seqno: established.high_seqno,
            config: established.config,
            config_revision: established.config_revision,
            config_change_from: None,
            postponed_config_requests: VecDeque::new(),
            sync_quorum: SyncQuorumTracker::new(),
            next_sync_ref: 0,
            pending_sync_replies: BTreeMap::new(),
            monitor_refs: established.monitor_refs,
            pending_branch: established.pending_branch,
        }
    }

    /// Drives the `Proposing` loop until a fatal error stops it.
    pub async fn run(&mut self, mut events: mpsc::UnboundedReceiver<ProposerEvent>) -> Result<()> {
        self.deps
            .server
            .proposer_ready(self.history_id.clone(), self.term.clone(), self.high_seqno);

        if let Some(branch) = self.pending_branch.take() {
            self.resolve_branch(branch);
        }
        self.postcommit_housekeeping();
        self.replicate().await;

        let mut check_peers = tokio::time::interval(self.deps.config.check_peers_interval);
        check_peers.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so the interval lines
        // up with `check_peers_interval` from entry, matching the spec's
        // "schedule a periodic tick" rather than "probe immediately".
        check_peers.tick().await;

        loop {
            tokio::select! {
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_event(event).await?,
                        None => return Ok(()),
                    }
                }
                _ = check_peers.tick() => {
                    self.on_check_peers_tick().await;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: ProposerEvent) -> Result<()> {
        match event {
            ProposerEvent::Client(request) => {
                self.handle_client_request(request).await;
                Ok(())
            }
            ProposerEvent::NodeUp(peer) => {
                self.on_node_up(peer).await;
                Ok(())
            }
            ProposerEvent::NodeDown(_) => Ok(()),
            ProposerEvent::AgentDown { peer, monitor_ref } => self.on_agent_down(peer, monitor_ref).await,
            ProposerEvent::AppendReply { peer, monitor_ref, result } => {
                self.handle_append_reply(peer, monitor_ref, result).await
            }
            ProposerEvent::EnsureTermReply {
                peer,
                monitor_ref,
                purpose,
                result,
            } => {
                self.handle_ensure_term_reply(peer, monitor_ref, purpose, result).await;
                Ok(())
            }
        }
    }

    pub async fn handle_client_request(&mut self, request: ClientRequest) {
        match request {
            ClientRequest::Commands(commands) => self.handle_commands(commands).await,
            ClientRequest::CasConfig {
                expected,
                new_config,
                reply,
            } => self.handle_cas_config(expected, new_config, reply).await,
            ClientRequest::SyncQuorum { reply } => self.handle_sync_quorum(reply).await,
        }
    }

    /// Flushes every client still waiting on this proposer with `reason`,
    /// called once on shutdown (\S4.4.8).
    pub fn shut_down(mut self, reason: Error) {
        if let Some(reply) = self.config_change_from.take() {
            drop(reply);
        }
        for (_, _, reply) in self.postponed_config_requests.drain(..) {
            drop(reply);
        }
        for (_, reply) in self.pending_sync_replies.drain(..) {
            let _ = reply.send(Err(Error::from(reason.kind().clone())));
        }
        warn!(history_id = ?self.history_id, term = ?self.term, error = %reason, "flushing pending requests on proposer shutdown");
    }

    // ---- \S4.4.1 append path -------------------------------------------------

    async fn handle_commands(&mut self, commands: Vec<RsmCommand>) {
        let mut appended = false;
        for command in commands {
            if !self.config.state_machines().contains_key(&command.rsm_name) {
                warn!(rsm_name = %command.rsm_name, "command addressed to unknown rsm, dropped");
                continue;
            }
            let seqno = self.pending_high_seqno + 1;
            self.pending.push(LogEntry {
                history_id: self.history_id.clone(),
                term: self.term.clone(),
                seqno,
                value: LogValue::RsmCommand(command),
            });
            self.pending_high_seqno = seqno;
            appended = true;
        }
        if appended {
            self.replicate().await;
        }
    }

    async fn entries_for_peer(&self, from: Seqno, to: Seqno) -> Result<Vec<LogEntry>> {
        if from >= to {
            return Ok(Vec::new());
        }
        match self.pending.oldest_seqno() {
            Some(oldest) if oldest > from + 1 => {
                let mut entries = self
                    .deps
                    .agent
                    .get_log(self.history_id.clone(), self.term.clone(), from, oldest - 1)
                    .await?;
                entries.extend(self.pending.range(oldest - 1, to).cloned());
                Ok(entries)
            }
            Some(_) => Ok(self.pending.range(from, to).cloned().collect()),
            None => {
                self.deps
                    .agent
                    .get_log(self.history_id.clone(), self.term.clone(), from, to)
                    .await
            }
        }
    }

    pub async fn replicate(&mut self) {
        let peers: Vec<NodeId> = self.peer_statuses.peers().cloned().collect();
        for peer in peers {
            self.replicate_to_peer(peer).await;
        }
    }

    async fn replicate_to_peer(&mut self, peer: NodeId) {
        let status = match self.peer_statuses.get(&peer) {
            Some(status) => status.clone(),
            None => return,
        };
        if !status.needs_replication(self.pending_high_seqno, self.committed_seqno) {
            return;
        }

        let from = status.sent_seqno;
        let to = self.pending_high_seqno;
        let entries = match self.entries_for_peer(from, to).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(%peer, error = %e, "failed to assemble replication batch for peer, will retry");
                return;
            }
        };

        if let Some(s) = self.peer_statuses.get_mut(&peer) {
            s.record_sent(to, self.committed_seqno);
        }

        let agent = self.deps.agent.clone();
        let history_id = self.history_id.clone();
        let term = self.term.clone();
        let committed = self.committed_seqno;
        let monitor_ref = self.monitor_ref_for(&peer);
        let tx = self.self_tx.clone();
        let peer_for_task = peer.clone();
        tokio::spawn(async move {
            let result = agent.append(peer_for_task.clone(), history_id, term, committed, entries).await;
            let _ = tx.send(ProposerEvent::AppendReply {
                peer: peer_for_task,
                monitor_ref,
                result,
            });
        });
    }

    fn monitor_ref_for(&mut self, peer: &NodeId) -> MonitorRef {
        if let Some(r) = self.monitor_refs.get(peer) {
            return *r;
        }
        let r = self.deps.agent.monitor(peer.clone());
        self.monitor_refs.insert(peer.clone(), r);
        r
    }

    fn is_current_monitor_ref(&self, peer: &NodeId, monitor_ref: MonitorRef) -> bool {
        self.monitor_refs.get(peer) == Some(&monitor_ref)
    }

    // ---- \S4.4.2 commit advancement ------------------------------------------

    async fn handle_append_reply(
        &mut self,
        peer: NodeId,
        monitor_ref: MonitorRef,
        result: Result<crate::agent::AppendAck>,
    ) -> Result<()> {
        if !self.is_current_monitor_ref(&peer, monitor_ref) {
            debug!(%peer, "discarding stale append reply");
            return Ok(());
        }
        match result {
            Ok(ack) => {
                if let Some(s) = self.peer_statuses.get_mut(&peer) {
                    s.record_acked(ack.high_seqno, ack.committed_seqno);
                }
                self.recompute_commit_and_followup().await;
                Ok(())
            }
            Err(e) => match e.kind() {
                ErrorKind::ConflictingTerm(t) => Err(ErrorKind::ConflictingTerm(t.clone()).into()),
                ErrorKind::HistoryMismatch(h) => Err(ErrorKind::HistoryMismatch(h.clone()).into()),
                ErrorKind::MissingEntries(meta) => {
                    let status = PeerStatus::from_promise(meta.term_voted.as_ref(), &self.term, meta.committed_seqno, meta.high_seqno);
                    if status.needs_sync {
                        debug!(%peer, "needs-sync set from promise");
                    }
                    self.peer_statuses.insert(peer.clone(), status);
                    self.replicate().await;
                    Ok(())
                }
                _ => Err(ErrorKind::UnexpectedError(format!("{}", e)).into()),
            },
        }
    }

    fn try_advance_commit(&mut self) -> bool {
        match peer_status::deduce_commit(&self.peer_statuses, &self.quorum) {
            Some(deduced) if deduced > self.committed_seqno => {
                debug!(from = self.committed_seqno, to = deduced, "commit advanced");
                self.committed_seqno = deduced;
                self.high_seqno = self.high_seqno.max(deduced);
                true
            }
            _ => false,
        }
    }

    async fn recompute_commit_and_followup(&mut self) {
        if self.try_advance_commit() {
            self.pending.drop_committed(self.committed_seqno);
            self.postcommit_housekeeping();
            self.reevaluate_sync_quorum();
        }
        self.replicate().await;
    }

    // ---- \S4.4.3 CAS config ---------------------------------------------------

    fn config_commit_pending(&self) -> bool {
        self.config_revision.seqno > self.committed_seqno
    }

    async fn handle_cas_config(
        &mut self,
        expected: ConfigRevision,
        new_config: Config,
        reply: oneshot::Sender<CasConfigReply>,
    ) {
        if expected != self.config_revision {
            let _ = reply.send(CasConfigReply::CasFailed(self.config_revision.clone()));
            return;
        }
        if self.config_commit_pending() {
            self.postponed_config_requests.push_back((expected, new_config, reply));
            return;
        }
        self.propose_transition(new_config);
        self.config_change_from = Some(reply);
        self.replicate().await;
    }

    fn propose_transition(&mut self, new_config: Config) {
        let current = match &self.config {
            ActiveConfig::Stable(c) => c.clone(),
            ActiveConfig::InTransition(t) => t.current.clone(),
        };
        let transition = Transition {
            current,
            future: new_config,
        };
        let seqno = self.pending_high_seqno + 1;
        self.pending.push(LogEntry {
            history_id: self.history_id.clone(),
            term: self.term.clone(),
            seqno,
            value: LogValue::Transition(transition.clone()),
        });
        self.pending_high_seqno = seqno;
        self.config = ActiveConfig::InTransition(transition);
        self.config_revision = ConfigRevision {
            history_id: self.history_id.clone(),
            term: self.term.clone(),
            seqno,
        };
        self.quorum = Quorum::for_active_config(&self.deps.self_id, &self.config);
        self.sync_new_peers();
        self.reevaluate_sync_quorum();
        info!(seqno, voters = ?self.quorum.peers(), "proposed joint transition");
    }

    fn sync_new_peers(&mut self) {
        for peer in self.quorum.peers() {
            if !self.peer_statuses.contains(&peer) {
                self.peer_statuses.insert(peer, PeerStatus::default());
            }
        }
    }

    // ---- \S4.4.4 branch resolution --------------------------------------------

    fn resolve_branch(&mut self, branch: Branch) {
        self.high_seqno = self.committed_seqno;
        self.pending_high_seqno = self.committed_seqno;
        self.pending = PendingLog::new();

        let state_machines = self.config.state_machines().clone();
        let new_config = Config {
            voters: branch.peers.clone(),
            state_machines,
        };
        let seqno = self.pending_high_seqno + 1;
        self.pending.push(LogEntry {
            history_id: self.history_id.clone(),
            term: self.term.clone(),
            seqno,
            value: LogValue::Config(new_config.clone()),
        });
        self.pending_high_seqno = seqno;

        self.config = ActiveConfig::Stable(new_config);
        self.config_revision = ConfigRevision {
            history_id: self.history_id.clone(),
            term: self.term.clone(),
            seqno,
        };
        self.quorum = Quorum::for_branch(&branch.peers);
        self.peer_statuses.clear();
        for peer in &branch.peers {
            self.peer_statuses.insert(peer.clone(), PeerStatus::default());
        }
        self.config_change_from = None;
        for (_, _, reply) in self.postponed_config_requests.drain(..) {
            drop(reply);
        }

        warn!(peers = ?branch.peers, seqno, "resolved pending branch by forcing config to surviving peer set");
    }

    // ---- \S4.4.5 post-commit housekeeping --------------------------------------

    fn postcommit_housekeeping(&mut self) {
        if let ActiveConfig::InTransition(transition) = self.config.clone() {
            if self.config_revision.seqno <= self.committed_seqno {
                let future = transition.future;
                let seqno = self.pending_high_seqno + 1;
                self.pending.push(LogEntry {
                    history_id: self.history_id.clone(),
                    term: self.term.clone(),
                    seqno,
                    value: LogValue::Config(future.clone()),
                });
                self.pending_high_seqno = seqno;
                self.config = ActiveConfig::Stable(future);
                self.config_revision = ConfigRevision {
                    history_id: self.history_id.clone(),
                    term: self.term.clone(),
                    seqno,
                };
                self.quorum = Quorum::for_active_config(&self.deps.self_id, &self.config);
                self.sync_new_peers();
                info!(seqno, "transition committed, proposing resulting stable config");
                return;
            }
        }

        if matches!(self.config, ActiveConfig::Stable(_)) && self.config_revision.seqno <= self.committed_seqno {
            if let Some(reply) = self.config_change_from.take() {
                let _ = reply.send(CasConfigReply::Ok(self.config_revision.clone()));
            }
        }

        while let Some((expected, new_config, reply)) = self.postponed_config_requests.pop_front() {
            if expected != self.config_revision {
                let _ = reply.send(CasConfigReply::CasFailed(self.config_revision.clone()));
                continue;
            }
            if self.config_commit_pending() {
                self.postponed_config_requests.push_front((expected, new_config, reply));
                break;
            }
            self.propose_transition(new_config);
            self.config_change_from = Some(reply);
            break;
        }
    }

    // ---- \S4.4.6 sync-quorum ----------------------------------------------------

    async fn handle_sync_quorum(&mut self, reply: oneshot::Sender<Result<()>>) {
        let ref_ = self.next_sync_ref;
        self.next_sync_ref += 1;

        let all_peers = self.quorum.peers();
        let live_peers = self.deps.liveness.get_live_peers().await;
        let failed_votes = all_peers.difference(&live_peers).cloned().collect();
        self.sync_quorum.start(ref_, failed_votes);

        if let Some(resolved) = self.resolve_immediately_if_settled(ref_) {
            let _ = reply.send(resolved);
            return;
        }
        self.pending_sync_replies.insert(ref_, reply);

        for peer in live_peers.intersection(&all_peers) {
            self.send_ensure_term(peer.clone(), EnsureTermPurpose::SyncQuorum(ref_));
        }
    }

    fn resolve_immediately_if_settled(&mut self, ref_: u64) -> Option<Result<()>> {
        let resolved = self.sync_quorum.record_vote(&self.quorum.peers(), &self.quorum, &self.deps.self_id, true);
        for (request, outcome) in resolved {
            if request.ref_ == ref_ {
                return Some(Self::sync_outcome_to_result(outcome));
            }
        }
        None
    }

    fn sync_outcome_to_result(outcome: SyncOutcome) -> Result<()> {
        match outcome {
            SyncOutcome::Satisfied => Ok(()),
            SyncOutcome::Infeasible => Err(ErrorKind::NoQuorum.into()),
            SyncOutcome::Pending => unreachable!("caller only converts resolved outcomes"),
        }
    }

    fn send_ensure_term(&mut self, peer: NodeId, purpose: EnsureTermPurpose) {
        let agent = self.deps.agent.clone();
        let history_id = self.history_id.clone();
        let term = self.term.clone();
        let monitor_ref = self.monitor_ref_for(&peer);
        let tx = self.self_tx.clone();
        let peer_for_task = peer.clone();
        tokio::spawn(async move {
            let result = agent.ensure_term(peer_for_task.clone(), history_id, term).await;
            let _ = tx.send(ProposerEvent::EnsureTermReply {
                peer: peer_for_task,
                monitor_ref,
                purpose,
                result,
            });
        });
    }

    fn reevaluate_sync_quorum(&mut self) {
        let peers = self.quorum.peers();
        let resolved = self.sync_quorum.reevaluate_all(&peers, &self.quorum);
        self.complete_sync_requests(resolved);
    }

    fn complete_sync_requests(&mut self, resolved: Vec<(crate::sync_quorum::SyncRequest<u64>, SyncOutcome)>) {
        for (request, outcome) in resolved {
            if let Some(reply) = self.pending_sync_replies.remove(&request.ref_) {
                let _ = reply.send(Self::sync_outcome_to_result(outcome));
            }
        }
    }

    // ---- \S4.4.7 peer liveness integration --------------------------------------

    async fn on_node_up(&mut self, peer: NodeId) {
        if self.quorum.peers().contains(&peer) {
            self.send_ensure_term(peer, EnsureTermPurpose::CheckPeers);
        }
    }

    async fn on_agent_down(&mut self, peer: NodeId, monitor_ref: MonitorRef) -> Result<()> {
        if !self.is_current_monitor_ref(&peer, monitor_ref) {
            return Ok(());
        }
        if peer == self.deps.self_id {
            return Err(ErrorKind::AgentTerminated.into());
        }
        self.peer_statuses.remove(&peer);
        self.monitor_refs.remove(&peer);
        let peers = self.quorum.peers();
        let resolved = self.sync_quorum.peer_down(&peers, &self.quorum, &peer);
        self.complete_sync_requests(resolved);
        self.recompute_commit_and_followup().await;
        Ok(())
    }

    async fn on_check_peers_tick(&mut self) {
        let live_peers = self.deps.liveness.get_live_peers().await;
        let unmonitored: Vec<NodeId> = self
            .quorum
            .peers()
            .into_iter()
            .filter(|p| live_peers.contains(p) && !self.peer_statuses.contains(p))
            .collect();
        for peer in unmonitored {
            self.send_ensure_term(peer, EnsureTermPurpose::CheckPeers);
        }
    }

    async fn handle_ensure_term_reply(
        &mut self,
        peer: NodeId,
        monitor_ref: MonitorRef,
        purpose: EnsureTermPurpose,
        result: Result<()>,
    ) {
        if !self.is_current_monitor_ref(&peer, monitor_ref) {
            debug!(%peer, "discarding stale ensureTerm reply");
            return;
        }
        match purpose {
            EnsureTermPurpose::CheckPeers => {
                if result.is_ok() && !self.peer_statuses.contains(&peer) {
                    self.peer_statuses.insert(peer.clone(), PeerStatus::default());
                    self.replicate_to_peer(peer).await;
                }
            }
            EnsureTermPurpose::SyncQuorum(ref_) => {
                let peers = self.quorum.peers();
                let resolved = self
                    .sync_quorum
                    .record_vote(&peers, &self.quorum, &peer, result.is_ok());
                self.complete_sync_requests(resolved);
                let _ = ref_;
            }
        }
    }
}

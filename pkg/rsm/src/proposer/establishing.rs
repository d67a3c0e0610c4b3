//! `EstablishingTerm` (\S4.4): collect a quorum of promises before becoming
//! a usable leader.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ClientRequest, ProposerDeps, ProposerEvent};
use crate::agent::MonitorRef;
use crate::errors::{Error, ErrorKind, Result};
use crate::peer_status::{PeerStatus, PeerStatusTable};
use crate::quorum::Quorum;
use crate::types::{Branch, ConfigRevision, HistoryId, LogPosition, NodeId, Seqno, Term};

/// Everything `proposing::ProposingState` needs to start up, handed off by
/// a successful `run`.
pub struct Established {
    pub quorum: Quorum,
    pub peer_statuses: PeerStatusTable,
    pub committed_seqno: Seqno,
    pub high_seqno: Seqno,
    pub config: crate::types::ActiveConfig,
    pub config_revision: ConfigRevision,
    pub pending_branch: Option<Branch>,
    pub monitor_refs: BTreeMap<NodeId, MonitorRef>,
}

pub async fn run(
    deps: &ProposerDeps,
    history_id: &HistoryId,
    term: &Term,
    events: &mut mpsc::UnboundedReceiver<ProposerEvent>,
    queued: &mut VecDeque<ClientRequest>,
) -> Result<Established> {
    let local_meta = deps
        .agent
        .establish_local_term(history_id.clone(), term.clone())
        .await
        .map_err(|_| Error::from(ErrorKind::LocalEstablishTermFailed))?;

    // \S4.4: peers (and thus the quorum we establish against) respect a
    // pending branch -- a catastrophic quorum loss means the old config's
    // majority may never be reachable again, so establishing must only
    // require unanimity of the branch's surviving peer set instead.
    let quorum = match &local_meta.pending_branch {
        Some(branch) => Quorum::for_branch(&branch.peers),
        None => Quorum::for_active_config(&deps.self_id, &local_meta.config),
    };
    let peers = quorum.peers();
    let live_peers = deps.liveness.get_live_peers().await;
    let mut failed_votes: BTreeSet<NodeId> = peers.difference(&live_peers).cloned().collect();

    if !quorum.feasible(&peers, &failed_votes) {
        return Err(ErrorKind::NoQuorum.into());
    }

    let mut votes: BTreeSet<NodeId> = BTreeSet::new();
    let mut peer_statuses = PeerStatusTable::new();
    let mut committed_seqno = local_meta.committed_seqno;
    let mut monitor_refs: BTreeMap<NodeId, MonitorRef> = BTreeMap::new();
    monitor_refs.insert(deps.self_id.clone(), deps.agent.monitor(deps.self_id.clone()));

    // Synthesized self-vote: a loopback `establishTerm` would always
    // succeed with our own just-fetched metadata, so skip the round trip.
    votes.insert(deps.self_id.clone());
    let self_status = PeerStatus::from_promise(
        local_meta.term_voted.as_ref(),
        term,
        local_meta.committed_seqno,
        local_meta.high_seqno,
    );
    if self_status.needs_sync {
        debug!(peer = %deps.self_id, "needs-sync set from promise");
    }
    peer_statuses.insert(deps.self_id.clone(), self_status);

    if quorum.have_quorum(&votes) {
        return Ok(Established {
            quorum,
            peer_statuses,
            committed_seqno,
            high_seqno: local_meta.high_seqno,
            config: local_meta.config,
            config_revision: local_meta.config_revision,
            pending_branch: local_meta.pending_branch,
            monitor_refs,
        });
    }

    let to_probe: Vec<NodeId> = peers
        .iter()
        .filter(|p| **p != deps.self_id && live_peers.contains(*p))
        .cloned()
        .collect();

    let mut in_flight = FuturesUnordered::new();
    for peer in to_probe {
        let agent = deps.agent.clone();
        let history_id = history_id.clone();
        let term = term.clone();
        let log_position = LogPosition {
            term: term.clone(),
            seqno: local_meta.high_seqno,
        };
        let monitor_ref = deps.agent.monitor(peer.clone());
        monitor_refs.insert(peer.clone(), monitor_ref);
        in_flight.push(async move {
            let result = agent.establish_term(peer.clone(), history_id, term, log_position).await;
            (peer, monitor_ref, result)
        });
    }

    let deadline = tokio::time::sleep(deps.config.establish_term_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                return Err(ErrorKind::EstablishTermTimeout.into());
            }
            maybe_reply = in_flight.next(), if !in_flight.is_empty() => {
                let Some((peer, _monitor_ref, reply)) = maybe_reply else { continue };
                match reply {
                    Ok(meta) => {
                        committed_seqno = committed_seqno.max(meta.committed_seqno);
                        let status = PeerStatus::from_promise(meta.term_voted.as_ref(), term, meta.committed_seqno, meta.high_seqno);
                        if status.needs_sync {
                            debug!(%peer, "needs-sync set from promise");
                        }
                        peer_statuses.insert(peer.clone(), status);
                        votes.insert(peer);
                    }
                    Err(e) => match e.kind() {
                        ErrorKind::Behind(_) => {
                            debug!(%peer, "peer reported behind during establish, counted as failed vote");
                            failed_votes.insert(peer);
                        }
                        ErrorKind::ConflictingTerm(t) => return Err(ErrorKind::ConflictingTerm(t.clone()).into()),
                        ErrorKind::HistoryMismatch(h) => return Err(ErrorKind::HistoryMismatch(h.clone()).into()),
                        _ => return Err(ErrorKind::UnexpectedError(format!("{}", e)).into()),
                    },
                }

                if quorum.have_quorum(&votes) {
                    return Ok(Established {
                        quorum,
                        peer_statuses,
                        committed_seqno,
                        high_seqno: local_meta.high_seqno,
                        config: local_meta.config,
                        config_revision: local_meta.config_revision,
                        pending_branch: local_meta.pending_branch,
                        monitor_refs,
                    });
                }
                if !quorum.feasible(&peers, &failed_votes) {
                    return Err(ErrorKind::NoQuorum.into());
                }
            }
            Some(event) = events.recv() => {
                match event {
                    ProposerEvent::NodeDown(p) if peers.contains(&p) => {
                        failed_votes.insert(p);
                        if !quorum.feasible(&peers, &failed_votes) {
                            return Err(ErrorKind::NoQuorum.into());
                        }
                    }
                    ProposerEvent::AgentDown { peer, .. } if peer == deps.self_id => {
                        return Err(ErrorKind::AgentTerminated.into());
                    }
                    ProposerEvent::AgentDown { peer, .. } if peers.contains(&peer) => {
                        failed_votes.insert(peer);
                        if !quorum.feasible(&peers, &failed_votes) {
                            return Err(ErrorKind::NoQuorum.into());
                        }
                    }
                    ProposerEvent::Client(request) => {
                        // Not ready to serve client work yet; hold it for
                        // replay once Proposing starts.
                        queued.push_back(request);
                    }
                    // `NodeUp` is ignored while establishing (\S4.4.7): the
                    // initial peer set from metadata is authoritative.
                    _ => {}
                }
            }
        }
    }
}

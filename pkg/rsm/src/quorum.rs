//! Quorum algebra (C1).
//!
//! A `Quorum` is a small tree over three node kinds. It is evaluated against
//! a vote set (`haveQuorum`) and, during replication, against the set of
//! peers known to have failed (`feasible`) so the Proposer can abort the
//! instant progress becomes impossible rather than waiting on a majority
//! that can never arrive.

use std::collections::BTreeSet;

use crate::types::{ActiveConfig, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Quorum {
    All(BTreeSet<NodeId>),
    Majority(BTreeSet<NodeId>),
    Joint(Box<Quorum>, Box<Quorum>),
}

impl Quorum {
    pub fn all(members: impl IntoIterator<Item = NodeId>) -> Self {
        Quorum::All(members.into_iter().collect())
    }

    pub fn majority(members: impl IntoIterator<Item = NodeId>) -> Self {
        Quorum::Majority(members.into_iter().collect())
    }

    pub fn joint(a: Quorum, b: Quorum) -> Self {
        Quorum::Joint(Box::new(a), Box::new(b))
    }

    /// The effective quorum for a stable config, requiring `self` plus a
    /// majority of `voters`.
    pub fn for_config(self_id: &NodeId, voters: &BTreeSet<NodeId>) -> Self {
        Quorum::joint(
            Quorum::all([self_id.clone()]),
            Quorum::majority(voters.clone()),
        )
    }

    /// The effective quorum for a joint transition: `self` plus majorities of
    /// both the outgoing and incoming voter sets.
    pub fn for_transition(
        self_id: &NodeId,
        current_voters: &BTreeSet<NodeId>,
        future_voters: &BTreeSet<NodeId>,
    ) -> Self {
        Quorum::joint(
            Quorum::all([self_id.clone()]),
            Quorum::joint(
                Quorum::majority(current_voters.clone()),
                Quorum::majority(future_voters.clone()),
            ),
        )
    }

    /// The effective quorum while resolving a branch: unanimity of the
    /// branch's surviving peer set.
    pub fn for_branch(peers: &BTreeSet<NodeId>) -> Self {
        Quorum::All(peers.clone())
    }

    /// The effective quorum of an active (possibly in-transition) config.
    pub fn for_active_config(self_id: &NodeId, config: &ActiveConfig) -> Self {
        match config {
            ActiveConfig::Stable(c) => Quorum::for_config(self_id, &c.voters),
            ActiveConfig::InTransition(t) => {
                Quorum::for_transition(self_id, &t.current.voters, &t.future.voters)
            }
        }
    }

    /// The union of all node sets appearing anywhere in this quorum tree.
    pub fn peers(&self) -> BTreeSet<NodeId> {
        match self {
            Quorum::All(s) | Quorum::Majority(s) => s.clone(),
            Quorum::Joint(a, b) => a.peers().union(&b.peers()).cloned().collect(),
        }
    }

    /// Whether `votes` satisfies this quorum tree.
    pub fn have_quorum(&self, votes: &BTreeSet<NodeId>) -> bool {
        match self {
            Quorum::All(s) => s.is_subset(votes),
            Quorum::Majority(s) => {
                if s.is_empty() {
                    // An empty voter set can never be satisfied by a real
                    // majority; treat as unreachable rather than vacuously
                    // true so callers don't mistake "no cluster" for quorum.
                    false
                } else {
                    let have = s.intersection(votes).count();
                    have * 2 > s.len()
                }
            }
            Quorum::Joint(a, b) => a.have_quorum(votes) && b.have_quorum(votes),
        }
    }

    /// Whether it is still *possible* to reach this quorum given the known
    /// universe of peers and the subset of them already known to have
    /// failed.
    pub fn feasible(&self, all_peers: &BTreeSet<NodeId>, failed_votes: &BTreeSet<NodeId>) -> bool {
        let reachable: BTreeSet<NodeId> = all_peers.difference(failed_votes).cloned().collect();
        self.have_quorum(&reachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<NodeId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn majority_needs_strict_half_plus_one() {
        let q = Quorum::majority(set(&["a", "b", "c"]));
        assert!(!q.have_quorum(&set(&["a"])));
        assert!(q.have_quorum(&set(&["a", "b"])));
        assert!(q.have_quorum(&set(&["a", "b", "c"])));
    }

    #[test]
    fn all_requires_every_member() {
        let q = Quorum::all(["a".to_string(), "b".to_string()]);
        assert!(!q.have_quorum(&set(&["a"])));
        assert!(q.have_quorum(&set(&["a", "b"])));
        assert!(q.have_quorum(&set(&["a", "b", "c"])));
    }

    #[test]
    fn joint_requires_both_sides() {
        let q = Quorum::for_config(&"a".to_string(), &set(&["a", "b", "c"]));
        assert!(!q.have_quorum(&set(&["b", "c"]))); // missing self
        assert!(!q.have_quorum(&set(&["a"]))); // missing majority
        assert!(q.have_quorum(&set(&["a", "b"])));
    }

    #[test]
    fn transition_requires_both_majorities_and_self() {
        let q = Quorum::for_transition(&"a".to_string(), &set(&["a", "b", "c"]), &set(&["a", "b", "d"]));
        // {a,b} satisfies both majorities (a,b in both sets) and self.
        assert!(q.have_quorum(&set(&["a", "b"])));
        // {a,c,d} satisfies self + old majority {a,c} but not new majority (only a).
        assert!(!q.have_quorum(&set(&["a", "c", "d"])));
    }

    #[test]
    fn peers_of_well_formed_quorum_satisfies_it() {
        // R2: haveQuorum(peers(Q), Q) holds for every well-formed quorum Q.
        let configs: Vec<Quorum> = vec![
            Quorum::for_config(&"a".to_string(), &set(&["a", "b", "c"])),
            Quorum::for_transition(&"a".to_string(), &set(&["a", "b", "c"]), &set(&["a", "d", "e"])),
            Quorum::for_branch(&set(&["a", "b"])),
        ];
        for q in configs {
            let all = q.peers();
            assert!(q.have_quorum(&all), "quorum {:?} not satisfied by its own peers", q);
        }
    }

    #[test]
    fn feasible_false_once_too_many_failed() {
        let q = Quorum::for_config(&"a".to_string(), &set(&["a", "b", "c", "d", "e"]));
        let all = set(&["a", "b", "c", "d", "e"]);
        assert!(q.feasible(&all, &set(&["b", "c"])));
        assert!(!q.feasible(&all, &set(&["b", "c", "d"])));
    }

    #[test]
    fn branch_quorum_requires_unanimity() {
        let q = Quorum::for_branch(&set(&["a", "b"]));
        assert!(!q.have_quorum(&set(&["a"])));
        assert!(q.have_quorum(&set(&["a", "b"])));
    }
}

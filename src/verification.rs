use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::TiePolicy;
use crate::model::{Deal, JobId, NodeId, VerificationResult, VerifierKind};

/// Decides whether two proposals count as the same result. Pluggable per
/// verifier kind: byte equality, external approval, or trust-all.
pub trait ProposalComparator: Send + Sync {
    fn same(&self, a: &[u8], b: &[u8]) -> bool;
}

/// Proposals must match byte for byte (deterministic verifier).
pub struct ExactMatch;

impl ProposalComparator for ExactMatch {
    fn same(&self, a: &[u8], b: &[u8]) -> bool {
        a == b
    }
}

/// Every proposal counts as the same result (no-op verifier).
pub struct TrustAll;

impl ProposalComparator for TrustAll {
    fn same(&self, _a: &[u8], _b: &[u8]) -> bool {
        true
    }
}

/// External party that vouches for individual proposals.
pub trait ProposalApprover: Send + Sync {
    fn approve(&self, proposal: &[u8]) -> bool;
}

/// Proposals are equivalent when the external approver gives both the same
/// verdict, so approved proposals pool into one class and rejected ones
/// into another.
pub struct ExternalApproval {
    approver: Arc<dyn ProposalApprover>,
}

impl ExternalApproval {
    pub fn new(approver: Arc<dyn ProposalApprover>) -> Self {
        Self { approver }
    }
}

impl ProposalComparator for ExternalApproval {
    fn same(&self, a: &[u8], b: &[u8]) -> bool {
        self.approver.approve(a) == self.approver.approve(b)
    }
}

/// The comparator a verifier kind implies. Returns `None` when the kind
/// needs an approver and none is configured; submission refuses such jobs
/// up front rather than falling back to byte equality.
pub fn comparator_for(
    kind: VerifierKind,
    approver: Option<&Arc<dyn ProposalApprover>>,
) -> Option<Box<dyn ProposalComparator>> {
    match kind {
        VerifierKind::Noop => Some(Box::new(TrustAll)),
        VerifierKind::Deterministic => Some(Box::new(ExactMatch)),
        VerifierKind::ExternalApproval => approver
            .map(|approver| Box::new(ExternalApproval::new(approver.clone())) as Box<dyn ProposalComparator>),
    }
}

/// Outcome of resolving a shard's proposals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The shard-level result: `complete` is always true here; `result`
    /// says whether any class reached the confidence threshold.
    pub result: VerificationResult,
    /// Per-node verdicts, in proposal arrival order.
    pub verdicts: Vec<(NodeId, bool)>,
}

struct Proposal {
    node_id: NodeId,
    data: Vec<u8>,
}

/// Collects verification proposals from executing nodes and resolves a
/// consensus result per shard once the deal's confidence threshold is met.
#[derive(Default)]
pub struct VerificationEngine {
    tie_policy: TiePolicy,
    shards: Mutex<HashMap<(JobId, usize), Vec<Proposal>>>,
}

impl VerificationEngine {
    pub fn new(tie_policy: TiePolicy) -> Self {
        Self {
            tie_policy,
            shards: Mutex::new(HashMap::new()),
        }
    }

    /// Record a node's proposal for a shard. A second proposal from the
    /// same node is ignored.
    pub fn submit_proposal(&self, job_id: JobId, shard_index: usize, node_id: &str, data: Vec<u8>) {
        let mut shards = self.shards.lock().expect("verification lock poisoned");
        let proposals = shards.entry((job_id, shard_index)).or_default();
        if proposals.iter().any(|p| p.node_id == node_id) {
            tracing::warn!(
                job_id = %job_id,
                shard = shard_index,
                node = %node_id,
                "Ignoring duplicate proposal"
            );
            return;
        }
        proposals.push(Proposal {
            node_id: node_id.to_string(),
            data,
        });
    }

    /// The proposal a node submitted for a shard, if any.
    pub fn proposal_for(&self, job_id: JobId, shard_index: usize, node_id: &str) -> Option<Vec<u8>> {
        let shards = self.shards.lock().expect("verification lock poisoned");
        shards.get(&(job_id, shard_index)).and_then(|proposals| {
            proposals
                .iter()
                .find(|p| p.node_id == node_id)
                .map(|p| p.data.clone())
        })
    }

    /// Try to resolve a shard. Returns `None` while more proposals could
    /// still change the outcome.
    ///
    /// The first equivalence class to reach `confidence` members wins
    /// (`result = true` for its members, `false` for the rest). If all
    /// `concurrency` proposals are in and no class reached the threshold,
    /// the shard resolves to a completed failure rather than blocking
    /// forever.
    pub fn resolve(
        &self,
        job_id: JobId,
        shard_index: usize,
        deal: &Deal,
        comparator: &dyn ProposalComparator,
    ) -> Option<Resolution> {
        let shards = self.shards.lock().expect("verification lock poisoned");
        let proposals = shards.get(&(job_id, shard_index))?;
        let confidence = deal.effective_confidence();

        // Equivalence classes in first-arrival order. `reached_at` is the
        // arrival index of the member that took the class to the threshold.
        struct Class {
            members: Vec<usize>,
            reached_at: Option<usize>,
        }
        let mut classes: Vec<Class> = Vec::new();
        for (idx, proposal) in proposals.iter().enumerate() {
            let found = classes
                .iter()
                .position(|c| comparator.same(&proposals[c.members[0]].data, &proposal.data));
            let class = match found {
                Some(pos) => &mut classes[pos],
                None => {
                    classes.push(Class {
                        members: Vec::new(),
                        reached_at: None,
                    });
                    classes.last_mut().expect("just pushed")
                }
            };
            class.members.push(idx);
            if class.reached_at.is_none() && class.members.len() >= confidence {
                class.reached_at = Some(idx);
            }
        }

        let winner = match self.tie_policy {
            TiePolicy::EarliestClass => classes
                .iter()
                .filter(|c| c.reached_at.is_some())
                .min_by_key(|c| c.reached_at),
            TiePolicy::LargestClass => classes
                .iter()
                .filter(|c| c.reached_at.is_some())
                .max_by_key(|c| (c.members.len(), std::cmp::Reverse(c.reached_at))),
        };

        if let Some(winner) = winner {
            let verdicts = proposals
                .iter()
                .enumerate()
                .map(|(idx, p)| (p.node_id.clone(), winner.members.contains(&idx)))
                .collect();
            tracing::info!(
                job_id = %job_id,
                shard = shard_index,
                agreeing = winner.members.len(),
                "Verification resolved"
            );
            return Some(Resolution {
                result: VerificationResult {
                    complete: true,
                    result: true,
                },
                verdicts,
            });
        }

        // No consensus. Resolve to failure only once the proposal set is
        // exhausted; otherwise keep waiting for the remaining nodes.
        if proposals.len() >= deal.concurrency {
            tracing::info!(
                job_id = %job_id,
                shard = shard_index,
                proposals = proposals.len(),
                "Verification exhausted without consensus"
            );
            let verdicts = proposals
                .iter()
                .map(|p| (p.node_id.clone(), false))
                .collect();
            return Some(Resolution {
                result: VerificationResult {
                    complete: true,
                    result: false,
                },
                verdicts,
            });
        }
        None
    }
}

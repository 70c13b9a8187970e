use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::MatchPolicy;
use crate::model::{Deal, JobId, NodeId};

/// Outcome of evaluating the bids gathered for one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Not enough distinct bids yet; keep waiting (bounded by the job
    /// timeout, after which the shard errors with insufficient bids).
    WaitForMoreBids,
    /// The deal is struck: accept these nodes, reject the rest.
    AcceptSet {
        accept: Vec<NodeId>,
        reject: Vec<NodeId>,
    },
    /// The shard is no longer taking bids (deal already matched, shard
    /// cancelled or errored).
    Reject,
}

/// Decides which bids to accept for a shard given the job's deal policy.
///
/// Once `min_bids` distinct nodes have bid, `concurrency` of them are
/// selected. Selection is pure: it depends only on the bidder set, the deal
/// and the `(job_id, shard_index)` seed, so every replica that evaluates the
/// same bids picks the same nodes.
#[derive(Debug, Clone, Default)]
pub struct DealMatcher {
    policy: MatchPolicy,
}

impl DealMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    /// Evaluate the bids for `(job_id, shard_index)`. `bidders` is the
    /// distinct bidding nodes in arrival order; `shard_open` is false once a
    /// deal was already matched for the shard or the shard is terminal.
    pub fn evaluate_bids(
        &self,
        job_id: JobId,
        shard_index: usize,
        deal: &Deal,
        bidders: &[NodeId],
        shard_open: bool,
    ) -> Decision {
        if !shard_open {
            return Decision::Reject;
        }
        if bidders.len() < deal.min_bids {
            tracing::debug!(
                job_id = %job_id,
                shard = shard_index,
                got = bidders.len(),
                need = deal.min_bids,
                "Waiting for more bids"
            );
            return Decision::WaitForMoreBids;
        }

        let mut candidates: Vec<NodeId> = bidders.to_vec();
        match self.policy {
            MatchPolicy::SeededRandom => {
                // Sort before shuffling so the outcome is independent of
                // bid arrival order, then shuffle with the per-shard seed.
                candidates.sort();
                let mut rng = StdRng::seed_from_u64(selection_seed(job_id, shard_index));
                candidates.shuffle(&mut rng);
            }
            MatchPolicy::FirstComeFirstServed => {}
        }

        let reject = candidates.split_off(deal.concurrency.min(candidates.len()));
        tracing::info!(
            job_id = %job_id,
            shard = shard_index,
            accepted = candidates.len(),
            rejected = reject.len(),
            "Deal matched"
        );
        Decision::AcceptSet {
            accept: candidates,
            reject,
        }
    }
}

/// Deterministic selection seed derived from the job id and shard index.
fn selection_seed(job_id: JobId, shard_index: usize) -> u64 {
    let bits = job_id.as_u128();
    let folded = (bits as u64) ^ ((bits >> 64) as u64);
    folded ^ (shard_index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

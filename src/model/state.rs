use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::event::{RunCommandResult, VerificationResult};
use crate::model::spec::StorageSpec;
use crate::model::NodeId;

/// Lifecycle of one shard on one node, ordered by progress. Node-local
/// events move it forward; orchestrator events (bid acceptance, verification
/// resolution) also move it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShardStateType {
    Bidding,
    Accepted,
    Rejected,
    PreparingToRun,
    Running,
    AwaitingVerification,
    VerificationProposed,
    ResultAccepted,
    ResultRejected,
    Published,
    Error,
    Cancelled,
}

impl ShardStateType {
    /// Terminal states never transition again; late events against them are
    /// dropped by the fold.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ShardStateType::Rejected
                | ShardStateType::ResultRejected
                | ShardStateType::Published
                | ShardStateType::Error
                | ShardStateType::Cancelled
        )
    }
}

impl std::fmt::Display for ShardStateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShardStateType::Bidding => "bidding",
            ShardStateType::Accepted => "accepted",
            ShardStateType::Rejected => "rejected",
            ShardStateType::PreparingToRun => "preparing_to_run",
            ShardStateType::Running => "running",
            ShardStateType::AwaitingVerification => "awaiting_verification",
            ShardStateType::VerificationProposed => "verification_proposed",
            ShardStateType::ResultAccepted => "result_accepted",
            ShardStateType::ResultRejected => "result_rejected",
            ShardStateType::Published => "published",
            ShardStateType::Error => "error",
            ShardStateType::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Everything known about one shard's execution on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardState {
    pub node_id: NodeId,
    pub shard_index: usize,
    pub state: ShardStateType,
    /// Arbitrary status message from the most recent event.
    pub status: String,
    pub verification_proposal: Option<Vec<u8>>,
    pub verification_result: Option<VerificationResult>,
    pub published_result: Option<StorageSpec>,
    pub run_output: Option<RunCommandResult>,
}

impl ShardState {
    pub fn new(node_id: &str, shard_index: usize) -> Self {
        Self {
            node_id: node_id.to_string(),
            shard_index,
            state: ShardStateType::Bidding,
            status: String::new(),
            verification_proposal: None,
            verification_result: None,
            published_result: None,
            run_output: None,
        }
    }
}

/// Derived per-node, per-shard state of a job: a pure fold over the event
/// log, never mutated directly.
///
/// Shard records live in a flat arena keyed by `(node, shard)` rather than
/// nested maps; the ordered key gives deterministic iteration, which the
/// projector's replayability contract depends on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    shards: BTreeMap<(NodeId, usize), ShardState>,
    /// Events the fold did not understand and skipped.
    pub skipped_events: usize,
}

impl JobState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shard(&self, node_id: &str, shard_index: usize) -> Option<&ShardState> {
        self.shards.get(&(node_id.to_string(), shard_index))
    }

    /// Fetch-or-create the record for `(node, shard)`.
    pub fn shard_entry(&mut self, node_id: &str, shard_index: usize) -> &mut ShardState {
        self.shards
            .entry((node_id.to_string(), shard_index))
            .or_insert_with(|| ShardState::new(node_id, shard_index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardState> {
        self.shards.values()
    }

    /// All node records for one shard index, across nodes.
    pub fn by_shard(&self, shard_index: usize) -> impl Iterator<Item = &ShardState> {
        self.shards
            .values()
            .filter(move |s| s.shard_index == shard_index)
    }

    /// All shard records for one node.
    pub fn by_node<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ShardState> {
        self.shards.values().filter(move |s| s.node_id == node_id)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

/// Coarse job-level phase derived from the shard states, used for queries
/// and for deciding when the job is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Submitted,
    Planning,
    Bidding,
    Executing,
    Verifying,
    Publishing,
    Completed,
    Failed,
    Cancelled,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobPhase::Completed | JobPhase::Failed | JobPhase::Cancelled
        )
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobPhase::Submitted => "submitted",
            JobPhase::Planning => "planning",
            JobPhase::Bidding => "bidding",
            JobPhase::Executing => "executing",
            JobPhase::Verifying => "verifying",
            JobPhase::Publishing => "publishing",
            JobPhase::Completed => "completed",
            JobPhase::Failed => "failed",
            JobPhase::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

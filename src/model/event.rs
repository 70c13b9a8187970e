use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::spec::{ExecutionPlan, Spec, StorageSpec};
use crate::model::{JobId, NodeId, API_VERSION};

/// Kinds of events on the distributed log. The log is the sole source of
/// truth: every state a shard is ever in was caused by one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEventKind {
    /// Job accepted by the requester; carries the spec and execution plan.
    Created,
    /// A compute node offers to execute a shard.
    Bid,
    /// The requester accepted a node's bid.
    BidAccepted,
    /// The requester rejected a node's bid.
    BidRejected,
    /// A node is preparing the execution environment for a shard.
    Preparing,
    /// A node started (or is still) executing a shard.
    Running,
    /// A node finished executing and proposes a result for verification.
    ResultsProposed,
    /// The verifier accepted a node's proposed result.
    ResultsAccepted,
    /// The verifier rejected a node's proposed result.
    ResultsRejected,
    /// A verified result was published to storage.
    ResultsPublished,
    /// Terminal failure of a shard on a node.
    Error,
    /// The shard was cancelled by the client.
    Canceled,
    /// Forward compatibility: an event kind this version does not know.
    /// Projectors skip these with a warning instead of aborting.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobEventKind::Created => "created",
            JobEventKind::Bid => "bid",
            JobEventKind::BidAccepted => "bid_accepted",
            JobEventKind::BidRejected => "bid_rejected",
            JobEventKind::Preparing => "preparing",
            JobEventKind::Running => "running",
            JobEventKind::ResultsProposed => "results_proposed",
            JobEventKind::ResultsAccepted => "results_accepted",
            JobEventKind::ResultsRejected => "results_rejected",
            JobEventKind::ResultsPublished => "results_published",
            JobEventKind::Error => "error",
            JobEventKind::Canceled => "canceled",
            JobEventKind::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// One record on the append-only distributed log.
///
/// `event_id` is the identity used to deduplicate redelivered events:
/// appending the same event twice must not double-transition shard state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub api_version: String,
    pub event_id: Uuid,
    pub job_id: JobId,
    pub shard_index: usize,
    pub kind: JobEventKind,

    /// Node that emitted the event.
    pub source_node_id: NodeId,
    /// Node the event is about, when different from the source. A
    /// `BidAccepted` is emitted by the requester but targets the compute
    /// node whose bid was accepted.
    pub target_node_id: Option<NodeId>,

    /// Set on externally triggered events (job creation).
    pub client_id: Option<String>,
    /// Only present on `Created` events.
    pub spec: Option<Spec>,
    /// Only present on `Created` events.
    pub execution_plan: Option<ExecutionPlan>,

    /// Free-text status, e.g. an error description.
    pub status: String,
    /// Content digest a node claims for its shard result.
    pub verification_proposal: Option<Vec<u8>>,
    pub verification_result: Option<VerificationResult>,
    pub published_result: Option<StorageSpec>,
    pub run_output: Option<RunCommandResult>,

    pub event_time: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(kind: JobEventKind, job_id: JobId, shard_index: usize, source: &str) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            event_id: Uuid::new_v4(),
            job_id,
            shard_index,
            kind,
            source_node_id: source.to_string(),
            target_node_id: None,
            client_id: None,
            spec: None,
            execution_plan: None,
            status: String::new(),
            verification_proposal: None,
            verification_result: None,
            published_result: None,
            run_output: None,
            event_time: Utc::now(),
        }
    }

    pub fn targeting(mut self, node: &str) -> Self {
        self.target_node_id = Some(node.to_string());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_proposal(mut self, proposal: Vec<u8>) -> Self {
        self.verification_proposal = Some(proposal);
        self
    }

    /// The node whose shard record this event advances.
    pub fn subject_node(&self) -> &str {
        self.target_node_id
            .as_deref()
            .unwrap_or(&self.source_node_id)
    }
}

/// Kinds of node-local bookkeeping events. These never leave the node and
/// are not part of the distributed consensus log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobLocalEventKind {
    /// A compute node picked this job off the market for bidding.
    Selected,
    /// "I decided to accept this node's bid" - written before the network
    /// event goes out so a restart can tell intent from outcome.
    BidAccepted,
    /// "I started executing this shard."
    ExecutionStarted,
    /// "I submitted my result proposal."
    ProposalSubmitted,
    /// "I published results for this shard."
    ResultsPublished,
}

/// Node-scoped log record, parallel to the distributed log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLocalEvent {
    pub kind: JobLocalEventKind,
    pub job_id: JobId,
    pub shard_index: usize,
    pub target_node_id: Option<NodeId>,
}

/// Outcome of verifying one shard.
///
/// A struct rather than a bare bool so "not verified yet" and "verification
/// failed" are distinguishable, and so more fields can ride along later.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// True once confidence-many matching proposals have been observed (or
    /// the proposal set was exhausted without consensus).
    pub complete: bool,
    /// The agreed pass/fail verdict for the node this result is about.
    pub result: bool,
}

/// A verified, published shard result and where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedResult {
    pub shard_index: usize,
    pub node_id: NodeId,
    pub data: StorageSpec,
}

/// Captured output of running a shard on a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommandResult {
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
    pub exit_code: i32,
    /// Error from the runner itself, as opposed to the job failing.
    pub runner_error: String,
}

pub mod event;
pub mod spec;
pub mod state;

pub use event::{
    JobEvent, JobEventKind, JobLocalEvent, JobLocalEventKind, PublishedResult, RunCommandResult,
    VerificationResult,
};
pub use spec::{
    Deal, EngineSpec, ExecutionPlan, JobMetadata, MetadataValue, ResourceUsageConfig,
    ShardingConfig, Spec, StorageKind, StorageSpec, PublisherKind, VerifierKind,
};
pub use state::{JobPhase, JobState, ShardState, ShardStateType};

/// Identifier of a node on the network. Nodes mint their own IDs (typically
/// a peer ID or hostname), so this stays an opaque string.
pub type NodeId = String;

/// Globally unique job identifier, minted by the requester at submission.
pub type JobId = uuid::Uuid;

/// Version tag stamped on every event so mixed-version networks can
/// negotiate payload layout.
pub const API_VERSION: &str = "v1";

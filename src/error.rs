use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum FlotillaError {
    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid client signature")]
    InvalidSignature,

    #[error("Unknown job: {0}")]
    UnknownJob(Uuid),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),

    #[error("Sharding requested but glob '{0}' matched no inputs")]
    NoMatchingInputs(String),

    #[error("Insufficient bids: got {got}, need {need}")]
    InsufficientBids { got: usize, need: usize },

    #[error("Verification failed for job {job_id} shard {shard_index}")]
    VerificationFailed { job_id: Uuid, shard_index: usize },

    #[error("Shard timed out while in state {0}")]
    Timeout(String),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FlotillaError>;

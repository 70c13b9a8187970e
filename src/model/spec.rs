use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FlotillaError, Result};
use crate::model::{JobId, NodeId};

/// A complete, immutable description of what a job needs: which engine runs
/// it, what resources it wants, which volumes it reads and writes, how it is
/// sharded, and how its results are verified and published.
///
/// The spec is fixed at submission time. Everything derived from it (the
/// execution plan, per-shard state) lives elsewhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Spec {
    pub engine: EngineSpec,
    pub verifier: VerifierKind,
    pub publisher: PublisherKind,
    pub resources: ResourceUsageConfig,

    /// Data volumes read by every shard, subject to sharding.
    pub inputs: Vec<StorageSpec>,
    /// Volumes every shard receives in full (e.g. uploaded code), never sharded.
    pub contexts: Vec<StorageSpec>,
    /// Volumes the job writes results into.
    pub outputs: Vec<StorageSpec>,

    /// User or machine assigned labels.
    pub annotations: Vec<String>,

    /// How long the job may run, in seconds, covering execution, verification
    /// and publishing. Zero means "use the orchestrator default".
    pub timeout: f64,

    pub sharding: ShardingConfig,
    pub deal: Deal,

    /// Client opt-out from analytics collection.
    pub do_not_track: bool,
}

impl Spec {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    /// Validate the spec at submission time. A spec that fails here rejects
    /// the whole job; nothing is written to the log.
    pub fn validate(&self) -> Result<()> {
        if self.timeout < 0.0 {
            return Err(FlotillaError::InvalidSpec(format!(
                "timeout must be non-negative, got {}",
                self.timeout
            )));
        }
        if let EngineSpec::Docker { image, .. } = &self.engine {
            if image.is_empty() {
                return Err(FlotillaError::InvalidSpec(
                    "docker engine requires an image".to_string(),
                ));
            }
        }
        if !self.sharding.glob_pattern.is_empty() && self.inputs.is_empty() {
            return Err(FlotillaError::InvalidSpec(
                "sharding requested but the job has no input volumes".to_string(),
            ));
        }
        self.deal.validate()
    }
}

/// Which execution engine runs the job, with engine-specific parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineSpec {
    Docker {
        image: String,
        entrypoint: Vec<String>,
        environment: Vec<String>,
        working_directory: String,
    },
    /// High-level language job, lowered to Docker or Wasm by the executor.
    Language {
        language: String,
        version: String,
        deterministic: bool,
        command: String,
    },
    Wasm {
        entry_module: StorageSpec,
        entry_point: String,
        parameters: Vec<String>,
        environment: Vec<(String, String)>,
    },
}

impl Default for EngineSpec {
    fn default() -> Self {
        EngineSpec::Docker {
            image: String::new(),
            entrypoint: Vec::new(),
            environment: Vec::new(),
            working_directory: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifierKind {
    /// Accept any proposal without comparing it to anything.
    #[default]
    Noop,
    /// Proposals from different nodes must match byte for byte.
    Deterministic,
    /// Proposals are approved by an external party; equivalence is the
    /// approval verdict rather than the bytes themselves.
    ExternalApproval,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublisherKind {
    /// Record the winning proposal inline without pinning it anywhere.
    #[default]
    Noop,
    /// Pin results to the content-addressed store behind `StorageBackend`.
    Ipfs,
}

/// Compute resources a job asks for. These are requests, not limits;
/// capacity accounting happens on the compute side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsageConfig {
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub gpus: u64,
}

/// The bargain between the client and the network: how many bids to wait
/// for, how many nodes run each shard, and how many must agree on a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    /// Number of bids accepted concurrently per shard.
    pub concurrency: usize,
    /// Number of matching verification proposals required to accept a
    /// result. Zero means "same as concurrency is not required": one match.
    pub confidence: usize,
    /// Minimum number of distinct bids that must arrive before any are
    /// accepted, so selection can spread work across the network.
    pub min_bids: usize,
}

impl Default for Deal {
    fn default() -> Self {
        Self {
            concurrency: 1,
            confidence: 1,
            min_bids: 1,
        }
    }
}

impl Deal {
    /// Invariants: `concurrency >= 1`, `confidence <= concurrency`,
    /// `min_bids >= concurrency`.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency < 1 {
            return Err(FlotillaError::InvalidSpec(
                "deal concurrency must be at least 1".to_string(),
            ));
        }
        if self.confidence > self.concurrency {
            return Err(FlotillaError::InvalidSpec(format!(
                "deal confidence {} exceeds concurrency {}",
                self.confidence, self.concurrency
            )));
        }
        if self.min_bids < self.concurrency {
            return Err(FlotillaError::InvalidSpec(format!(
                "deal min_bids {} is below concurrency {}",
                self.min_bids, self.concurrency
            )));
        }
        Ok(())
    }

    /// Confidence with the legacy "0 = unset" value coerced to 1.
    pub fn effective_confidence(&self) -> usize {
        self.confidence.max(1)
    }
}

/// How a job's inputs are chunked into independently executed shards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingConfig {
    /// Glob applied to the input volumes to enumerate shardable items.
    /// Empty means "no sharding": the whole job is a single shard.
    pub glob_pattern: String,
    /// How many matched items each shard processes. The last shard may get
    /// fewer.
    pub batch_size: usize,
    /// Common mount path the glob is anchored at when the job has multiple
    /// input volumes.
    pub base_path: String,
}

/// The fan-out decided at submission: how many shards this job runs as.
/// Computed once by the planner and immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub shards_total: usize,
}

impl Default for ExecutionPlan {
    fn default() -> Self {
        Self { shards_total: 1 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    #[default]
    Ipfs,
    Url,
    LocalDirectory,
    Inline,
}

/// A location where data lives: a CID, URL or path plus where it mounts
/// inside the execution environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpec {
    pub kind: StorageKind,
    /// Human-readable handle, unique within one job's volume list.
    pub name: String,
    pub cid: String,
    pub url: String,
    /// Mount path inside the execution environment.
    pub path: String,
    pub metadata: Vec<(String, MetadataValue)>,
}

impl StorageSpec {
    pub fn ipfs(name: &str, cid: &str, path: &str) -> Self {
        Self {
            kind: StorageKind::Ipfs,
            name: name.to_string(),
            cid: cid.to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn inline(name: &str, payload: &str) -> Self {
        Self {
            kind: StorageKind::Inline,
            name: name.to_string(),
            url: payload.to_string(),
            ..Default::default()
        }
    }
}

/// Tagged metadata value. Kept closed rather than an open string->anything
/// map so consumers can match on the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataValue {
    Text(String),
    Integer(i64),
    Flag(bool),
}

/// Identity of a job on the network: who submitted it, when, and which
/// requester node owns its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
    pub client_id: String,
    pub requester_node_id: NodeId,
}

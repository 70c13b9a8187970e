use crate::model::NodeId;

/// How bids are selected once a shard has gathered `min_bids` of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    /// Uniform pseudo-random selection, seeded by `(job_id, shard_index)` so
    /// the chosen set is reproducible across runs and replicas.
    #[default]
    SeededRandom,
    /// Take bidders in arrival order.
    FirstComeFirstServed,
}

/// How the verification engine breaks a tie when more than one equivalence
/// class could win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TiePolicy {
    /// The class that first reached the confidence threshold wins.
    #[default]
    EarliestClass,
    /// The largest class wins; arrival order breaks remaining ties.
    LargestClass,
}

/// Configuration for the job orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Identity this orchestrator signs its events with.
    pub node_id: NodeId,

    /// Maximum number of jobs retained in memory (jobs are never deleted,
    /// only refused at submission once the cap is hit).
    pub max_jobs: usize,

    /// Interval of the housekeeping tick that enforces shard deadlines.
    pub housekeeping_interval_ms: u64,

    /// Timeout applied to jobs whose spec does not carry one, in seconds.
    /// Covers bidding, execution, verification and publishing per shard.
    pub default_timeout_secs: f64,

    pub match_policy: MatchPolicy,
    pub tie_policy: TiePolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            node_id: "requester-1".to_string(),
            max_jobs: 10_000,
            housekeeping_interval_ms: 500,
            default_timeout_secs: 300.0,
            match_policy: MatchPolicy::default(),
            tie_policy: TiePolicy::default(),
        }
    }
}

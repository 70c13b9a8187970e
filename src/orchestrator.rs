use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{FlotillaError, Result};
use crate::eventlog::EventLog;
use crate::external::{LoopbackTransport, SignatureVerifier, StorageBackend, Transport};
use crate::matcher::{DealMatcher, Decision};
use crate::model::{
    ExecutionPlan, JobEvent, JobEventKind, JobId, JobLocalEvent, JobLocalEventKind, JobMetadata,
    JobPhase, JobState, NodeId, PublishedResult, PublisherKind, ShardStateType, Spec, StorageSpec,
    VerifierKind,
};
use crate::projector;
use crate::sharding;
use crate::verification::{comparator_for, ProposalApprover, VerificationEngine};

/// Read-only introspection of the orchestrator, for debug endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct DebugSnapshot {
    /// Jobs this node is requester for (all jobs; none are ever deleted).
    pub requester_jobs: usize,
    /// Jobs still in a non-terminal phase.
    pub active_jobs: usize,
    /// Shard executions currently accepted or running across the network.
    pub executing_shards: usize,
    /// Job slots left before submissions are refused.
    pub available_capacity: usize,
}

/// Everything the orchestrator tracks per job beyond the event log itself.
/// All of it is derivable from the log; keeping it here makes reactions and
/// deadline checks O(1) instead of a replay per event.
struct JobRecord {
    metadata: JobMetadata,
    spec: Spec,
    plan: ExecutionPlan,
    phase: JobPhase,
    projection: JobState,
    /// Distinct bidders per shard, in arrival order.
    bidders: Vec<Vec<NodeId>>,
    /// Nodes whose bid was accepted, per shard.
    accepted: Vec<Vec<NodeId>>,
    /// Deal matched per shard: set once bids are accepted.
    matched: Vec<bool>,
    /// Verification resolved per shard.
    resolved: Vec<bool>,
    /// Shard-level failure recorded (insufficient bids, timeout).
    failed: Vec<bool>,
    /// Per-shard deadline enforced by the housekeeping tick.
    deadlines: Vec<DateTime<Utc>>,
    cancelled: bool,
}

impl JobRecord {
    fn shard_open(&self, shard: usize) -> bool {
        !self.cancelled && !self.matched[shard] && !self.failed[shard]
    }
}

/// Top-level coordinator of the job lifecycle.
///
/// Composes the event log, projector, deal matcher, execution planner and
/// verification engine: accepts submissions, drives shards through bidding,
/// execution, verification and publishing, and answers queries. All
/// decisions are made reactively as events land on the log; compute nodes
/// participate by appending their own events (via [`Orchestrator::deliver`]
/// in a single-process setup, or a real transport otherwise).
pub struct Orchestrator {
    config: OrchestratorConfig,
    log: Arc<EventLog>,
    matcher: DealMatcher,
    verification: VerificationEngine,
    signature: Arc<dyn SignatureVerifier>,
    storage: Arc<dyn StorageBackend>,
    transport: Arc<dyn Transport>,
    approver: Option<Arc<dyn ProposalApprover>>,
    jobs: RwLock<HashMap<JobId, Arc<Mutex<JobRecord>>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        signature: Arc<dyn SignatureVerifier>,
        storage: Arc<dyn StorageBackend>,
    ) -> Arc<Self> {
        Self::assemble(config, signature, storage, Arc::new(LoopbackTransport), None)
    }

    pub fn with_transport(
        config: OrchestratorConfig,
        signature: Arc<dyn SignatureVerifier>,
        storage: Arc<dyn StorageBackend>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Self::assemble(config, signature, storage, transport, None)
    }

    /// Orchestrator that can run jobs with the external-approval verifier:
    /// proposal equivalence is decided by `approver` rather than byte
    /// equality. Without one, such jobs are refused at submission.
    pub fn with_approver(
        config: OrchestratorConfig,
        signature: Arc<dyn SignatureVerifier>,
        storage: Arc<dyn StorageBackend>,
        approver: Arc<dyn ProposalApprover>,
    ) -> Arc<Self> {
        Self::assemble(
            config,
            signature,
            storage,
            Arc::new(LoopbackTransport),
            Some(approver),
        )
    }

    fn assemble(
        config: OrchestratorConfig,
        signature: Arc<dyn SignatureVerifier>,
        storage: Arc<dyn StorageBackend>,
        transport: Arc<dyn Transport>,
        approver: Option<Arc<dyn ProposalApprover>>,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            matcher: DealMatcher::new(config.match_policy),
            verification: VerificationEngine::new(config.tie_policy),
            config,
            log: Arc::new(EventLog::new()),
            signature,
            storage,
            transport,
            approver,
            jobs: RwLock::new(HashMap::new()),
        });

        // The log calls back into us for every append, in per-job append
        // order. Weak reference so the log does not keep us alive.
        let weak = Arc::downgrade(&orchestrator);
        orchestrator.log.subscribe_fn(Box::new(move |event| {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.handle_event(event);
            }
        }));

        orchestrator
    }

    /// The shared log, for wiring transports and test harnesses.
    pub fn log(&self) -> Arc<EventLog> {
        self.log.clone()
    }

    /// Run the housekeeping loop until the token is cancelled. Everything
    /// else is reactive; this tick only enforces per-shard deadlines.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.housekeeping_interval_ms));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.check_deadlines();
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Orchestrator housekeeping stopped");
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Submit a job: verify the client's signature, validate the spec,
    /// compute the execution plan and write the `Created` event.
    pub fn submit(
        &self,
        spec: Spec,
        client_id: &str,
        client_public_key: &[u8],
        signature: &[u8],
    ) -> Result<JobId> {
        let payload = serde_json::to_vec(&spec)
            .map_err(|err| FlotillaError::Internal(format!("spec serialization: {}", err)))?;
        if !self.signature.verify(client_public_key, &payload, signature) {
            return Err(FlotillaError::InvalidSignature);
        }
        spec.validate()?;
        if spec.verifier == VerifierKind::ExternalApproval && self.approver.is_none() {
            return Err(FlotillaError::InvalidSpec(
                "external approval verifier requires an approver".to_string(),
            ));
        }

        let plan = sharding::plan(&spec, self.storage.as_ref())?;
        let job_id = Uuid::new_v4();
        let metadata = JobMetadata {
            id: job_id,
            created_at: Utc::now(),
            client_id: client_id.to_string(),
            requester_node_id: self.config.node_id.clone(),
        };

        let timeout = if spec.timeout > 0.0 {
            spec.timeout()
        } else {
            Duration::from_secs_f64(self.config.default_timeout_secs)
        };
        let deadline = Utc::now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));

        {
            // Capacity is checked and the record inserted under one write
            // lock so concurrent submissions cannot race past the cap.
            let mut jobs = self.jobs.write().expect("orchestrator lock poisoned");
            if jobs.len() >= self.config.max_jobs {
                return Err(FlotillaError::Internal("job capacity reached".to_string()));
            }
            jobs.insert(
                job_id,
                Arc::new(Mutex::new(JobRecord {
                    metadata,
                    spec: spec.clone(),
                    plan,
                    phase: JobPhase::Submitted,
                    projection: JobState::new(),
                    bidders: vec![Vec::new(); plan.shards_total],
                    accepted: vec![Vec::new(); plan.shards_total],
                    matched: vec![false; plan.shards_total],
                    resolved: vec![false; plan.shards_total],
                    failed: vec![false; plan.shards_total],
                    deadlines: vec![deadline; plan.shards_total],
                    cancelled: false,
                })),
            );
        }

        if let Err(err) = self.log.register_job(job_id, plan.shards_total) {
            self.jobs
                .write()
                .expect("orchestrator lock poisoned")
                .remove(&job_id);
            return Err(err);
        }

        let mut created = JobEvent::new(JobEventKind::Created, job_id, 0, &self.config.node_id);
        created.client_id = Some(client_id.to_string());
        created.spec = Some(spec);
        created.execution_plan = Some(plan);
        self.emit(created);

        tracing::info!(job_id = %job_id, shards = plan.shards_total, client = %client_id, "Job submitted");
        Ok(job_id)
    }

    /// Current derived state of a job: the fold of its event log.
    pub fn describe(&self, job_id: JobId) -> Result<JobState> {
        let record = self.job_record(job_id)?;
        let record = record.lock().expect("orchestrator lock poisoned");
        Ok(record.projection.clone())
    }

    pub fn phase(&self, job_id: JobId) -> Result<JobPhase> {
        let record = self.job_record(job_id)?;
        let record = record.lock().expect("orchestrator lock poisoned");
        Ok(record.phase)
    }

    /// The full event sequence for a job, in append order.
    pub fn events(&self, job_id: JobId) -> Result<Vec<JobEvent>> {
        self.job_record(job_id)?;
        self.log.events_for(job_id)
    }

    /// Published results so far. Complete once the job phase is terminal;
    /// partially-completed jobs return the shards published to date.
    pub fn results(&self, job_id: JobId) -> Result<Vec<PublishedResult>> {
        let events = self.events(job_id)?;
        Ok(events
            .iter()
            .filter(|ev| ev.kind == JobEventKind::ResultsPublished)
            .filter_map(|ev| {
                ev.published_result.as_ref().map(|data| PublishedResult {
                    shard_index: ev.shard_index,
                    node_id: ev.subject_node().to_string(),
                    data: data.clone(),
                })
            })
            .collect())
    }

    /// Node-scoped bookkeeping events, not part of the consensus log.
    pub fn local_events(&self, node_id: &str, job_id: JobId) -> Vec<JobLocalEvent> {
        self.log.local_events_for(node_id, job_id)
    }

    /// Cooperatively cancel a job: a `Canceled` event is appended per shard
    /// and observed by the matcher and verification engine on their next
    /// fold, which then stop issuing further work.
    pub fn cancel(&self, job_id: JobId) -> Result<()> {
        let record = self.job_record(job_id)?;
        let shards_total = {
            let mut record = record.lock().expect("orchestrator lock poisoned");
            if record.phase.is_terminal() {
                return Ok(());
            }
            record.cancelled = true;
            record.plan.shards_total
        };

        for shard in 0..shards_total {
            self.emit(
                JobEvent::new(JobEventKind::Canceled, job_id, shard, &self.config.node_id)
                    .with_status("cancelled by client"),
            );
        }
        tracing::info!(job_id = %job_id, "Job cancelled");
        Ok(())
    }

    pub fn debug_snapshot(&self) -> DebugSnapshot {
        let jobs = self.jobs.read().expect("orchestrator lock poisoned");
        let mut active_jobs = 0;
        let mut executing_shards = 0;
        for record in jobs.values() {
            let record = record.lock().expect("orchestrator lock poisoned");
            if !record.phase.is_terminal() {
                active_jobs += 1;
            }
            executing_shards += record
                .projection
                .iter()
                .filter(|s| {
                    matches!(
                        s.state,
                        ShardStateType::Accepted
                            | ShardStateType::PreparingToRun
                            | ShardStateType::Running
                    )
                })
                .count();
        }
        DebugSnapshot {
            requester_jobs: jobs.len(),
            active_jobs,
            executing_shards,
            available_capacity: self.config.max_jobs.saturating_sub(jobs.len()),
        }
    }

    /// Ingress for events received from other nodes (or appended by a test
    /// harness standing in for compute nodes).
    pub fn deliver(&self, event: JobEvent) -> Result<()> {
        self.log.append(event)
    }

    // ------------------------------------------------------------------
    // Reactive core
    // ------------------------------------------------------------------

    /// Append locally, then tell the rest of the network.
    fn emit(&self, event: JobEvent) {
        if let Err(err) = self.transport.broadcast(&event) {
            tracing::warn!(job_id = %event.job_id, error = %err, "Broadcast failed");
        }
        if let Err(err) = self.log.append(event) {
            tracing::warn!(error = %err, "Dropping event the log refused");
        }
    }

    /// Synchronous log subscriber: fold the event into the projection,
    /// decide reactions, emit them after releasing the record lock.
    fn handle_event(&self, event: &JobEvent) {
        let record = match self.job_record(event.job_id) {
            Ok(record) => record,
            Err(_) => {
                tracing::warn!(job_id = %event.job_id, "Event for a job this node does not track");
                return;
            }
        };

        let (reactions, locals) = {
            let mut record = record.lock().expect("orchestrator lock poisoned");
            if let Err(err) = projector::apply(&mut record.projection, event) {
                tracing::warn!(job_id = %event.job_id, error = %err, "Skipping event in fold");
                record.projection.skipped_events += 1;
            }

            let mut reactions = Vec::new();
            let mut locals = Vec::new();
            if event.kind == JobEventKind::Canceled {
                record.cancelled = true;
            }
            match event.kind {
                JobEventKind::Bid => {
                    self.react_to_bid(&mut record, event, &mut reactions, &mut locals)
                }
                JobEventKind::ResultsProposed => {
                    self.react_to_proposal(&mut record, event, &mut reactions)
                }
                JobEventKind::ResultsAccepted => {
                    self.react_to_acceptance(&mut record, event, &mut reactions, &mut locals)
                }
                _ => {}
            }

            record.phase = self.compute_phase(&record);
            if record.phase.is_terminal() {
                tracing::info!(job_id = %event.job_id, phase = %record.phase, "Job reached terminal phase");
            }
            (reactions, locals)
        };

        for local in locals {
            self.log.append_local(&self.config.node_id, local);
        }
        for reaction in reactions {
            self.emit(reaction);
        }
    }

    /// A compute node offered to run a shard: dedupe, then either wait for
    /// more bids, strike the deal, or reject outright.
    fn react_to_bid(
        &self,
        record: &mut JobRecord,
        event: &JobEvent,
        reactions: &mut Vec<JobEvent>,
        locals: &mut Vec<JobLocalEvent>,
    ) {
        let shard = event.shard_index;
        let bidder = event.subject_node().to_string();

        if !record.shard_open(shard) {
            reactions.push(
                JobEvent::new(
                    JobEventKind::BidRejected,
                    event.job_id,
                    shard,
                    &self.config.node_id,
                )
                .targeting(&bidder)
                .with_status("shard is no longer taking bids"),
            );
            return;
        }

        if record.bidders[shard].contains(&bidder) {
            tracing::warn!(job_id = %event.job_id, shard, node = %bidder, "Ignoring duplicate bid");
            return;
        }
        record.bidders[shard].push(bidder);

        let decision = self.matcher.evaluate_bids(
            event.job_id,
            shard,
            &record.spec.deal,
            &record.bidders[shard],
            true,
        );
        if let Decision::AcceptSet { accept, reject } = decision {
            record.matched[shard] = true;
            record.accepted[shard] = accept.clone();
            for node in accept {
                locals.push(JobLocalEvent {
                    kind: JobLocalEventKind::BidAccepted,
                    job_id: event.job_id,
                    shard_index: shard,
                    target_node_id: Some(node.clone()),
                });
                reactions.push(
                    JobEvent::new(
                        JobEventKind::BidAccepted,
                        event.job_id,
                        shard,
                        &self.config.node_id,
                    )
                    .targeting(&node),
                );
            }
            for node in reject {
                reactions.push(
                    JobEvent::new(
                        JobEventKind::BidRejected,
                        event.job_id,
                        shard,
                        &self.config.node_id,
                    )
                    .targeting(&node),
                );
            }
        }
    }

    /// A node proposed a result: feed the verification engine and resolve
    /// once the confidence threshold (or exhaustion) is reached.
    fn react_to_proposal(
        &self,
        record: &mut JobRecord,
        event: &JobEvent,
        reactions: &mut Vec<JobEvent>,
    ) {
        let shard = event.shard_index;
        if record.cancelled || record.failed[shard] {
            return;
        }
        if record.resolved[shard] {
            tracing::warn!(
                job_id = %event.job_id,
                shard,
                node = %event.source_node_id,
                "Proposal after verification resolved"
            );
            return;
        }

        // Only nodes whose bid was accepted take part in verification.
        let proposer = event.source_node_id.clone();
        if !record.accepted[shard].contains(&proposer) {
            tracing::warn!(
                job_id = %event.job_id,
                shard,
                node = %proposer,
                "Ignoring proposal from a node without an accepted bid"
            );
            return;
        }

        self.verification.submit_proposal(
            event.job_id,
            shard,
            &proposer,
            event.verification_proposal.clone().unwrap_or_default(),
        );

        // Submission refuses external-approval jobs without an approver, so
        // this only trips for events about jobs submitted elsewhere.
        let Some(comparator) = comparator_for(record.spec.verifier, self.approver.as_ref()) else {
            tracing::warn!(
                job_id = %event.job_id,
                shard,
                "No approver configured for this job's verifier; proposal left pending"
            );
            return;
        };
        if let Some(resolution) = self.verification.resolve(
            event.job_id,
            shard,
            &record.spec.deal,
            comparator.as_ref(),
        ) {
            record.resolved[shard] = true;
            let proposed: Vec<NodeId> = resolution.verdicts.iter().map(|(n, _)| n.clone()).collect();
            for (node, verdict) in resolution.verdicts {
                let kind = if verdict {
                    JobEventKind::ResultsAccepted
                } else {
                    JobEventKind::ResultsRejected
                };
                let mut reaction =
                    JobEvent::new(kind, event.job_id, shard, &self.config.node_id).targeting(&node);
                reaction.verification_result = Some(crate::model::VerificationResult {
                    complete: true,
                    result: verdict,
                });
                reactions.push(reaction);
            }
            // Accepted nodes that had not proposed when the threshold was
            // reached lose: their result was never verified.
            for node in &record.accepted[shard] {
                if !proposed.contains(node) {
                    let mut reaction = JobEvent::new(
                        JobEventKind::ResultsRejected,
                        event.job_id,
                        shard,
                        &self.config.node_id,
                    )
                    .targeting(node)
                    .with_status("no proposal before verification resolved");
                    reaction.verification_result = Some(crate::model::VerificationResult {
                        complete: true,
                        result: false,
                    });
                    reactions.push(reaction);
                }
            }
        }
    }

    /// A node's result passed verification: publish it.
    fn react_to_acceptance(
        &self,
        record: &mut JobRecord,
        event: &JobEvent,
        reactions: &mut Vec<JobEvent>,
        locals: &mut Vec<JobLocalEvent>,
    ) {
        if record.cancelled {
            return;
        }
        let shard = event.shard_index;
        let node = event.subject_node().to_string();
        let proposal = self
            .verification
            .proposal_for(event.job_id, shard, &node)
            .unwrap_or_default();

        let published = match record.spec.publisher {
            PublisherKind::Noop => Ok(StorageSpec::inline("results", "")),
            PublisherKind::Ipfs => self.storage.pin(&proposal),
        };
        match published {
            Ok(data) => {
                locals.push(JobLocalEvent {
                    kind: JobLocalEventKind::ResultsPublished,
                    job_id: event.job_id,
                    shard_index: shard,
                    target_node_id: Some(node.clone()),
                });
                let mut reaction = JobEvent::new(
                    JobEventKind::ResultsPublished,
                    event.job_id,
                    shard,
                    &self.config.node_id,
                )
                .targeting(&node);
                reaction.published_result = Some(data);
                reactions.push(reaction);
            }
            Err(err) => {
                tracing::warn!(job_id = %event.job_id, shard, error = %err, "Publishing failed");
                reactions.push(
                    JobEvent::new(
                        JobEventKind::Error,
                        event.job_id,
                        shard,
                        &self.config.node_id,
                    )
                    .targeting(&node)
                    .with_status(format!("publishing failed: {}", err)),
                );
            }
        }
    }

    /// Enforce per-shard deadlines: shards still bidding fail with
    /// insufficient bids, anything else unfinished fails with a timeout.
    /// Per-shard failures are isolated; sibling shards keep going.
    fn check_deadlines(&self) {
        let records: Vec<(JobId, Arc<Mutex<JobRecord>>)> = {
            let jobs = self.jobs.read().expect("orchestrator lock poisoned");
            jobs.iter().map(|(id, r)| (*id, r.clone())).collect()
        };
        let now = Utc::now();

        for (job_id, record) in records {
            let mut reactions = Vec::new();
            {
                let mut record = record.lock().expect("orchestrator lock poisoned");
                if record.phase.is_terminal() {
                    continue;
                }
                for shard in 0..record.plan.shards_total {
                    if record.failed[shard] || now <= record.deadlines[shard] {
                        continue;
                    }
                    let published = record
                        .projection
                        .by_shard(shard)
                        .any(|s| s.state == ShardStateType::Published);
                    if published {
                        continue;
                    }

                    record.failed[shard] = true;
                    if !record.matched[shard] {
                        let got = record.bidders[shard].len();
                        let need = record.spec.deal.min_bids;
                        tracing::warn!(job_id = %job_id, shard, got, need, "Shard failed: insufficient bids");
                        reactions.push(
                            JobEvent::new(
                                JobEventKind::Error,
                                job_id,
                                shard,
                                &self.config.node_id,
                            )
                            .with_status(format!("insufficient bids: got {}, need {}", got, need)),
                        );
                    } else {
                        tracing::warn!(job_id = %job_id, shard, "Shard timed out");
                        let stuck: Vec<NodeId> = record
                            .projection
                            .by_shard(shard)
                            .filter(|s| !s.state.is_terminal())
                            .map(|s| s.node_id.clone())
                            .collect();
                        for node in stuck {
                            reactions.push(
                                JobEvent::new(
                                    JobEventKind::Error,
                                    job_id,
                                    shard,
                                    &self.config.node_id,
                                )
                                .targeting(&node)
                                .with_status("shard timed out"),
                            );
                        }
                    }
                }
            }
            for reaction in reactions {
                self.emit(reaction);
            }
        }
    }

    /// Derive the coarse job phase from the shard arena. The job is done
    /// when every shard either published, failed, or lost every participant.
    fn compute_phase(&self, record: &JobRecord) -> JobPhase {
        if record.cancelled {
            return JobPhase::Cancelled;
        }

        let mut all_done = true;
        let mut any_success = false;
        let mut any_publishing = false;
        let mut any_verifying = false;
        let mut any_executing = false;

        for shard in 0..record.plan.shards_total {
            if record
                .projection
                .by_shard(shard)
                .any(|s| s.state == ShardStateType::Published)
            {
                any_success = true;
                continue;
            }
            if record.failed[shard] {
                continue;
            }

            // Participants are nodes whose bid was not rejected.
            let mut has_live_participant = false;
            let mut saw_participant = false;
            for state in record.projection.by_shard(shard) {
                if state.state == ShardStateType::Rejected
                    || state.node_id == record.metadata.requester_node_id
                {
                    continue;
                }
                saw_participant = true;
                if !state.state.is_terminal() {
                    has_live_participant = true;
                    match state.state {
                        ShardStateType::ResultAccepted => any_publishing = true,
                        ShardStateType::AwaitingVerification
                        | ShardStateType::VerificationProposed => any_verifying = true,
                        ShardStateType::Accepted
                        | ShardStateType::PreparingToRun
                        | ShardStateType::Running => any_executing = true,
                        _ => {}
                    }
                }
            }

            if record.matched[shard] && saw_participant && !has_live_participant {
                // Every participant ended in Error/ResultRejected: the shard
                // is done, unsuccessfully.
                continue;
            }
            all_done = false;
        }

        if all_done {
            return if any_success {
                JobPhase::Completed
            } else {
                JobPhase::Failed
            };
        }
        if any_publishing {
            JobPhase::Publishing
        } else if any_verifying {
            JobPhase::Verifying
        } else if any_executing {
            JobPhase::Executing
        } else {
            JobPhase::Bidding
        }
    }

    fn job_record(&self, job_id: JobId) -> Result<Arc<Mutex<JobRecord>>> {
        self.jobs
            .read()
            .expect("orchestrator lock poisoned")
            .get(&job_id)
            .cloned()
            .ok_or(FlotillaError::NotFound(job_id))
    }
}

//! End-to-end tests driving the orchestrator through the full job
//! lifecycle, with the test standing in for the compute nodes.


use std::sync::Arc;
use std::time::Duration;

use flotilla::config::OrchestratorConfig;
use flotilla::error::FlotillaError;
use flotilla::external::{DenyAllVerifier, InMemoryStorage};
use flotilla::model::{
    Deal, JobEvent, JobEventKind, JobId, JobLocalEventKind, JobPhase, ShardStateType, VerifierKind,
};
use flotilla::verification::ProposalApprover;
use flotilla::Orchestrator;
use tokio_util::sync::CancellationToken;

use test_harness::{
    bid, propose, report_running, setup, setup_with_approver, setup_with_config, sharded_spec,
    submit, test_spec,
};

/// Approves any proposal carrying the agreed marker.
struct MarkerApprover;

impl ProposalApprover for MarkerApprover {
    fn approve(&self, proposal: &[u8]) -> bool {
        proposal.starts_with(b"ok:")
    }
}

fn events_of_kind(orchestrator: &Orchestrator, job_id: JobId, kind: JobEventKind) -> Vec<JobEvent> {
    orchestrator
        .events(job_id)
        .unwrap()
        .into_iter()
        .filter(|ev| ev.kind == kind)
        .collect()
}

/// Single shard, single node: bid, run, propose, verify, publish.
#[test]
fn test_single_node_lifecycle_completes() {
    let (orchestrator, _storage) = setup();
    let job_id = submit(&orchestrator, test_spec(Deal::default()));

    bid(&orchestrator, job_id, 0, "node-a");
    report_running(&orchestrator, job_id, 0, "node-a");
    propose(&orchestrator, job_id, 0, "node-a", b"digest");

    assert_eq!(orchestrator.phase(job_id).unwrap(), JobPhase::Completed);

    let state = orchestrator.describe(job_id).unwrap();
    assert_eq!(
        state.shard("node-a", 0).unwrap().state,
        ShardStateType::Published
    );

    let results = orchestrator.results(job_id).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].node_id, "node-a");
    assert!(!results[0].data.cid.is_empty());

    // The orchestrator's own bookkeeping recorded the deal and the publish.
    let locals = orchestrator.local_events("requester-1", job_id);
    assert!(locals
        .iter()
        .any(|l| l.kind == JobLocalEventKind::BidAccepted));
    assert!(locals
        .iter()
        .any(|l| l.kind == JobLocalEventKind::ResultsPublished));

    let kinds: Vec<JobEventKind> = orchestrator
        .events(job_id)
        .unwrap()
        .iter()
        .map(|ev| ev.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            JobEventKind::Created,
            JobEventKind::Bid,
            JobEventKind::BidAccepted,
            JobEventKind::Running,
            JobEventKind::ResultsProposed,
            JobEventKind::ResultsAccepted,
            JobEventKind::ResultsPublished,
        ]
    );
}

/// Concurrency=3, Confidence=2: two agreeing nodes win, the divergent one
/// is rejected, and only the winners publish.
#[test]
fn test_consensus_rejects_divergent_node() {
    let (orchestrator, _storage) = setup();
    let deal = Deal {
        concurrency: 3,
        confidence: 2,
        min_bids: 3,
    };
    let job_id = submit(&orchestrator, test_spec(deal));

    bid(&orchestrator, job_id, 0, "node-a");
    bid(&orchestrator, job_id, 0, "node-b");
    bid(&orchestrator, job_id, 0, "node-c");
    assert_eq!(events_of_kind(&orchestrator, job_id, JobEventKind::BidAccepted).len(), 3);

    propose(&orchestrator, job_id, 0, "node-c", b"divergent");
    propose(&orchestrator, job_id, 0, "node-a", b"agreed");
    assert_eq!(orchestrator.phase(job_id).unwrap(), JobPhase::Verifying);
    propose(&orchestrator, job_id, 0, "node-b", b"agreed");

    assert_eq!(orchestrator.phase(job_id).unwrap(), JobPhase::Completed);

    let accepted = events_of_kind(&orchestrator, job_id, JobEventKind::ResultsAccepted);
    let rejected = events_of_kind(&orchestrator, job_id, JobEventKind::ResultsRejected);
    assert_eq!(accepted.len(), 2);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].target_node_id.as_deref(), Some("node-c"));

    let mut winners: Vec<String> = orchestrator
        .results(job_id)
        .unwrap()
        .into_iter()
        .map(|r| r.node_id)
        .collect();
    winners.sort();
    assert_eq!(winners, vec!["node-a", "node-b"]);
}

/// All proposals in, no class at the threshold: the job fails rather than
/// waiting forever.
#[test]
fn test_exhausted_verification_fails_the_job() {
    let (orchestrator, _storage) = setup();
    let deal = Deal {
        concurrency: 2,
        confidence: 2,
        min_bids: 2,
    };
    let job_id = submit(&orchestrator, test_spec(deal));

    bid(&orchestrator, job_id, 0, "node-a");
    bid(&orchestrator, job_id, 0, "node-b");
    propose(&orchestrator, job_id, 0, "node-a", b"one");
    propose(&orchestrator, job_id, 0, "node-b", b"two");

    assert_eq!(orchestrator.phase(job_id).unwrap(), JobPhase::Failed);
    assert_eq!(
        events_of_kind(&orchestrator, job_id, JobEventKind::ResultsRejected).len(),
        2
    );
    assert!(orchestrator.results(job_id).unwrap().is_empty());
}

/// 20 matched items at BatchSize=7 plan 3 shards, each driven to publish
/// independently.
#[test]
fn test_sharded_job_runs_every_shard() {
    let (orchestrator, storage) = setup();
    storage.add_volume(
        "inputs",
        (0..20).map(|i| format!("/inputs/file-{:02}.csv", i)).collect(),
    );
    let job_id = submit(&orchestrator, sharded_spec(Deal::default(), "*.csv", 7));

    let created = &events_of_kind(&orchestrator, job_id, JobEventKind::Created)[0];
    assert_eq!(created.execution_plan.unwrap().shards_total, 3);

    for shard in 0..3 {
        bid(&orchestrator, job_id, shard, "node-a");
        propose(&orchestrator, job_id, shard, "node-a", b"digest");
    }

    assert_eq!(orchestrator.phase(job_id).unwrap(), JobPhase::Completed);
    let mut shards: Vec<usize> = orchestrator
        .results(job_id)
        .unwrap()
        .into_iter()
        .map(|r| r.shard_index)
        .collect();
    shards.sort_unstable();
    assert_eq!(shards, vec![0, 1, 2]);
}

/// A submission whose signature does not verify is refused before any
/// state is created.
#[test]
fn test_bad_signature_is_refused() {
    let storage = Arc::new(InMemoryStorage::new());
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(DenyAllVerifier),
        storage,
    );
    let result = orchestrator.submit(test_spec(Deal::default()), "client-1", b"key", b"sig");
    assert!(matches!(result, Err(FlotillaError::InvalidSignature)));
    assert_eq!(orchestrator.debug_snapshot().requester_jobs, 0);
}

/// With an approver configured, byte-divergent but approved proposals
/// satisfy the confidence threshold and both nodes publish.
#[test]
fn test_external_approval_verifier_completes_on_divergent_results() {
    let (orchestrator, _storage) = setup_with_approver(Arc::new(MarkerApprover));
    let deal = Deal {
        concurrency: 2,
        confidence: 2,
        min_bids: 2,
    };
    let mut spec = test_spec(deal);
    spec.verifier = VerifierKind::ExternalApproval;
    let job_id = submit(&orchestrator, spec);

    bid(&orchestrator, job_id, 0, "node-a");
    bid(&orchestrator, job_id, 0, "node-b");
    propose(&orchestrator, job_id, 0, "node-a", b"ok: run 1");
    propose(&orchestrator, job_id, 0, "node-b", b"ok: run 2");

    assert_eq!(orchestrator.phase(job_id).unwrap(), JobPhase::Completed);
    assert_eq!(orchestrator.results(job_id).unwrap().len(), 2);
}

/// An external-approval job on an orchestrator without an approver is
/// refused at submission instead of degrading to byte equality.
#[test]
fn test_external_approval_requires_an_approver() {
    let (orchestrator, _storage) = setup();
    let mut spec = test_spec(Deal::default());
    spec.verifier = VerifierKind::ExternalApproval;
    let result = orchestrator.submit(spec, "client-1", b"key", b"sig");
    assert!(matches!(result, Err(FlotillaError::InvalidSpec(_))));
    assert_eq!(orchestrator.debug_snapshot().requester_jobs, 0);
}

/// Confidence above concurrency can never be met; the deal is invalid.
#[test]
fn test_invalid_deal_is_refused() {
    let (orchestrator, _storage) = setup();
    let deal = Deal {
        concurrency: 1,
        confidence: 2,
        min_bids: 1,
    };
    let result = orchestrator.submit(test_spec(deal), "client-1", b"key", b"sig");
    assert!(matches!(result, Err(FlotillaError::InvalidSpec(_))));
}

/// Cancellation is terminal: late bids are rejected and late proposals
/// change nothing.
#[test]
fn test_cancel_stops_further_work() {
    let (orchestrator, _storage) = setup();
    let deal = Deal {
        concurrency: 1,
        confidence: 1,
        min_bids: 2,
    };
    let job_id = submit(&orchestrator, test_spec(deal));
    bid(&orchestrator, job_id, 0, "node-a");

    orchestrator.cancel(job_id).unwrap();
    assert_eq!(orchestrator.phase(job_id).unwrap(), JobPhase::Cancelled);

    bid(&orchestrator, job_id, 0, "node-b");
    let rejections = events_of_kind(&orchestrator, job_id, JobEventKind::BidRejected);
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].target_node_id.as_deref(), Some("node-b"));

    propose(&orchestrator, job_id, 0, "node-a", b"late");
    assert!(events_of_kind(&orchestrator, job_id, JobEventKind::ResultsAccepted).is_empty());
    assert_eq!(orchestrator.phase(job_id).unwrap(), JobPhase::Cancelled);
}

/// Redelivering the same event does not double-transition the shard.
#[test]
fn test_duplicate_delivery_is_idempotent() {
    let (orchestrator, _storage) = setup();
    let job_id = submit(&orchestrator, test_spec(Deal::default()));

    let bid_event = JobEvent::new(JobEventKind::Bid, job_id, 0, "node-a").targeting("node-a");
    orchestrator.deliver(bid_event.clone()).unwrap();
    orchestrator.deliver(bid_event).unwrap();

    assert_eq!(
        events_of_kind(&orchestrator, job_id, JobEventKind::BidAccepted).len(),
        1
    );
    assert_eq!(orchestrator.describe(job_id).unwrap().len(), 1);
}

#[test]
fn test_describe_unknown_job_is_not_found() {
    let (orchestrator, _storage) = setup();
    let job_id = JobId::new_v4();
    assert!(matches!(
        orchestrator.describe(job_id),
        Err(FlotillaError::NotFound(id)) if id == job_id
    ));
}

#[test]
fn test_debug_snapshot_counts_active_work() {
    let (orchestrator, _storage) = setup();
    let job_id = submit(&orchestrator, test_spec(Deal::default()));
    bid(&orchestrator, job_id, 0, "node-a");

    let snapshot = orchestrator.debug_snapshot();
    assert_eq!(snapshot.requester_jobs, 1);
    assert_eq!(snapshot.active_jobs, 1);
    assert_eq!(snapshot.executing_shards, 1);
    assert_eq!(
        snapshot.available_capacity,
        OrchestratorConfig::default().max_jobs - 1
    );
}

/// The job cap refuses the submission that would exceed it and leaves no
/// partial state behind.
#[test]
fn test_job_capacity_is_enforced() {
    let config = OrchestratorConfig {
        max_jobs: 1,
        ..Default::default()
    };
    let (orchestrator, _storage) = setup_with_config(config);

    submit(&orchestrator, test_spec(Deal::default()));
    let refused = orchestrator.submit(test_spec(Deal::default()), "client-1", b"key", b"sig");
    assert!(matches!(refused, Err(FlotillaError::Internal(_))));

    let snapshot = orchestrator.debug_snapshot();
    assert_eq!(snapshot.requester_jobs, 1);
    assert_eq!(snapshot.available_capacity, 0);
}

/// A shard that never reaches MinBids fails at its deadline with an
/// insufficient-bids error.
#[tokio::test(flavor = "multi_thread")]
async fn test_deadline_fails_shard_with_insufficient_bids() {
    let config = OrchestratorConfig {
        housekeeping_interval_ms: 20,
        default_timeout_secs: 0.2,
        ..Default::default()
    };
    let (orchestrator, _storage) = setup_with_config(config);
    let deal = Deal {
        concurrency: 2,
        confidence: 1,
        min_bids: 2,
    };
    let job_id = submit(&orchestrator, test_spec(deal));
    bid(&orchestrator, job_id, 0, "node-a");

    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(orchestrator.clone().run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();
    runner.await.unwrap();

    assert_eq!(orchestrator.phase(job_id).unwrap(), JobPhase::Failed);
    let errors = events_of_kind(&orchestrator, job_id, JobEventKind::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].status.contains("insufficient bids: got 1, need 2"));
}

/// A matched shard whose node goes quiet times out and the job fails.
#[tokio::test(flavor = "multi_thread")]
async fn test_deadline_times_out_stalled_execution() {
    let config = OrchestratorConfig {
        housekeeping_interval_ms: 20,
        default_timeout_secs: 0.2,
        ..Default::default()
    };
    let (orchestrator, _storage) = setup_with_config(config);
    let job_id = submit(&orchestrator, test_spec(Deal::default()));
    bid(&orchestrator, job_id, 0, "node-a");
    report_running(&orchestrator, job_id, 0, "node-a");

    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(orchestrator.clone().run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();
    runner.await.unwrap();

    assert_eq!(orchestrator.phase(job_id).unwrap(), JobPhase::Failed);
    let errors = events_of_kind(&orchestrator, job_id, JobEventKind::Error);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].target_node_id.as_deref(), Some("node-a"));
    assert!(errors[0].status.contains("shard timed out"));
    assert_eq!(
        orchestrator.describe(job_id).unwrap().shard("node-a", 0).unwrap().state,
        ShardStateType::Error
    );
}

//! Tests for the pure fold from event sequences to job state.

use chrono::{Duration, Utc};
use flotilla::model::{
    JobEvent, JobEventKind, JobId, ShardStateType, StorageSpec, VerificationResult,
};
use flotilla::projector::project;

fn event(kind: JobEventKind, job_id: JobId, shard: usize, node: &str) -> JobEvent {
    JobEvent::new(kind, job_id, shard, "requester-1").targeting(node)
}

/// A full lifecycle for one node folds to Published with every payload
/// field captured along the way.
#[test]
fn test_fold_full_lifecycle() {
    let job_id = JobId::new_v4();
    let mut events = vec![
        JobEvent::new(JobEventKind::Created, job_id, 0, "requester-1"),
        JobEvent::new(JobEventKind::Bid, job_id, 0, "node-a").targeting("node-a"),
        event(JobEventKind::BidAccepted, job_id, 0, "node-a"),
        JobEvent::new(JobEventKind::Running, job_id, 0, "node-a").targeting("node-a"),
        JobEvent::new(JobEventKind::ResultsProposed, job_id, 0, "node-a")
            .targeting("node-a")
            .with_proposal(b"digest".to_vec()),
        event(JobEventKind::ResultsAccepted, job_id, 0, "node-a"),
        event(JobEventKind::ResultsPublished, job_id, 0, "node-a"),
    ];
    events[5].verification_result = Some(VerificationResult {
        complete: true,
        result: true,
    });
    events[6].published_result = Some(StorageSpec::ipfs("results", "QmResults", ""));

    // Give the sequence strictly increasing timestamps.
    let base = Utc::now();
    for (i, ev) in events.iter_mut().enumerate() {
        ev.event_time = base + Duration::milliseconds(i as i64);
    }

    let state = project(&events);
    let shard = state.shard("node-a", 0).expect("shard record exists");
    assert_eq!(shard.state, ShardStateType::Published);
    assert_eq!(shard.verification_proposal.as_deref(), Some(&b"digest"[..]));
    assert_eq!(
        shard.verification_result,
        Some(VerificationResult {
            complete: true,
            result: true
        })
    );
    assert_eq!(
        shard.published_result.as_ref().map(|s| s.cid.as_str()),
        Some("QmResults")
    );
    assert_eq!(state.skipped_events, 0);
}

/// Projecting the same log twice yields identical state.
#[test]
fn test_fold_is_deterministic_and_replayable() {
    let job_id = JobId::new_v4();
    let events = vec![
        JobEvent::new(JobEventKind::Bid, job_id, 0, "node-a").targeting("node-a"),
        JobEvent::new(JobEventKind::Bid, job_id, 1, "node-b").targeting("node-b"),
        event(JobEventKind::BidAccepted, job_id, 0, "node-a"),
        event(JobEventKind::BidRejected, job_id, 1, "node-b"),
    ];

    let first = project(&events);
    let second = project(&events);
    assert_eq!(first, second);
    assert_eq!(first.shard("node-a", 0).unwrap().state, ShardStateType::Accepted);
    assert_eq!(first.shard("node-b", 1).unwrap().state, ShardStateType::Rejected);
}

/// Duplicate delivery of one event must not double-transition: the fold
/// dedupes by event identity.
#[test]
fn test_fold_dedupes_by_event_identity() {
    let job_id = JobId::new_v4();
    let bid = JobEvent::new(JobEventKind::Bid, job_id, 0, "node-a").targeting("node-a");
    let accepted = event(JobEventKind::BidAccepted, job_id, 0, "node-a");
    let events = vec![bid.clone(), accepted.clone(), accepted.clone(), bid];

    let state = project(&events);
    assert_eq!(state.len(), 1);
    assert_eq!(state.shard("node-a", 0).unwrap().state, ShardStateType::Accepted);
}

/// Unknown event kinds are counted and skipped; the rest of the log still
/// projects.
#[test]
fn test_fold_skips_unknown_event_kinds() {
    let job_id = JobId::new_v4();
    let events = vec![
        JobEvent::new(JobEventKind::Bid, job_id, 0, "node-a").targeting("node-a"),
        JobEvent::new(JobEventKind::Unknown, job_id, 0, "node-a"),
        event(JobEventKind::BidAccepted, job_id, 0, "node-a"),
    ];

    let state = project(&events);
    assert_eq!(state.skipped_events, 1);
    assert_eq!(state.shard("node-a", 0).unwrap().state, ShardStateType::Accepted);
}

/// A cancelled shard is terminal: later events against it are ignored.
#[test]
fn test_fold_cancellation_halts_progression() {
    let job_id = JobId::new_v4();
    let base = Utc::now();
    let mut events = vec![
        JobEvent::new(JobEventKind::Bid, job_id, 0, "node-a").targeting("node-a"),
        event(JobEventKind::BidAccepted, job_id, 0, "node-a"),
        event(JobEventKind::Canceled, job_id, 0, "node-a"),
        JobEvent::new(JobEventKind::Running, job_id, 0, "node-a").targeting("node-a"),
        JobEvent::new(JobEventKind::ResultsProposed, job_id, 0, "node-a")
            .targeting("node-a")
            .with_proposal(b"late".to_vec()),
    ];
    for (i, ev) in events.iter_mut().enumerate() {
        ev.event_time = base + Duration::milliseconds(i as i64);
    }

    let state = project(&events);
    let shard = state.shard("node-a", 0).unwrap();
    assert_eq!(shard.state, ShardStateType::Cancelled);
    assert!(shard.verification_proposal.is_none());
}

/// Events are folded in `(shard_index, event_time)` order regardless of the
/// order they arrive in the slice.
#[test]
fn test_fold_orders_by_shard_and_time() {
    let job_id = JobId::new_v4();
    let base = Utc::now();

    let mut accepted = event(JobEventKind::BidAccepted, job_id, 0, "node-a");
    accepted.event_time = base + Duration::milliseconds(2);
    let mut bid = JobEvent::new(JobEventKind::Bid, job_id, 0, "node-a").targeting("node-a");
    bid.event_time = base + Duration::milliseconds(1);

    // Accepted arrives before the bid; time order must win.
    let state = project(&[accepted, bid]);
    assert_eq!(state.shard("node-a", 0).unwrap().state, ShardStateType::Accepted);
}

/// A proposal without a digest (trust-all verifier) leaves the node waiting
/// for verification rather than marking it proposed.
#[test]
fn test_fold_proposal_without_digest_awaits_verification() {
    let job_id = JobId::new_v4();
    let events = vec![
        JobEvent::new(JobEventKind::Bid, job_id, 0, "node-a").targeting("node-a"),
        event(JobEventKind::BidAccepted, job_id, 0, "node-a"),
        JobEvent::new(JobEventKind::ResultsProposed, job_id, 0, "node-a").targeting("node-a"),
    ];
    let state = project(&events);
    assert_eq!(
        state.shard("node-a", 0).unwrap().state,
        ShardStateType::AwaitingVerification
    );
}

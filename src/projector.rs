use std::collections::HashSet;

use crate::error::{FlotillaError, Result};
use crate::model::{JobEvent, JobEventKind, JobState, ShardStateType};

/// Fold a job's event sequence into its current state.
///
/// This is a pure function of the log: idempotent, replayable and
/// deterministic. Events are ordered by `(shard_index, event_time)` with a
/// stable tiebreak on arrival order, duplicates (same `event_id`) are
/// folded once, and unknown event kinds are skipped with a warning so
/// partial or forward-compatible logs still project.
pub fn project(events: &[JobEvent]) -> JobState {
    let mut ordered: Vec<&JobEvent> = events.iter().collect();
    ordered.sort_by_key(|ev| (ev.shard_index, ev.event_time));

    let mut state = JobState::new();
    let mut seen = HashSet::new();
    for event in ordered {
        if !seen.insert(event.event_id) {
            tracing::warn!(
                job_id = %event.job_id,
                event_id = %event.event_id,
                "Skipping duplicate event in fold"
            );
            continue;
        }
        if let Err(err) = apply(&mut state, event) {
            tracing::warn!(
                job_id = %event.job_id,
                shard = event.shard_index,
                error = %err,
                "Skipping event the fold does not understand"
            );
            state.skipped_events += 1;
        }
    }
    state
}

/// Apply a single event to a projected state: the one-step transition
/// function `project` is built from. Exposed so the orchestrator can keep an
/// incremental projection without replaying the whole log on every event.
pub fn apply(state: &mut JobState, event: &JobEvent) -> Result<()> {
    if event.kind == JobEventKind::Unknown {
        return Err(FlotillaError::UnknownEventKind(event.kind.to_string()));
    }

    let next = match shard_state_for(event) {
        Some(next) => next,
        // Job-level events (Created) carry no shard transition.
        None => return Ok(()),
    };

    let node = event.subject_node().to_string();
    let shard = state.shard_entry(&node, event.shard_index);

    // A terminal shard never transitions again; late or out-of-order events
    // against it are dropped. This is what makes cancellation stick.
    if shard.state.is_terminal() {
        tracing::debug!(
            job_id = %event.job_id,
            shard = event.shard_index,
            node = %node,
            state = %shard.state,
            kind = %event.kind,
            "Ignoring event against terminal shard"
        );
        return Ok(());
    }

    shard.state = next;
    if !event.status.is_empty() {
        shard.status = event.status.clone();
    }
    if let Some(proposal) = &event.verification_proposal {
        shard.verification_proposal = Some(proposal.clone());
    }
    if let Some(result) = event.verification_result {
        shard.verification_result = Some(result);
    }
    if let Some(published) = &event.published_result {
        shard.published_result = Some(published.clone());
    }
    if let Some(output) = &event.run_output {
        shard.run_output = Some(output.clone());
    }
    Ok(())
}

/// The shard state an event kind folds to, or `None` for job-level events.
fn shard_state_for(event: &JobEvent) -> Option<ShardStateType> {
    match event.kind {
        JobEventKind::Created => None,
        JobEventKind::Bid => Some(ShardStateType::Bidding),
        JobEventKind::BidAccepted => Some(ShardStateType::Accepted),
        JobEventKind::BidRejected => Some(ShardStateType::Rejected),
        JobEventKind::Preparing => Some(ShardStateType::PreparingToRun),
        JobEventKind::Running => Some(ShardStateType::Running),
        // A proposing node that supplied a digest has proposed; one that
        // merely signalled completion (trust-all verifier) is still waiting.
        JobEventKind::ResultsProposed => {
            if event.verification_proposal.is_some() {
                Some(ShardStateType::VerificationProposed)
            } else {
                Some(ShardStateType::AwaitingVerification)
            }
        }
        JobEventKind::ResultsAccepted => Some(ShardStateType::ResultAccepted),
        JobEventKind::ResultsRejected => Some(ShardStateType::ResultRejected),
        JobEventKind::ResultsPublished => Some(ShardStateType::Published),
        JobEventKind::Error => Some(ShardStateType::Error),
        JobEventKind::Canceled => Some(ShardStateType::Cancelled),
        // Rejected before we get here; `apply` surfaces it as an error.
        JobEventKind::Unknown => None,
    }
}

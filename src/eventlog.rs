use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{FlotillaError, Result};
use crate::model::{JobEvent, JobId, JobLocalEvent, NodeId};

/// Synchronous subscriber invoked for every appended event, in append order.
pub type SubscribeFn = Box<dyn Fn(&JobEvent) + Send + Sync>;

/// Append-only, totally ordered per job, the source of truth for all state
/// transitions. `JobState` is always derived by folding this log.
///
/// Appends for one job are linearized under a per-job lock; different jobs
/// never contend. Subscribers observe the events of a job in append order:
/// a subscriber that appends from inside its callback does not recurse -
/// the nested event is queued and dispatched by the outer drain loop, which
/// also keeps the observed order equal to the append order.
#[derive(Default)]
pub struct EventLog {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<JobLogInner>>>>,
    subscribers: RwLock<Vec<SubscribeFn>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<JobEvent>>>,
    local: Mutex<HashMap<NodeId, Vec<JobLocalEvent>>>,
}

struct JobLogInner {
    shards_total: usize,
    events: Vec<JobEvent>,
    seen: HashSet<Uuid>,
    pending: VecDeque<JobEvent>,
    draining: bool,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job before any events for it can be appended. The shard
    /// count bounds the `shard_index` of every subsequent event.
    pub fn register_job(&self, job_id: JobId, shards_total: usize) -> Result<()> {
        let mut jobs = self.jobs.write().expect("event log lock poisoned");
        if jobs.contains_key(&job_id) {
            return Err(FlotillaError::Internal(format!(
                "job {} already registered",
                job_id
            )));
        }
        jobs.insert(
            job_id,
            Arc::new(Mutex::new(JobLogInner {
                shards_total,
                events: Vec::new(),
                seen: HashSet::new(),
                pending: VecDeque::new(),
                draining: false,
            })),
        );
        Ok(())
    }

    /// Append an event and notify every subscriber.
    ///
    /// Fails with `UnknownJob` for unregistered jobs and `InvalidEvent` when
    /// the shard index exceeds the job's execution plan. Duplicate delivery
    /// (same `event_id`) is dropped with a warning, not an error.
    pub fn append(&self, event: JobEvent) -> Result<()> {
        let log = self.job_log(event.job_id)?;

        {
            let mut inner = log.lock().expect("event log lock poisoned");
            if event.shard_index >= inner.shards_total {
                return Err(FlotillaError::InvalidEvent(format!(
                    "shard index {} out of range for job {} with {} shards",
                    event.shard_index, event.job_id, inner.shards_total
                )));
            }
            if !inner.seen.insert(event.event_id) {
                tracing::warn!(
                    job_id = %event.job_id,
                    event_id = %event.event_id,
                    kind = %event.kind,
                    "Dropping duplicate event delivery"
                );
                return Ok(());
            }
            tracing::debug!(
                job_id = %event.job_id,
                shard = event.shard_index,
                kind = %event.kind,
                source = %event.source_node_id,
                "Event appended"
            );
            inner.events.push(event.clone());
            inner.pending.push_back(event);
            if inner.draining {
                // A callback higher up this job's stack is dispatching; it
                // will pick this event up next.
                return Ok(());
            }
            inner.draining = true;
        }

        loop {
            let next = {
                let mut inner = log.lock().expect("event log lock poisoned");
                match inner.pending.pop_front() {
                    Some(ev) => ev,
                    None => {
                        inner.draining = false;
                        break;
                    }
                }
            };
            self.notify(&next);
        }

        Ok(())
    }

    /// The full event sequence for a job, in append order.
    pub fn events_for(&self, job_id: JobId) -> Result<Vec<JobEvent>> {
        let log = self.job_log(job_id)?;
        let inner = log.lock().expect("event log lock poisoned");
        Ok(inner.events.clone())
    }

    /// Register a synchronous subscriber. Called for every event of every
    /// job, in per-job append order, before `append` returns.
    pub fn subscribe_fn(&self, f: SubscribeFn) {
        self.subscribers
            .write()
            .expect("event log lock poisoned")
            .push(f);
    }

    /// Channel-based subscription for async observers. Events arrive in the
    /// same order synchronous subscribers saw them.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .expect("event log lock poisoned")
            .push(tx);
        rx
    }

    /// Append to the node-scoped local log. Local events are bookkeeping
    /// ("I started executing shard 3") and never join the distributed log.
    pub fn append_local(&self, node_id: &str, event: JobLocalEvent) {
        self.local
            .lock()
            .expect("event log lock poisoned")
            .entry(node_id.to_string())
            .or_default()
            .push(event);
    }

    pub fn local_events_for(&self, node_id: &str, job_id: JobId) -> Vec<JobLocalEvent> {
        self.local
            .lock()
            .expect("event log lock poisoned")
            .get(node_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|ev| ev.job_id == job_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn job_log(&self, job_id: JobId) -> Result<Arc<Mutex<JobLogInner>>> {
        self.jobs
            .read()
            .expect("event log lock poisoned")
            .get(&job_id)
            .cloned()
            .ok_or(FlotillaError::UnknownJob(job_id))
    }

    fn notify(&self, event: &JobEvent) {
        let subscribers = self.subscribers.read().expect("event log lock poisoned");
        for f in subscribers.iter() {
            f(event);
        }
        drop(subscribers);

        let mut watchers = self.watchers.lock().expect("event log lock poisoned");
        watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

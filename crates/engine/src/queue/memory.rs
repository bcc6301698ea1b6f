//! In-process job queue with the same lease/backoff behaviour as the Redis
//! queue. Delays are measured on the tokio clock.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use herald_common::retry::JobOptions;
use herald_common::types::DeliveryJob;

use super::{FailureDisposition, JobQueue, QueueCounts, QueueError, QueuedJob, record_failure};

#[derive(Default)]
struct QueueState {
    records: HashMap<String, QueuedJob>,
    wait: VecDeque<String>,
    /// Leased job ids with their lease deadline.
    active: Vec<(String, Instant)>,
    delayed: Vec<(String, Instant)>,
    dead: Vec<String>,
    /// Every payload ever enqueued, in order.
    enqueued: Vec<DeliveryJob>,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(_, ready_at)| *ready_at <= now);
        self.delayed = pending;
        for (id, _) in due {
            self.wait.push_back(id);
        }
    }

    fn release(&mut self, id: &str) {
        self.active.retain(|(active_id, _)| active_id != id);
    }
}

pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    lease: Duration,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::with_lease(Duration::from_secs(30))
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            lease,
        }
    }

    /// Payloads enqueued so far, including ones already processed.
    pub async fn enqueued(&self) -> Vec<DeliveryJob> {
        self.state.lock().await.enqueued.clone()
    }

    /// Make every delayed job ready now, skipping its remaining backoff.
    pub async fn release_delayed(&self) -> usize {
        let mut state = self.state.lock().await;
        let released = state.delayed.len();
        let delayed = std::mem::take(&mut state.delayed);
        state.wait.extend(delayed.into_iter().map(|(id, _)| id));
        released
    }

    /// Expire every active lease, as if the workers holding them crashed.
    pub async fn expire_leases(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        for (_, deadline) in state.active.iter_mut() {
            *deadline = now;
        }
    }

    /// Snapshot of a job record by id.
    pub async fn job(&self, id: &str) -> Option<QueuedJob> {
        self.state.lock().await.records.get(id).cloned()
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, data: DeliveryJob, opts: JobOptions) -> Result<String, QueueError> {
        let job = QueuedJob::new(data, opts);
        let id = job.id.clone();
        let mut state = self.state.lock().await;
        state.records.insert(id.clone(), job);
        state.wait.push_back(id.clone());
        state.enqueued.push(data);
        Ok(id)
    }

    async fn fetch(&self) -> Result<Option<QueuedJob>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.promote_due(now);

        while let Some(id) = state.wait.pop_front() {
            if let Some(job) = state.records.get(&id).cloned() {
                state.active.push((id, now + self.lease));
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.release(&job.id);
        state.records.remove(&job.id);
        Ok(())
    }

    async fn fail(
        &self,
        job: &QueuedJob,
        reason: &str,
    ) -> Result<FailureDisposition, QueueError> {
        let (failed, disposition) = record_failure(job, reason);
        let mut state = self.state.lock().await;
        state.release(&failed.id);

        match disposition {
            FailureDisposition::Rescheduled { delay, .. } => {
                state
                    .delayed
                    .push((failed.id.clone(), Instant::now() + delay));
            }
            FailureDisposition::Dropped { .. } => state.dead.push(failed.id.clone()),
        }
        state.records.insert(failed.id.clone(), failed);
        Ok(disposition)
    }

    async fn reclaim_stalled(&self) -> Result<u64, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut state.active)
            .into_iter()
            .partition(|(_, deadline)| *deadline <= now);
        state.active = live;

        let reclaimed = expired.len() as u64;
        for (id, _) in expired {
            state.wait.push_front(id);
        }
        Ok(reclaimed)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.state.lock().await;
        Ok(QueueCounts {
            waiting: state.wait.len() as u64,
            active: state.active.len() as u64,
            delayed: state.delayed.len() as u64,
            dead: state.dead.len() as u64,
        })
    }
}

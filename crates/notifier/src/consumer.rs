//! Queue consumer: a pool of polling loops that feed jobs to the delivery
//! worker and report each result back to the queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;

use herald_common::config::AppConfig;
use herald_common::types::DeliveryJob;
use herald_engine::queue::{FailureDisposition, JobQueue, QueueError, QueuedJob};

use crate::worker::{DeliveryWorker, JobOutcome};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Number of concurrent polling loops.
    pub concurrency: usize,
    /// Idle wait after an empty fetch.
    pub poll_interval: Duration,
    /// How often expired leases are returned to the queue.
    pub stall_check_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            stall_check_interval: Duration::from_secs(15),
        }
    }
}

impl ConsumerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            concurrency: config.worker_concurrency.max(1),
            poll_interval: Duration::from_millis(config.queue_poll_interval_ms),
            stall_check_interval: Duration::from_secs((config.queue_lease_seconds / 2).max(1)),
        }
    }
}

/// How a job was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    /// The worker finished with the job; it was removed from the queue.
    Completed(JobOutcome),
    /// The worker reported a retryable error.
    Retried(FailureDisposition),
    /// The worker reported an error that redelivery cannot fix; the job was
    /// removed.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct ProcessedJob {
    pub job_id: String,
    pub data: DeliveryJob,
    pub disposition: JobDisposition,
}

pub struct QueueConsumer {
    queue: Arc<dyn JobQueue>,
    worker: Arc<DeliveryWorker>,
    config: ConsumerConfig,
}

impl QueueConsumer {
    pub fn new(queue: Arc<dyn JobQueue>, worker: Arc<DeliveryWorker>, config: ConsumerConfig) -> Self {
        Self {
            queue,
            worker,
            config,
        }
    }

    /// Fetch one ready job, run it and acknowledge it. Returns `None` when
    /// nothing is ready.
    pub async fn process_next(&self) -> Result<Option<ProcessedJob>, QueueError> {
        let Some(job) = self.queue.fetch().await? else {
            return Ok(None);
        };

        let span = tracing::info_span!(
            "delivery_job",
            job_id = %job.id,
            notification_id = job.data.notification_id,
            user_id = job.data.user_id,
            attempt = job.attempts_made + 1,
        );
        self.handle(job).instrument(span).await.map(Some)
    }

    async fn handle(&self, job: QueuedJob) -> Result<ProcessedJob, QueueError> {
        let disposition = match self.worker.process(job.data).await {
            Ok(outcome) => {
                self.queue.complete(&job).await?;
                JobDisposition::Completed(outcome)
            }
            Err(e) if e.is_retryable() => {
                let disposition = self.queue.fail(&job, &e.to_string()).await?;
                match disposition {
                    FailureDisposition::Rescheduled { attempt, delay } => tracing::info!(
                        error = %e,
                        next_attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Job failed, rescheduled"
                    ),
                    FailureDisposition::Dropped { attempts } => tracing::warn!(
                        error = %e,
                        attempts,
                        "Job failed on its last attempt, dropped"
                    ),
                }
                JobDisposition::Retried(disposition)
            }
            Err(e) => {
                tracing::error!(error = %e, "Job failed permanently, removing from queue");
                self.queue.complete(&job).await?;
                JobDisposition::Rejected
            }
        };

        Ok(ProcessedJob {
            job_id: job.id,
            data: job.data,
            disposition,
        })
    }

    /// Run the polling loops and the stall reclaimer until `shutdown` flips
    /// to `true` or its sender is dropped.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();
        for worker_index in 0..self.config.concurrency.max(1) {
            tasks.spawn(self.clone().poll_loop(worker_index, shutdown.clone()));
        }
        tasks.spawn(self.clone().reclaim_loop(shutdown));

        tracing::info!(
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Queue consumer started"
        );

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Consumer task panicked");
            }
        }

        tracing::info!("Queue consumer stopped");
    }

    async fn poll_loop(self: Arc<Self>, worker_index: usize, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(worker = worker_index, error = %e, "Failed to poll delivery queue");
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn reclaim_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.stall_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.queue.reclaim_stalled().await {
                        tracing::error!(error = %e, "Failed to reclaim stalled jobs");
                    }
                }
            }
        }
    }
}

//! Stuck-delivery sweep.
//!
//! A worker that dies between claiming a delivery and writing its outcome
//! leaves the row in `PROCESSING`, and workers refuse to claim such rows. The
//! sweep finds rows that have sat in `PROCESSING` longer than the configured
//! age and counts the lost attempt as a failure: `RETRYING` plus a fresh job
//! while retries remain, `FAILED` otherwise.
//!
//! A `RETRYING` row older than the same age has lost its job (a failed
//! enqueue, or a job the queue dropped). The sweep touches it and enqueues a
//! new job. Errors on one row are counted and the pass moves on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use herald_common::config::AppConfig;
use herald_common::retry::{FailureDecision, RetryPolicy};
use herald_common::types::{Delivery, DeliveryJob, DeliveryStatus};
use herald_engine::ledger::{DeliveryLedger, TransitionOutcome};
use herald_engine::queue::JobQueue;
use herald_engine::state_machine::DeliveryEvent;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    /// Rows untouched in `PROCESSING` for longer than this are recovered.
    pub stuck_after: chrono::Duration,
    pub batch_size: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stuck_after: chrono::Duration::seconds(120),
            batch_size: 100,
        }
    }
}

impl SweepConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.sweep_interval_seconds.max(1)),
            stuck_after: chrono::Duration::seconds(config.stuck_processing_seconds as i64),
            ..Self::default()
        }
    }
}

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Rows that moved on before the sweep could write.
    pub skipped: usize,
    /// Rows whose recovery hit a storage or queue error; retried next pass.
    pub errors: usize,
}

pub struct StuckDeliverySweep {
    ledger: Arc<dyn DeliveryLedger>,
    queue: Arc<dyn JobQueue>,
    policy: RetryPolicy,
    config: SweepConfig,
}

impl StuckDeliverySweep {
    pub fn new(
        ledger: Arc<dyn DeliveryLedger>,
        queue: Arc<dyn JobQueue>,
        policy: RetryPolicy,
        config: SweepConfig,
    ) -> Self {
        Self {
            ledger,
            queue,
            policy,
            config,
        }
    }

    /// One pass over abandoned rows.
    ///
    /// `PROCESSING` rows count as a failed attempt. `RETRYING` rows that sat
    /// longer than `stuck_after` lost their queue job and get a new one.
    pub async fn run_once(&self) -> anyhow::Result<SweepReport> {
        let cutoff = Utc::now() - self.config.stuck_after;
        let processing = self
            .ledger
            .stale_deliveries(DeliveryStatus::Processing, cutoff, self.config.batch_size)
            .await?;
        let retrying = self
            .ledger
            .stale_deliveries(DeliveryStatus::Retrying, cutoff, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            examined: processing.len() + retrying.len(),
            ..SweepReport::default()
        };

        for delivery in &processing {
            if let Err(e) = self.recover_processing(delivery, &mut report).await {
                report.errors += 1;
                tracing::error!(delivery_id = delivery.id, error = %e, "Failed to recover stuck delivery");
            }
        }
        for delivery in &retrying {
            if let Err(e) = self.recover_retrying(delivery, &mut report).await {
                report.errors += 1;
                tracing::error!(delivery_id = delivery.id, error = %e, "Failed to requeue retrying delivery");
            }
        }

        if report.examined > 0 {
            tracing::warn!(
                examined = report.examined,
                requeued = report.requeued,
                failed = report.failed,
                skipped = report.skipped,
                errors = report.errors,
                "Recovered abandoned deliveries"
            );
        }
        Ok(report)
    }

    async fn recover_processing(
        &self,
        delivery: &Delivery,
        report: &mut SweepReport,
    ) -> anyhow::Result<()> {
        let event = match self.policy.on_failure(delivery.retry_count) {
            FailureDecision::Retry => DeliveryEvent::Retry,
            FailureDecision::Exhausted => DeliveryEvent::Exhaust,
        };

        let updated = match self.ledger.apply(delivery, event).await? {
            TransitionOutcome::Applied(updated) => updated,
            TransitionOutcome::Conflict => {
                report.skipped += 1;
                return Ok(());
            }
        };

        if updated.status.is_terminal() {
            report.failed += 1;
            return Ok(());
        }

        // A failed enqueue leaves the row RETRYING; a later pass picks it up.
        self.enqueue(&updated).await?;
        report.requeued += 1;
        Ok(())
    }

    async fn recover_retrying(
        &self,
        delivery: &Delivery,
        report: &mut SweepReport,
    ) -> anyhow::Result<()> {
        let touched = match self.ledger.touch(delivery).await? {
            TransitionOutcome::Applied(touched) => touched,
            TransitionOutcome::Conflict => {
                report.skipped += 1;
                return Ok(());
            }
        };

        self.enqueue(&touched).await?;
        report.requeued += 1;
        Ok(())
    }

    async fn enqueue(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let job = DeliveryJob {
            notification_id: delivery.notification_id,
            user_id: delivery.user_id,
        };
        let job_id = self.queue.enqueue(job, self.policy.job_options()).await?;
        tracing::info!(
            delivery_id = delivery.id,
            status = %delivery.status,
            retry_count = delivery.retry_count,
            job_id = %job_id,
            "Abandoned delivery requeued"
        );
        Ok(())
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            stuck_after_secs = self.config.stuck_after.num_seconds(),
            "Stuck-delivery sweep started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "Stuck-delivery sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use herald_common::retry::JobOptions;
    use herald_engine::ledger::InMemoryDeliveryLedger;
    use herald_engine::queue::{
        FailureDisposition, InMemoryJobQueue, QueueCounts, QueueError, QueuedJob,
    };

    /// In-memory queue whose `enqueue` fails while `down` is set.
    struct FlakyQueue {
        inner: InMemoryJobQueue,
        down: AtomicBool,
    }

    impl FlakyQueue {
        fn down() -> Self {
            Self {
                inner: InMemoryJobQueue::new(),
                down: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl JobQueue for FlakyQueue {
        async fn enqueue(&self, data: DeliveryJob, opts: JobOptions) -> Result<String, QueueError> {
            if self.down.load(Ordering::SeqCst) {
                let err = serde_json::from_str::<u8>("connection refused").unwrap_err();
                return Err(QueueError::Serialization(err));
            }
            self.inner.enqueue(data, opts).await
        }

        async fn fetch(&self) -> Result<Option<QueuedJob>, QueueError> {
            self.inner.fetch().await
        }

        async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
            self.inner.complete(job).await
        }

        async fn fail(&self, job: &QueuedJob, reason: &str) -> Result<FailureDisposition, QueueError> {
            self.inner.fail(job, reason).await
        }

        async fn reclaim_stalled(&self) -> Result<u64, QueueError> {
            self.inner.reclaim_stalled().await
        }

        async fn counts(&self) -> Result<QueueCounts, QueueError> {
            self.inner.counts().await
        }
    }

    async fn stuck_delivery(
        ledger: &InMemoryDeliveryLedger,
        retry_count: i32,
    ) -> Delivery {
        let template = ledger.add_template("Hello", "Hi {{name}}").await;
        ledger.add_user(1, Some("Sam")).await;
        let notification = ledger.create_notification(template.id).await.unwrap();
        let mut delivery = ledger
            .insert_delivery(notification.id, 1)
            .await
            .unwrap()
            .unwrap();

        for _ in 0..retry_count {
            let TransitionOutcome::Applied(claimed) =
                ledger.apply(&delivery, DeliveryEvent::Claim).await.unwrap()
            else {
                panic!("claim should apply");
            };
            let TransitionOutcome::Applied(retrying) =
                ledger.apply(&claimed, DeliveryEvent::Retry).await.unwrap()
            else {
                panic!("retry should apply");
            };
            delivery = retrying;
        }

        let TransitionOutcome::Applied(processing) =
            ledger.apply(&delivery, DeliveryEvent::Claim).await.unwrap()
        else {
            panic!("claim should apply");
        };
        ledger
            .backdate(processing.id, chrono::Duration::seconds(600))
            .await;
        processing
    }

    fn sweep(ledger: Arc<InMemoryDeliveryLedger>, queue: Arc<InMemoryJobQueue>) -> StuckDeliverySweep {
        StuckDeliverySweep::new(ledger, queue, RetryPolicy::default(), SweepConfig::default())
    }

    #[tokio::test]
    async fn test_stuck_delivery_with_retries_left_is_requeued() {
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let stuck = stuck_delivery(&ledger, 0).await;

        let report = sweep(ledger.clone(), queue.clone()).run_once().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                examined: 1,
                requeued: 1,
                ..SweepReport::default()
            }
        );

        let delivery = ledger.delivery(stuck.id).await.unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Retrying);
        assert_eq!(delivery.retry_count, 1);
        assert_eq!(
            queue.enqueued().await,
            vec![DeliveryJob {
                notification_id: stuck.notification_id,
                user_id: 1
            }]
        );
    }

    #[tokio::test]
    async fn test_stuck_delivery_on_last_attempt_fails() {
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let stuck = stuck_delivery(&ledger, 2).await;

        let report = sweep(ledger.clone(), queue.clone()).run_once().await.unwrap();
        assert_eq!(report.failed, 1);

        let delivery = ledger.delivery(stuck.id).await.unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(delivery.retry_count, 2);
        assert!(queue.enqueued().await.is_empty());
    }

    #[tokio::test]
    async fn test_recent_processing_rows_untouched() {
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let template = ledger.add_template("Hello", "Hi").await;
        ledger.add_user(1, None).await;
        let notification = ledger.create_notification(template.id).await.unwrap();
        let delivery = ledger
            .insert_delivery(notification.id, 1)
            .await
            .unwrap()
            .unwrap();
        ledger.apply(&delivery, DeliveryEvent::Claim).await.unwrap();

        let report = sweep(ledger.clone(), queue).run_once().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(
            ledger.delivery(delivery.id).await.unwrap().status,
            DeliveryStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_failed_requeue_is_recovered_on_a_later_pass() {
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let queue = Arc::new(FlakyQueue::down());
        let stuck = stuck_delivery(&ledger, 0).await;
        let sweep = StuckDeliverySweep::new(
            ledger.clone(),
            queue.clone(),
            RetryPolicy::default(),
            SweepConfig::default(),
        );

        let report = sweep.run_once().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                examined: 1,
                errors: 1,
                ..SweepReport::default()
            }
        );
        let delivery = ledger.delivery(stuck.id).await.unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Retrying);
        assert_eq!(delivery.retry_count, 1);

        queue.down.store(false, Ordering::SeqCst);
        assert_eq!(sweep.run_once().await.unwrap(), SweepReport::default());

        ledger
            .backdate(stuck.id, chrono::Duration::seconds(600))
            .await;
        let report = sweep.run_once().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                examined: 1,
                requeued: 1,
                ..SweepReport::default()
            }
        );
        assert_eq!(queue.inner.enqueued().await.len(), 1);

        let delivery = ledger.delivery(stuck.id).await.unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Retrying);
        assert_eq!(delivery.retry_count, 1);
        assert_eq!(
            ledger.history(stuck.id).await,
            vec![
                DeliveryStatus::Queued,
                DeliveryStatus::Processing,
                DeliveryStatus::Retrying,
            ]
        );

        // The requeue refreshed the row, so the next pass leaves it alone.
        assert_eq!(sweep.run_once().await.unwrap().examined, 0);
    }

    #[tokio::test]
    async fn test_row_error_does_not_abort_the_batch() {
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let queue = Arc::new(FlakyQueue::down());
        let first = stuck_delivery(&ledger, 0).await;
        let second = stuck_delivery(&ledger, 0).await;
        let sweep = StuckDeliverySweep::new(
            ledger.clone(),
            queue,
            RetryPolicy::default(),
            SweepConfig::default(),
        );

        let report = sweep.run_once().await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.errors, 2);
        for id in [first.id, second.id] {
            assert_eq!(
                ledger.delivery(id).await.unwrap().status,
                DeliveryStatus::Retrying
            );
        }
    }
}

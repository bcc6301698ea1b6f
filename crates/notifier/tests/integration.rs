//! End-to-end delivery pipeline tests: dispatcher → queue → consumer →
//! worker → ledger, on the in-memory ledger and queue.
//!
//! ```bash
//! cargo test -p herald-notifier --test integration
//! ```

use std::sync::Arc;

use herald_common::retry::RetryPolicy;
use herald_common::types::{DeliveryJob, DeliveryStatus};
use herald_engine::dispatcher::{Dispatcher, TriggerRequest};
use herald_engine::ledger::{DeliveryLedger, InMemoryDeliveryLedger};
use herald_engine::queue::{FailureDisposition, InMemoryJobQueue, JobQueue};
use herald_engine::state_machine::{DeliveryEvent, is_valid_walk};
use herald_notifier::channel::ScriptedChannel;
use herald_notifier::consumer::{ConsumerConfig, JobDisposition, ProcessedJob, QueueConsumer};
use herald_notifier::sweep::{StuckDeliverySweep, SweepConfig};
use herald_notifier::worker::{DeliveryWorker, DiscardReason, JobOutcome};

// ============================================================
// Shared helpers
// ============================================================

struct Pipeline {
    ledger: Arc<InMemoryDeliveryLedger>,
    queue: Arc<InMemoryJobQueue>,
    channel: Arc<ScriptedChannel>,
    dispatcher: Dispatcher,
    worker: Arc<DeliveryWorker>,
    consumer: QueueConsumer,
    template_id: i64,
}

async fn pipeline(channel: ScriptedChannel) -> Pipeline {
    let ledger = Arc::new(InMemoryDeliveryLedger::new());
    let queue = Arc::new(InMemoryJobQueue::new());
    let channel = Arc::new(channel);
    let policy = RetryPolicy::default();

    let template = ledger.add_template("Welcome", "Hi {{name}}").await;
    ledger.add_user(1, Some("Sam")).await;
    ledger.add_user(2, Some("Ana")).await;
    ledger.add_user(3, None).await;
    ledger.add_user(4, Some("Lee")).await;
    ledger.add_user(5, Some("Kim")).await;

    let dispatcher = Dispatcher::new(ledger.clone(), queue.clone(), policy);
    let worker = Arc::new(DeliveryWorker::new(ledger.clone(), channel.clone(), policy));
    let consumer = QueueConsumer::new(queue.clone(), worker.clone(), ConsumerConfig::default());

    Pipeline {
        ledger,
        queue,
        channel,
        dispatcher,
        worker,
        consumer,
        template_id: template.id,
    }
}

impl Pipeline {
    async fn trigger(&self, user_ids: Vec<i64>) -> i64 {
        self.dispatcher
            .dispatch(TriggerRequest {
                template_id: Some(self.template_id),
                user_ids: Some(user_ids),
            })
            .await
            .unwrap()
            .notification_id
    }

    /// Process until nothing is ready or delayed, skipping backoff waits.
    async fn drain(&self) -> Vec<ProcessedJob> {
        let mut processed = Vec::new();
        loop {
            while let Some(job) = self.consumer.process_next().await.unwrap() {
                processed.push(job);
            }
            if self.queue.release_delayed().await == 0 {
                break;
            }
        }
        processed
    }
}

// ============================================================
// Scenarios
// ============================================================

#[tokio::test]
async fn test_dispatch_then_deliver_to_every_recipient() {
    let p = pipeline(ScriptedChannel::succeeding()).await;
    let notification_id = p.trigger(vec![1, 2]).await;

    let processed = p.drain().await;
    assert_eq!(processed.len(), 2);

    for user_id in [1, 2] {
        let delivery = p
            .ledger
            .find_delivery(notification_id, user_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Sent);
        assert_eq!(delivery.retry_count, 0);
    }
    assert_eq!(p.ledger.messages_for(1).await[0].message, "Hi Sam");
    assert_eq!(p.ledger.messages_for(2).await[0].message, "Hi Ana");
}

#[tokio::test]
async fn test_fail_fail_succeed_ends_sent_with_one_message() {
    let p = pipeline(ScriptedChannel::succeeding().script(1, &[false, false])).await;
    let notification_id = p.trigger(vec![1]).await;

    let processed = p.drain().await;
    let dispositions: Vec<_> = processed.iter().map(|job| job.disposition).collect();
    assert!(matches!(
        dispositions.as_slice(),
        [
            JobDisposition::Retried(FailureDisposition::Rescheduled { attempt: 2, .. }),
            JobDisposition::Retried(FailureDisposition::Rescheduled { attempt: 3, .. }),
            JobDisposition::Completed(JobOutcome::Sent { .. }),
        ]
    ));

    let delivery = p
        .ledger
        .find_delivery(notification_id, 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Sent);
    assert_eq!(delivery.retry_count, 2);
    assert_eq!(p.ledger.messages_for(1).await.len(), 1);
    assert_eq!(p.channel.calls(), 3);

    assert_eq!(
        p.ledger.history(delivery.id).await,
        vec![
            DeliveryStatus::Queued,
            DeliveryStatus::Processing,
            DeliveryStatus::Retrying,
            DeliveryStatus::Processing,
            DeliveryStatus::Retrying,
            DeliveryStatus::Processing,
            DeliveryStatus::Sent,
        ]
    );
}

#[tokio::test]
async fn test_three_failures_end_failed() {
    let p = pipeline(ScriptedChannel::failing()).await;
    let notification_id = p.trigger(vec![1]).await;

    let processed = p.drain().await;
    assert_eq!(processed.len(), 3);
    assert!(matches!(
        processed[2].disposition,
        JobDisposition::Completed(JobOutcome::Failed { .. })
    ));

    let delivery = p
        .ledger
        .find_delivery(notification_id, 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.retry_count, 2);
    assert!(p.ledger.messages_for(1).await.is_empty());

    let counts = p.queue.counts().await.unwrap();
    assert_eq!((counts.waiting, counts.active, counts.delayed), (0, 0, 0));
}

#[tokio::test]
async fn test_redelivery_after_sent_is_discarded() {
    let p = pipeline(ScriptedChannel::succeeding()).await;
    let notification_id = p.trigger(vec![1]).await;
    p.drain().await;

    let duplicate = DeliveryJob {
        notification_id,
        user_id: 1,
    };
    p.queue
        .enqueue(duplicate, RetryPolicy::default().job_options())
        .await
        .unwrap();

    let processed = p.drain().await;
    assert_eq!(processed.len(), 1);
    assert_eq!(
        processed[0].disposition,
        JobDisposition::Completed(JobOutcome::Discarded(DiscardReason::AlreadyTerminal(
            DeliveryStatus::Sent
        )))
    );
    assert_eq!(p.ledger.messages_for(1).await.len(), 1);
    assert_eq!(p.channel.calls(), 1);
}

#[tokio::test]
async fn test_concurrent_duplicate_jobs_send_once() {
    let p = pipeline(ScriptedChannel::succeeding()).await;
    let notification_id = p.trigger(vec![1]).await;
    let job = DeliveryJob {
        notification_id,
        user_id: 1,
    };

    let mut handles = Vec::new();
    for _ in 0..8 {
        let worker = p.worker.clone();
        handles.push(tokio::spawn(async move { worker.process(job).await }));
    }

    let mut sent = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            JobOutcome::Sent { .. } => sent += 1,
            JobOutcome::Discarded(_) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(sent, 1);
    assert_eq!(p.channel.calls(), 1);
    assert_eq!(p.ledger.messages_for(1).await.len(), 1);
}

#[tokio::test]
async fn test_mixed_outcomes_keep_ledger_invariants() {
    let channel = ScriptedChannel::succeeding()
        .script(1, &[false])
        .script(2, &[false, false, false])
        .script(3, &[false, false])
        .script(5, &[false, true]);
    let p = pipeline(channel).await;
    p.trigger(vec![1, 2, 3, 4, 5]).await;
    p.trigger(vec![2, 4]).await;
    p.drain().await;

    let policy = RetryPolicy::default();
    for delivery in p.ledger.deliveries().await {
        let history = p.ledger.history(delivery.id).await;
        assert!(is_valid_walk(&history), "invalid walk {history:?}");
        assert!(delivery.status.is_terminal());
        assert!(delivery.retry_count <= policy.max_retry_count());
        if delivery.status == DeliveryStatus::Failed {
            assert_eq!(delivery.retry_count, policy.max_retry_count());
        }
    }

    // Each SENT delivery stored exactly one message.
    for user_id in 1..=5 {
        let sent = p
            .ledger
            .deliveries()
            .await
            .into_iter()
            .filter(|d| d.user_id == user_id && d.status == DeliveryStatus::Sent)
            .count();
        assert_eq!(p.ledger.messages_for(user_id).await.len(), sent);
    }
    assert_eq!(p.ledger.messages_for(3).await[0].message, "Hi User");
}

#[tokio::test]
async fn test_crashed_claim_recovered_by_sweep() {
    let p = pipeline(ScriptedChannel::succeeding()).await;
    let notification_id = p.trigger(vec![1]).await;

    // A worker leases the job, claims the row and dies.
    let abandoned = p.queue.fetch().await.unwrap().unwrap();
    let delivery = p
        .ledger
        .find_delivery(abandoned.data.notification_id, abandoned.data.user_id)
        .await
        .unwrap()
        .unwrap();
    p.ledger.apply(&delivery, DeliveryEvent::Claim).await.unwrap();

    // Lease expires; the redelivered job sees the claim and backs off.
    p.queue.expire_leases().await;
    assert_eq!(p.queue.reclaim_stalled().await.unwrap(), 1);
    let processed = p.drain().await;
    assert_eq!(
        processed[0].disposition,
        JobDisposition::Completed(JobOutcome::Discarded(DiscardReason::InFlight))
    );
    assert_eq!(p.channel.calls(), 0);

    // The sweep counts the lost attempt and requeues.
    p.ledger
        .backdate(delivery.id, chrono::Duration::seconds(600))
        .await;
    let sweep = StuckDeliverySweep::new(
        p.ledger.clone(),
        p.queue.clone(),
        RetryPolicy::default(),
        SweepConfig::default(),
    );
    assert_eq!(sweep.run_once().await.unwrap().requeued, 1);

    p.drain().await;
    let delivery = p
        .ledger
        .find_delivery(notification_id, 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Sent);
    assert_eq!(delivery.retry_count, 1);
    assert_eq!(p.ledger.messages_for(1).await.len(), 1);
    assert!(is_valid_walk(&p.ledger.history(delivery.id).await));
}

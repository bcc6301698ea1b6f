//! Delivery worker: processes one delivery job against the ledger.
//!
//! Per job:
//! 1. Look up the delivery row; absent, terminal or already claimed rows are
//!    discarded without side effects.
//! 2. Claim it (`PROCESSING`) before touching the channel.
//! 3. Send through the channel.
//! 4. On success render the template for the recipient and write `SENT`
//!    together with the rendered message.
//! 5. On failure either record `RETRYING` and return a retryable error so the
//!    queue redelivers, or record `FAILED` once the retry budget is spent.
//!
//! Every write is a compare-and-set, so a duplicate job racing this one either
//! loses the claim or loses the final write. Neither path sends twice from the
//! same state or stores a second message.

use std::sync::Arc;

use thiserror::Error;

use herald_common::error::AppError;
use herald_common::retry::{FailureDecision, RetryPolicy};
use herald_common::types::{Delivery, DeliveryJob, DeliveryStatus};
use herald_engine::ledger::{DeliveryLedger, LedgerError, TransitionOutcome};
use herald_engine::renderer::{TemplateVars, render};
use herald_engine::state_machine::{DeliveryEvent, TransitionError};

use crate::channel::DeliveryChannel;

/// Display name used when the recipient has none.
pub const FALLBACK_RECIPIENT_NAME: &str = "User";

/// Why a job was acknowledged without doing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// No delivery row for the job's (notification, user) pair.
    MissingDelivery,
    /// The delivery already reached `SENT` or `FAILED`.
    AlreadyTerminal(DeliveryStatus),
    /// Another worker holds the claim.
    InFlight,
    /// The row changed between our read and our write.
    Superseded,
}

/// Result of a job that needs no redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Sent { delivery_id: i64 },
    Failed { delivery_id: i64 },
    Discarded(DiscardReason),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The channel refused or could not be reached; `RETRYING` was recorded.
    #[error("delivery {delivery_id} failed (retry {retry_count}): {reason}")]
    Transient {
        delivery_id: i64,
        retry_count: i32,
        reason: String,
    },

    /// No template body resolves for the notification; `RETRYING` was
    /// recorded.
    #[error("template missing for notification {notification_id} (retry {retry_count})")]
    TemplateMissing {
        notification_id: i64,
        retry_count: i32,
    },

    #[error("infrastructure failure: {0}")]
    Infrastructure(#[from] AppError),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

impl DeliveryError {
    /// Whether the queue should redeliver the job.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryError::InvalidTransition(_))
    }
}

impl From<LedgerError> for DeliveryError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidTransition(e) => DeliveryError::InvalidTransition(e),
            LedgerError::Storage(e) => DeliveryError::Infrastructure(e),
        }
    }
}

/// What went wrong with an attempt after the claim.
enum AttemptFailure {
    Channel(String),
    TemplateMissing,
}

pub struct DeliveryWorker {
    ledger: Arc<dyn DeliveryLedger>,
    channel: Arc<dyn DeliveryChannel>,
    policy: RetryPolicy,
}

impl DeliveryWorker {
    pub fn new(
        ledger: Arc<dyn DeliveryLedger>,
        channel: Arc<dyn DeliveryChannel>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            channel,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn process(&self, job: DeliveryJob) -> Result<JobOutcome, DeliveryError> {
        let Some(delivery) = self
            .ledger
            .find_delivery(job.notification_id, job.user_id)
            .await?
        else {
            tracing::warn!(
                notification_id = job.notification_id,
                user_id = job.user_id,
                "No delivery row for job, discarding"
            );
            return Ok(JobOutcome::Discarded(DiscardReason::MissingDelivery));
        };

        if delivery.status.is_terminal() {
            tracing::debug!(
                delivery_id = delivery.id,
                status = %delivery.status,
                "Delivery already finished, discarding job"
            );
            return Ok(JobOutcome::Discarded(DiscardReason::AlreadyTerminal(
                delivery.status,
            )));
        }

        if delivery.status == DeliveryStatus::Processing {
            tracing::debug!(
                delivery_id = delivery.id,
                "Delivery claimed by another worker, discarding job"
            );
            return Ok(JobOutcome::Discarded(DiscardReason::InFlight));
        }

        let claimed = match self.ledger.apply(&delivery, DeliveryEvent::Claim).await? {
            TransitionOutcome::Applied(claimed) => claimed,
            TransitionOutcome::Conflict => {
                return Ok(JobOutcome::Discarded(DiscardReason::Superseded));
            }
        };

        if let Err(e) = self.channel.send(&claimed).await {
            tracing::info!(
                delivery_id = claimed.id,
                channel = self.channel.name(),
                error = %e,
                "Delivery attempt failed"
            );
            return self
                .record_failure(&claimed, AttemptFailure::Channel(e.to_string()))
                .await;
        }

        let Some(body) = self.ledger.template_body(claimed.notification_id).await? else {
            tracing::warn!(
                delivery_id = claimed.id,
                notification_id = claimed.notification_id,
                "Template no longer resolves for notification"
            );
            return self
                .record_failure(&claimed, AttemptFailure::TemplateMissing)
                .await;
        };

        let name = self
            .ledger
            .recipient_name(claimed.user_id)
            .await?
            .unwrap_or_else(|| FALLBACK_RECIPIENT_NAME.to_string());
        let message = render(&body, &TemplateVars::new().with("name", name));

        match self
            .ledger
            .apply(&claimed, DeliveryEvent::Succeed { message })
            .await?
        {
            TransitionOutcome::Applied(sent) => {
                tracing::info!(
                    delivery_id = sent.id,
                    notification_id = sent.notification_id,
                    user_id = sent.user_id,
                    retry_count = sent.retry_count,
                    "Notification delivered"
                );
                Ok(JobOutcome::Sent {
                    delivery_id: sent.id,
                })
            }
            TransitionOutcome::Conflict => Ok(JobOutcome::Discarded(DiscardReason::Superseded)),
        }
    }

    async fn record_failure(
        &self,
        claimed: &Delivery,
        failure: AttemptFailure,
    ) -> Result<JobOutcome, DeliveryError> {
        match self.policy.on_failure(claimed.retry_count) {
            FailureDecision::Exhausted => {
                match self.ledger.apply(claimed, DeliveryEvent::Exhaust).await? {
                    TransitionOutcome::Applied(failed) => {
                        tracing::warn!(
                            delivery_id = failed.id,
                            notification_id = failed.notification_id,
                            user_id = failed.user_id,
                            retry_count = failed.retry_count,
                            "Delivery permanently failed"
                        );
                        Ok(JobOutcome::Failed {
                            delivery_id: failed.id,
                        })
                    }
                    TransitionOutcome::Conflict => {
                        Ok(JobOutcome::Discarded(DiscardReason::Superseded))
                    }
                }
            }
            FailureDecision::Retry => {
                let retrying = match self.ledger.apply(claimed, DeliveryEvent::Retry).await? {
                    TransitionOutcome::Applied(retrying) => retrying,
                    TransitionOutcome::Conflict => {
                        return Ok(JobOutcome::Discarded(DiscardReason::Superseded));
                    }
                };
                tracing::info!(
                    delivery_id = retrying.id,
                    retry_count = retrying.retry_count,
                    "Delivery will be retried"
                );

                Err(match failure {
                    AttemptFailure::Channel(reason) => DeliveryError::Transient {
                        delivery_id: retrying.id,
                        retry_count: retrying.retry_count,
                        reason,
                    },
                    AttemptFailure::TemplateMissing => DeliveryError::TemplateMissing {
                        notification_id: retrying.notification_id,
                        retry_count: retrying.retry_count,
                    },
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_engine::ledger::InMemoryDeliveryLedger;

    use crate::channel::ScriptedChannel;

    async fn setup(channel: ScriptedChannel) -> (Arc<InMemoryDeliveryLedger>, DeliveryWorker, DeliveryJob) {
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let template = ledger.add_template("Welcome", "Hi {{ Name }}").await;
        ledger.add_user(1, Some("Sam")).await;
        let notification = ledger.create_notification(template.id).await.unwrap();
        ledger.insert_delivery(notification.id, 1).await.unwrap();

        let worker = DeliveryWorker::new(ledger.clone(), Arc::new(channel), RetryPolicy::default());
        let job = DeliveryJob {
            notification_id: notification.id,
            user_id: 1,
        };
        (ledger, worker, job)
    }

    #[tokio::test]
    async fn test_success_renders_and_stores_message() {
        let (ledger, worker, job) = setup(ScriptedChannel::succeeding()).await;

        let outcome = worker.process(job).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Sent { .. }));

        let messages = ledger.messages_for(1).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message, "Hi Sam");
        assert!(!messages[0].is_read);
    }

    #[tokio::test]
    async fn test_failure_records_retrying_and_is_retryable() {
        let (ledger, worker, job) = setup(ScriptedChannel::failing()).await;

        let err = worker.process(job).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, DeliveryError::Transient { retry_count: 1, .. }));

        let delivery = ledger.deliveries().await.remove(0);
        assert_eq!(delivery.status, DeliveryStatus::Retrying);
        assert_eq!(delivery.retry_count, 1);
        assert!(ledger.messages_for(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_delivery_discarded() {
        let (_, worker, job) = setup(ScriptedChannel::succeeding()).await;
        let stray = DeliveryJob {
            user_id: 99,
            ..job
        };
        assert_eq!(
            worker.process(stray).await.unwrap(),
            JobOutcome::Discarded(DiscardReason::MissingDelivery)
        );
    }

    #[tokio::test]
    async fn test_processing_row_is_left_alone() {
        let channel = ScriptedChannel::succeeding();
        let (ledger, worker, job) = setup(channel).await;
        let delivery = ledger.deliveries().await.remove(0);
        ledger.apply(&delivery, DeliveryEvent::Claim).await.unwrap();

        assert_eq!(
            worker.process(job).await.unwrap(),
            JobOutcome::Discarded(DiscardReason::InFlight)
        );
        assert_eq!(
            ledger.history(delivery.id).await,
            vec![DeliveryStatus::Queued, DeliveryStatus::Processing]
        );
    }

    #[tokio::test]
    async fn test_missing_template_counts_as_failure() {
        let (ledger, worker, job) = setup(ScriptedChannel::succeeding()).await;
        let template_id = ledger.notifications().await[0].template_id;
        ledger.remove_template(template_id).await;

        let err = worker.process(job).await.unwrap_err();
        assert!(matches!(err, DeliveryError::TemplateMissing { retry_count: 1, .. }));
        assert_eq!(
            ledger.deliveries().await[0].status,
            DeliveryStatus::Retrying
        );
    }

    #[tokio::test]
    async fn test_unnamed_recipient_uses_fallback() {
        let (ledger, worker, job) = setup(ScriptedChannel::succeeding()).await;
        ledger.add_user(1, None).await;

        worker.process(job).await.unwrap();
        assert_eq!(ledger.messages_for(1).await[0].message, "Hi User");
    }

    #[test]
    fn test_only_invalid_transition_is_fatal() {
        let err = DeliveryError::InvalidTransition(TransitionError {
            from: DeliveryStatus::Sent,
            event: "claim",
        });
        assert!(!err.is_retryable());
        assert!(DeliveryError::Infrastructure(AppError::Queue("down".into())).is_retryable());
    }
}

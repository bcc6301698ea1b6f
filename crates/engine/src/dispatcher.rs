//! Dispatcher: turns a trigger request into one notification, one `QUEUED`
//! delivery row per recipient and one queue job per new delivery.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use herald_common::error::AppError;
use herald_common::retry::RetryPolicy;
use herald_common::types::DeliveryJob;

use crate::ledger::DeliveryLedger;
use crate::queue::{JobQueue, QueueError};

/// Body of a trigger request. Both fields are required; they are optional
/// here so a missing field is reported as a validation error, not a parse
/// error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    #[serde(default)]
    pub template_id: Option<i64>,
    #[serde(default)]
    pub user_ids: Option<Vec<i64>>,
}

/// What a successful dispatch created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    pub notification_id: i64,
    pub deliveries_created: usize,
    pub jobs_enqueued: usize,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid payload")]
    InvalidRequest,

    #[error("Template {0} not found")]
    TemplateNotFound(i64),

    #[error("Unknown user ids: {0:?}")]
    UnknownUsers(Vec<i64>),

    #[error(transparent)]
    Storage(#[from] AppError),

    #[error("Failed to enqueue delivery job: {0}")]
    Queue(#[from] QueueError),
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::InvalidRequest
            | DispatchError::TemplateNotFound(_)
            | DispatchError::UnknownUsers(_) => AppError::Validation(err.to_string()),
            DispatchError::Storage(inner) => inner,
            DispatchError::Queue(inner) => inner.into(),
        }
    }
}

pub struct Dispatcher {
    ledger: Arc<dyn DeliveryLedger>,
    queue: Arc<dyn JobQueue>,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(ledger: Arc<dyn DeliveryLedger>, queue: Arc<dyn JobQueue>, policy: RetryPolicy) -> Self {
        Self {
            ledger,
            queue,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Accept a trigger request.
    ///
    /// Nothing is persisted unless the request is valid, the template exists
    /// and every recipient is a known user. Repeated ids in `user_ids` yield
    /// one delivery. A recipient whose delivery row already exists gets no
    /// second job.
    pub async fn dispatch(&self, request: TriggerRequest) -> Result<DispatchReceipt, DispatchError> {
        let (template_id, user_ids) = match (request.template_id, request.user_ids) {
            (Some(template_id), Some(user_ids)) if !user_ids.is_empty() => (template_id, user_ids),
            _ => return Err(DispatchError::InvalidRequest),
        };

        let recipients = distinct_in_order(user_ids);

        if self.ledger.find_template(template_id).await?.is_none() {
            return Err(DispatchError::TemplateNotFound(template_id));
        }

        let missing = self.ledger.missing_users(&recipients).await?;
        if !missing.is_empty() {
            return Err(DispatchError::UnknownUsers(missing));
        }

        let notification = self.ledger.create_notification(template_id).await?;
        let options = self.policy.job_options();

        let mut deliveries_created = 0;
        let mut jobs_enqueued = 0;
        for user_id in recipients {
            let Some(delivery) = self.ledger.insert_delivery(notification.id, user_id).await? else {
                tracing::debug!(
                    notification_id = notification.id,
                    user_id,
                    "Delivery already recorded, not enqueuing again"
                );
                continue;
            };
            deliveries_created += 1;

            let job = DeliveryJob {
                notification_id: notification.id,
                user_id: delivery.user_id,
            };
            self.queue.enqueue(job, options).await?;
            jobs_enqueued += 1;
        }

        tracing::info!(
            notification_id = notification.id,
            template_id,
            deliveries_created,
            jobs_enqueued,
            "Notification dispatched"
        );

        Ok(DispatchReceipt {
            notification_id: notification.id,
            deliveries_created,
            jobs_enqueued,
        })
    }
}

/// Drop repeated ids, keeping the first occurrence of each.
fn distinct_in_order(ids: Vec<i64>) -> Vec<i64> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

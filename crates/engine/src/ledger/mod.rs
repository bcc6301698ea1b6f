//! Delivery ledger — the authoritative record of delivery progress.
//!
//! Every status change goes through [`DeliveryLedger::apply`], which validates
//! the event against the state machine and then performs a compare-and-set
//! write keyed on the row's `version`. A write against a stale version is
//! reported as [`TransitionOutcome::Conflict`] and changes nothing, so two
//! workers racing on the same delivery can never both move it forward.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use herald_common::error::AppError;
use herald_common::types::{Delivery, DeliveryStatus, Notification, Template};

use crate::state_machine::{DeliveryEvent, TransitionError, transition};

pub use memory::InMemoryDeliveryLedger;
pub use postgres::PgDeliveryLedger;

/// A conditional status write. Applied only if the row still carries
/// `expected_version`.
#[derive(Debug, Clone)]
pub struct StatusWrite<'a> {
    pub delivery_id: i64,
    pub user_id: i64,
    pub expected_version: i32,
    pub status: DeliveryStatus,
    pub retry_count: i32,
    /// Rendered message to store in the same atomic write (only on `SENT`).
    pub message: Option<&'a str>,
}

/// Result of applying an event to a delivery.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The write went through; carries the updated row.
    Applied(Delivery),
    /// The row changed since it was read; nothing was written.
    Conflict,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error(transparent)]
    Storage(#[from] AppError),
}

/// Storage for templates, notifications, deliveries and rendered messages as
/// seen by the dispatch and delivery pipeline.
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    async fn find_template(&self, template_id: i64) -> Result<Option<Template>, AppError>;

    /// Return the subset of `user_ids` that do not exist.
    async fn missing_users(&self, user_ids: &[i64]) -> Result<Vec<i64>, AppError>;

    async fn create_notification(&self, template_id: i64) -> Result<Notification, AppError>;

    /// Insert a `QUEUED` delivery. Returns `None` if a row for the pair
    /// already exists.
    async fn insert_delivery(
        &self,
        notification_id: i64,
        user_id: i64,
    ) -> Result<Option<Delivery>, AppError>;

    async fn find_delivery(
        &self,
        notification_id: i64,
        user_id: i64,
    ) -> Result<Option<Delivery>, AppError>;

    /// Template body for the notification's template, if both still resolve.
    async fn template_body(&self, notification_id: i64) -> Result<Option<String>, AppError>;

    /// Display name of a recipient, if the user exists and has one.
    async fn recipient_name(&self, user_id: i64) -> Result<Option<String>, AppError>;

    /// Deliveries in `status` not written since before `updated_before`,
    /// oldest first.
    async fn stale_deliveries(
        &self,
        status: DeliveryStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Delivery>, AppError>;

    /// Atomic compare-and-set on `version`. Returns the updated row, or
    /// `None` if the version no longer matches.
    async fn write_status(&self, write: StatusWrite<'_>) -> Result<Option<Delivery>, AppError>;

    /// Bump `version` and `updated_at` without changing status or retry
    /// count. Used to mark a row as handled so the next sweep skips it.
    async fn touch(&self, delivery: &Delivery) -> Result<TransitionOutcome, AppError> {
        let written = self
            .write_status(StatusWrite {
                delivery_id: delivery.id,
                user_id: delivery.user_id,
                expected_version: delivery.version,
                status: delivery.status,
                retry_count: delivery.retry_count,
                message: None,
            })
            .await?;

        Ok(match written {
            Some(updated) => TransitionOutcome::Applied(updated),
            None => TransitionOutcome::Conflict,
        })
    }

    /// Validate `event` against the state machine and persist the result.
    async fn apply(
        &self,
        delivery: &Delivery,
        event: DeliveryEvent,
    ) -> Result<TransitionOutcome, LedgerError> {
        let next = transition(delivery.status, &event)?;
        let retry_count = match event {
            DeliveryEvent::Retry => delivery.retry_count + 1,
            _ => delivery.retry_count,
        };
        let message = match &event {
            DeliveryEvent::Succeed { message } => Some(message.as_str()),
            _ => None,
        };

        let written = self
            .write_status(StatusWrite {
                delivery_id: delivery.id,
                user_id: delivery.user_id,
                expected_version: delivery.version,
                status: next,
                retry_count,
                message,
            })
            .await?;

        match written {
            Some(updated) => {
                tracing::debug!(
                    delivery_id = delivery.id,
                    from = %delivery.status,
                    to = %updated.status,
                    retry_count = updated.retry_count,
                    "Delivery transitioned"
                );
                Ok(TransitionOutcome::Applied(updated))
            }
            None => {
                tracing::debug!(
                    delivery_id = delivery.id,
                    expected_version = delivery.version,
                    event = event.name(),
                    "Delivery changed concurrently, transition skipped"
                );
                Ok(TransitionOutcome::Conflict)
            }
        }
    }
}

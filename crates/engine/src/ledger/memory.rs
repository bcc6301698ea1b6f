//! In-memory delivery ledger.
//!
//! Same semantics as the Postgres ledger (unique pairs, version
//! compare-and-set, message insert bound to the `SENT` write) without a
//! database. Also records every status each delivery passed through so tests
//! can check the walk.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use herald_common::error::AppError;
use herald_common::types::{
    Delivery, DeliveryStatus, Notification, RenderedMessage, Template, User,
};

use super::{DeliveryLedger, StatusWrite};

#[derive(Default)]
struct LedgerState {
    templates: Vec<Template>,
    users: Vec<User>,
    notifications: Vec<Notification>,
    deliveries: Vec<Delivery>,
    messages: Vec<RenderedMessage>,
    history: HashMap<i64, Vec<DeliveryStatus>>,
    next_id: i64,
}

impl LedgerState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct InMemoryDeliveryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryDeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_template(&self, title: &str, body: &str) -> Template {
        let mut state = self.state.lock().await;
        let template = Template {
            id: state.next_id(),
            title: title.to_string(),
            body: body.to_string(),
        };
        state.templates.push(template.clone());
        template
    }

    /// Add a user with an explicit id, mirroring a pre-existing user table.
    pub async fn add_user(&self, id: i64, name: Option<&str>) -> User {
        let mut state = self.state.lock().await;
        let user = User {
            id,
            name: name.map(str::to_string),
            role: Some("user".to_string()),
        };
        state.users.retain(|u| u.id != id);
        state.users.push(user.clone());
        user
    }

    pub async fn remove_template(&self, template_id: i64) {
        self.state
            .lock()
            .await
            .templates
            .retain(|t| t.id != template_id);
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.state.lock().await.notifications.clone()
    }

    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().await.deliveries.clone()
    }

    pub async fn delivery(&self, delivery_id: i64) -> Option<Delivery> {
        self.state
            .lock()
            .await
            .deliveries
            .iter()
            .find(|d| d.id == delivery_id)
            .cloned()
    }

    pub async fn messages_for(&self, user_id: i64) -> Vec<RenderedMessage> {
        self.state
            .lock()
            .await
            .messages
            .iter()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Every status the delivery has held, oldest first.
    pub async fn history(&self, delivery_id: i64) -> Vec<DeliveryStatus> {
        self.state
            .lock()
            .await
            .history
            .get(&delivery_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Pretend the delivery was last written `age` ago.
    pub async fn backdate(&self, delivery_id: i64, age: Duration) {
        let mut state = self.state.lock().await;
        if let Some(delivery) = state.deliveries.iter_mut().find(|d| d.id == delivery_id) {
            delivery.updated_at = Utc::now() - age;
        }
    }
}

#[async_trait]
impl DeliveryLedger for InMemoryDeliveryLedger {
    async fn find_template(&self, template_id: i64) -> Result<Option<Template>, AppError> {
        let state = self.state.lock().await;
        Ok(state.templates.iter().find(|t| t.id == template_id).cloned())
    }

    async fn missing_users(&self, user_ids: &[i64]) -> Result<Vec<i64>, AppError> {
        let state = self.state.lock().await;
        Ok(user_ids
            .iter()
            .copied()
            .filter(|id| !state.users.iter().any(|u| u.id == *id))
            .collect())
    }

    async fn create_notification(&self, template_id: i64) -> Result<Notification, AppError> {
        let mut state = self.state.lock().await;
        let notification = Notification {
            id: state.next_id(),
            template_id,
            created_at: Utc::now(),
        };
        state.notifications.push(notification.clone());
        Ok(notification)
    }

    async fn insert_delivery(
        &self,
        notification_id: i64,
        user_id: i64,
    ) -> Result<Option<Delivery>, AppError> {
        let mut state = self.state.lock().await;
        let exists = state
            .deliveries
            .iter()
            .any(|d| d.notification_id == notification_id && d.user_id == user_id);
        if exists {
            return Ok(None);
        }

        let now = Utc::now();
        let delivery = Delivery {
            id: state.next_id(),
            notification_id,
            user_id,
            status: DeliveryStatus::Queued,
            retry_count: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        state.deliveries.push(delivery.clone());
        state
            .history
            .insert(delivery.id, vec![DeliveryStatus::Queued]);
        Ok(Some(delivery))
    }

    async fn find_delivery(
        &self,
        notification_id: i64,
        user_id: i64,
    ) -> Result<Option<Delivery>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .deliveries
            .iter()
            .find(|d| d.notification_id == notification_id && d.user_id == user_id)
            .cloned())
    }

    async fn template_body(&self, notification_id: i64) -> Result<Option<String>, AppError> {
        let state = self.state.lock().await;
        let body = state
            .notifications
            .iter()
            .find(|n| n.id == notification_id)
            .and_then(|n| state.templates.iter().find(|t| t.id == n.template_id))
            .map(|t| t.body.clone());
        Ok(body)
    }

    async fn recipient_name(&self, user_id: i64) -> Result<Option<String>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .iter()
            .find(|u| u.id == user_id)
            .and_then(|u| u.name.clone()))
    }

    async fn stale_deliveries(
        &self,
        status: DeliveryStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Delivery>, AppError> {
        let state = self.state.lock().await;
        let mut stale: Vec<Delivery> = state
            .deliveries
            .iter()
            .filter(|d| d.status == status && d.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by_key(|d| d.updated_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn write_status(&self, write: StatusWrite<'_>) -> Result<Option<Delivery>, AppError> {
        let mut state = self.state.lock().await;

        let Some(index) = state
            .deliveries
            .iter()
            .position(|d| d.id == write.delivery_id && d.version == write.expected_version)
        else {
            return Ok(None);
        };

        let updated = {
            let delivery = &mut state.deliveries[index];
            delivery.status = write.status;
            delivery.retry_count = write.retry_count;
            delivery.version += 1;
            delivery.updated_at = Utc::now();
            delivery.clone()
        };

        let history = state.history.entry(updated.id).or_default();
        if history.last() != Some(&updated.status) {
            history.push(updated.status);
        }

        if let Some(message) = write.message {
            let already_stored = state
                .messages
                .iter()
                .any(|m| m.delivery_id == Some(write.delivery_id));
            if !already_stored {
                let id = state.next_id();
                state.messages.push(RenderedMessage {
                    id,
                    user_id: write.user_id,
                    delivery_id: Some(write.delivery_id),
                    message: message.to_string(),
                    is_read: false,
                    created_at: Utc::now(),
                });
            }
        }

        Ok(Some(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TransitionOutcome;
    use crate::state_machine::DeliveryEvent;

    async fn queued_delivery(ledger: &InMemoryDeliveryLedger) -> Delivery {
        let template = ledger.add_template("Welcome", "Hi {{name}}").await;
        ledger.add_user(1, Some("Sam")).await;
        let notification = ledger.create_notification(template.id).await.unwrap();
        ledger
            .insert_delivery(notification.id, 1)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_pair_insert_is_noop() {
        let ledger = InMemoryDeliveryLedger::new();
        let delivery = queued_delivery(&ledger).await;

        let again = ledger
            .insert_delivery(delivery.notification_id, delivery.user_id)
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(ledger.deliveries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_version_write_conflicts() {
        let ledger = InMemoryDeliveryLedger::new();
        let delivery = queued_delivery(&ledger).await;

        let first = ledger.apply(&delivery, DeliveryEvent::Claim).await.unwrap();
        assert!(matches!(first, TransitionOutcome::Applied(_)));

        // Second worker still holds the version-0 snapshot.
        let second = ledger.apply(&delivery, DeliveryEvent::Claim).await.unwrap();
        assert!(matches!(second, TransitionOutcome::Conflict));

        assert_eq!(
            ledger.history(delivery.id).await,
            vec![DeliveryStatus::Queued, DeliveryStatus::Processing]
        );
    }

    #[tokio::test]
    async fn test_invalid_event_rejected_before_write() {
        let ledger = InMemoryDeliveryLedger::new();
        let delivery = queued_delivery(&ledger).await;

        let result = ledger.apply(&delivery, DeliveryEvent::Retry).await;
        assert!(result.is_err());
        assert_eq!(
            ledger.delivery(delivery.id).await.unwrap().status,
            DeliveryStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_sent_write_stores_message_once() {
        let ledger = InMemoryDeliveryLedger::new();
        let delivery = queued_delivery(&ledger).await;

        let TransitionOutcome::Applied(processing) =
            ledger.apply(&delivery, DeliveryEvent::Claim).await.unwrap()
        else {
            panic!("claim should apply");
        };
        let sent = ledger
            .apply(
                &processing,
                DeliveryEvent::Succeed {
                    message: "Hi Sam".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(sent, TransitionOutcome::Applied(_)));

        let replay = ledger
            .apply(
                &processing,
                DeliveryEvent::Succeed {
                    message: "Hi Sam".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(replay, TransitionOutcome::Conflict));

        let messages = ledger.messages_for(1).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message, "Hi Sam");
    }

    #[tokio::test]
    async fn test_stale_processing_honours_age_and_status() {
        let ledger = InMemoryDeliveryLedger::new();
        let delivery = queued_delivery(&ledger).await;
        let TransitionOutcome::Applied(processing) =
            ledger.apply(&delivery, DeliveryEvent::Claim).await.unwrap()
        else {
            panic!("claim should apply");
        };

        let cutoff = Utc::now() - Duration::seconds(60);
        let stale_processing = || ledger.stale_deliveries(DeliveryStatus::Processing, cutoff, 10);
        assert!(stale_processing().await.unwrap().is_empty());

        ledger.backdate(processing.id, Duration::seconds(300)).await;
        assert!(
            ledger
                .stale_deliveries(DeliveryStatus::Queued, cutoff, 10)
                .await
                .unwrap()
                .is_empty()
        );
        let stale = stale_processing().await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, processing.id);
    }

    #[tokio::test]
    async fn test_missing_users_reports_unknown_ids() {
        let ledger = InMemoryDeliveryLedger::new();
        ledger.add_user(1, Some("Sam")).await;
        let missing = ledger.missing_users(&[1, 2, 3]).await.unwrap();
        assert_eq!(missing, vec![2, 3]);
    }
}

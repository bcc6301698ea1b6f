//! PostgreSQL-backed delivery ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use herald_common::error::AppError;
use herald_common::types::{Delivery, DeliveryStatus, Notification, Template};

use super::{DeliveryLedger, StatusWrite};

#[derive(Clone)]
pub struct PgDeliveryLedger {
    pool: PgPool,
}

impl PgDeliveryLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryLedger for PgDeliveryLedger {
    async fn find_template(&self, template_id: i64) -> Result<Option<Template>, AppError> {
        let template: Option<Template> =
            sqlx::query_as("SELECT id, title, body FROM notification_templates WHERE id = $1")
                .bind(template_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(template)
    }

    async fn missing_users(&self, user_ids: &[i64]) -> Result<Vec<i64>, AppError> {
        let missing: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT requested.id
            FROM UNNEST($1::BIGINT[]) AS requested(id)
            WHERE NOT EXISTS (SELECT 1 FROM users u WHERE u.id = requested.id)
            "#,
        )
        .bind(user_ids.to_vec())
        .fetch_all(&self.pool)
        .await?;

        Ok(missing)
    }

    async fn create_notification(&self, template_id: i64) -> Result<Notification, AppError> {
        let notification: Notification = sqlx::query_as(
            r#"
            INSERT INTO notifications (template_id)
            VALUES ($1)
            RETURNING id, template_id, created_at
            "#,
        )
        .bind(template_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(notification)
    }

    async fn insert_delivery(
        &self,
        notification_id: i64,
        user_id: i64,
    ) -> Result<Option<Delivery>, AppError> {
        let delivery: Option<Delivery> = sqlx::query_as(
            r#"
            INSERT INTO notification_deliveries (notification_id, user_id, status, retry_count)
            VALUES ($1, $2, 'QUEUED', 0)
            ON CONFLICT (notification_id, user_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(notification_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(delivery)
    }

    async fn find_delivery(
        &self,
        notification_id: i64,
        user_id: i64,
    ) -> Result<Option<Delivery>, AppError> {
        let delivery: Option<Delivery> = sqlx::query_as(
            "SELECT * FROM notification_deliveries WHERE notification_id = $1 AND user_id = $2",
        )
        .bind(notification_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(delivery)
    }

    async fn template_body(&self, notification_id: i64) -> Result<Option<String>, AppError> {
        let body: Option<String> = sqlx::query_scalar(
            r#"
            SELECT t.body
            FROM notifications n
            JOIN notification_templates t ON n.template_id = t.id
            WHERE n.id = $1
            "#,
        )
        .bind(notification_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(body)
    }

    async fn recipient_name(&self, user_id: i64) -> Result<Option<String>, AppError> {
        let name: Option<Option<String>> =
            sqlx::query_scalar("SELECT name FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(name.flatten())
    }

    async fn stale_deliveries(
        &self,
        status: DeliveryStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Delivery>, AppError> {
        let deliveries: Vec<Delivery> = sqlx::query_as(
            r#"
            SELECT *
            FROM notification_deliveries
            WHERE status = $1 AND updated_at < $2
            ORDER BY updated_at
            LIMIT $3
            "#,
        )
        .bind(status.as_str())
        .bind(updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(deliveries)
    }

    async fn write_status(&self, write: StatusWrite<'_>) -> Result<Option<Delivery>, AppError> {
        let mut tx = self.pool.begin().await?;

        let updated: Option<Delivery> = sqlx::query_as(
            r#"
            UPDATE notification_deliveries
            SET status = $1, retry_count = $2, version = version + 1, updated_at = NOW()
            WHERE id = $3 AND version = $4
            RETURNING *
            "#,
        )
        .bind(write.status.as_str())
        .bind(write.retry_count)
        .bind(write.delivery_id)
        .bind(write.expected_version)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(updated) = updated else {
            tx.rollback().await?;
            return Ok(None);
        };

        if let Some(message) = write.message {
            sqlx::query(
                r#"
                INSERT INTO user_notifications (user_id, delivery_id, message)
                VALUES ($1, $2, $3)
                ON CONFLICT (delivery_id) DO NOTHING
                "#,
            )
            .bind(write.user_id)
            .bind(write.delivery_id)
            .bind(message)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(updated))
    }
}

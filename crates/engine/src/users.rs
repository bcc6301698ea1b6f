//! User-facing reads: the user directory and per-user rendered messages.

use sqlx::PgPool;

use herald_common::error::AppError;
use herald_common::types::{RenderedMessage, User};

pub struct UserService;

impl UserService {
    /// All users, ordered by name.
    pub async fn list_users(pool: &PgPool) -> Result<Vec<User>, AppError> {
        let users: Vec<User> = sqlx::query_as("SELECT id, name, role FROM users ORDER BY name")
            .fetch_all(pool)
            .await?;

        Ok(users)
    }

    /// Rendered messages delivered to a user, newest first.
    pub async fn notifications_for(
        pool: &PgPool,
        user_id: i64,
    ) -> Result<Vec<RenderedMessage>, AppError> {
        let messages: Vec<RenderedMessage> = sqlx::query_as(
            r#"
            SELECT id, user_id, delivery_id, message, is_read, created_at
            FROM user_notifications
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;

        Ok(messages)
    }

    /// Flag a rendered message as read. The only mutation a stored message
    /// ever sees.
    pub async fn mark_read(pool: &PgPool, message_id: i64) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE user_notifications SET is_read = true WHERE id = $1")
            .bind(message_id)
            .execute(pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Notification {} not found",
                message_id
            )));
        }

        tracing::debug!(message_id, "Notification marked read");
        Ok(())
    }
}

//! Delivery metrics and the paginated activity log.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use herald_common::error::AppError;
use herald_common::types::{ActivityEntry, StatusCount};

pub const DEFAULT_ACTIVITY_PAGE: i64 = 1;
pub const DEFAULT_ACTIVITY_LIMIT: i64 = 5;
const MAX_ACTIVITY_LIMIT: i64 = 100;

/// `?page=&limit=` for the activity log.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ActivityQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

impl ActivityQuery {
    /// Page (1-based) and page size, with defaults applied and out-of-range
    /// values clamped.
    pub fn resolve(&self) -> (i64, i64) {
        let page = self.page.unwrap_or(DEFAULT_ACTIVITY_PAGE).max(1);
        let limit = self
            .limit
            .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
            .clamp(1, MAX_ACTIVITY_LIMIT);
        (page, limit)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPage {
    pub data: Vec<ActivityEntry>,
    pub page: i64,
    pub total_pages: i64,
}

/// Number of pages needed to show `total` rows, `limit` per page.
pub fn total_pages(total: i64, limit: i64) -> i64 {
    if total <= 0 || limit <= 0 {
        return 0;
    }
    (total + limit - 1) / limit
}

pub struct ReportingService;

impl ReportingService {
    /// Delivery counts grouped by status. Statuses with no deliveries are
    /// omitted.
    pub async fn status_counts(pool: &PgPool) -> Result<Vec<StatusCount>, AppError> {
        let counts: Vec<StatusCount> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) AS count
            FROM notification_deliveries
            GROUP BY status
            ORDER BY status
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(counts)
    }

    /// One page of deliveries, newest first, with the template title
    /// resolved through the notification.
    pub async fn activity(pool: &PgPool, query: ActivityQuery) -> Result<ActivityPage, AppError> {
        let (page, limit) = query.resolve();
        let offset = (page - 1) * limit;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notification_deliveries")
            .fetch_one(pool)
            .await?;

        let data: Vec<ActivityEntry> = sqlx::query_as(
            r#"
            SELECT
                d.id,
                d.user_id,
                d.status,
                d.created_at,
                COALESCE(t.title, 'Unknown Template') AS template_title
            FROM notification_deliveries d
            LEFT JOIN notifications n ON d.notification_id = n.id
            LEFT JOIN notification_templates t ON n.template_id = t.id
            ORDER BY d.created_at DESC, d.id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

        Ok(ActivityPage {
            data,
            page,
            total_pages: total_pages(total, limit),
        })
    }
}

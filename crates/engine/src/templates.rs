//! Template service: create, list and seed notification templates.

use serde::Deserialize;
use sqlx::PgPool;

use herald_common::error::AppError;
use herald_common::types::Template;

/// Templates installed into an empty template table.
pub const DEFAULT_TEMPLATES: &[(&str, &str)] = &[
    (
        "Welcome Message",
        "Welcome {{name}}! Thanks for joining our platform.",
    ),
    (
        "Password Changed",
        "Hi {{name}}, your password was changed successfully.",
    ),
    ("Login Alert", "A new login was detected on your account."),
    (
        "Profile Updated",
        "Your profile information was updated successfully.",
    ),
    ("Subscription Activated", "Your subscription is now active."),
    ("Subscription Expired", "Your subscription has expired."),
    ("Payment Successful", "Your payment was successful."),
    ("Payment Failed", "Payment failed."),
    ("System Maintenance", "System maintenance scheduled soon."),
    ("Security Alert", "Suspicious activity detected."),
];

/// Parameters for creating a template.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateTemplateParams {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl CreateTemplateParams {
    /// Title and body, both present and non-blank.
    pub fn validate(&self) -> Result<(&str, &str), AppError> {
        let title = self.title.as_deref().map(str::trim).unwrap_or_default();
        let body = self.body.as_deref().unwrap_or_default();
        if title.is_empty() || body.trim().is_empty() {
            return Err(AppError::Validation("Title and body required".to_string()));
        }
        Ok((title, body))
    }
}

pub struct TemplateService;

impl TemplateService {
    pub async fn create(pool: &PgPool, params: &CreateTemplateParams) -> Result<Template, AppError> {
        let (title, body) = params.validate()?;

        let template: Template = sqlx::query_as(
            r#"
            INSERT INTO notification_templates (title, body)
            VALUES ($1, $2)
            RETURNING id, title, body
            "#,
        )
        .bind(title)
        .bind(body)
        .fetch_one(pool)
        .await?;

        tracing::info!(template_id = template.id, title = %template.title, "Template created");
        Ok(template)
    }

    pub async fn list(pool: &PgPool) -> Result<Vec<Template>, AppError> {
        let templates: Vec<Template> =
            sqlx::query_as("SELECT id, title, body FROM notification_templates ORDER BY id")
                .fetch_all(pool)
                .await?;

        Ok(templates)
    }

    /// Insert [`DEFAULT_TEMPLATES`] if the table is empty. Returns how many
    /// templates were inserted.
    pub async fn seed_defaults(pool: &PgPool) -> Result<usize, AppError> {
        let mut tx = pool.begin().await?;

        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notification_templates")
            .fetch_one(&mut *tx)
            .await?;
        if existing > 0 {
            tx.rollback().await?;
            return Ok(0);
        }

        for (title, body) in DEFAULT_TEMPLATES {
            sqlx::query("INSERT INTO notification_templates (title, body) VALUES ($1, $2)")
                .bind(title)
                .bind(body)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        tracing::info!(count = DEFAULT_TEMPLATES.len(), "Default templates seeded");
        Ok(DEFAULT_TEMPLATES.len())
    }
}

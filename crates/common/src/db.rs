//! PostgreSQL pool and schema setup.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;

use crate::config::AppConfig;

/// Schema for the ledger, templates, users and rendered messages.
static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// How long a caller waits for a free connection before the query fails.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to the ledger database and apply pending migrations.
///
/// Pool size comes from `DB_MAX_CONNECTIONS` (default 20).
pub async fn connect_database(config: &AppConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&config.database_url)
        .await?;

    MIGRATOR.run(&pool).await?;

    tracing::info!(
        max_connections = config.db_max_connections,
        migrations = MIGRATOR.iter().count(),
        "PostgreSQL ready"
    );
    Ok(pool)
}

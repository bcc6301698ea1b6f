use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Port the API server binds to (default: 4000)
    pub api_port: u16,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Name of the delivery job queue (default: "event-delivery")
    pub queue_name: String,

    /// Number of concurrent delivery workers per notifier process (default: 4)
    pub worker_concurrency: usize,

    /// Total delivery attempts per (notification, user) pair (default: 3)
    pub delivery_max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds (default: 2000)
    pub delivery_backoff_ms: u64,

    /// Idle wait between empty queue polls in milliseconds (default: 500)
    pub queue_poll_interval_ms: u64,

    /// Seconds a fetched job stays leased before it counts as stalled (default: 30)
    pub queue_lease_seconds: u64,

    /// Interval between stuck-delivery sweeps in seconds (default: 30)
    pub sweep_interval_seconds: u64,

    /// Age after which a PROCESSING delivery is considered abandoned (default: 120)
    pub stuck_processing_seconds: u64,

    /// Delivery channel: "simulated" or "webhook" (default: "simulated")
    pub delivery_channel: String,

    /// Target URL for the webhook channel
    pub delivery_webhook_url: Option<String>,

    /// Probability of success for the simulated channel (default: 0.7)
    pub simulated_success_rate: f64,

    /// Seed the default templates when the template table is empty (default: true)
    pub seed_templates: bool,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            api_port: parse_var("API_PORT", "4000")?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", "20")?,
            queue_name: std::env::var("QUEUE_NAME")
                .unwrap_or_else(|_| "event-delivery".to_string()),
            worker_concurrency: parse_var("WORKER_CONCURRENCY", "4")?,
            delivery_max_attempts: parse_var("DELIVERY_MAX_ATTEMPTS", "3")?,
            delivery_backoff_ms: parse_var("DELIVERY_BACKOFF_MS", "2000")?,
            queue_poll_interval_ms: parse_var("QUEUE_POLL_INTERVAL_MS", "500")?,
            queue_lease_seconds: parse_var("QUEUE_LEASE_SECONDS", "30")?,
            sweep_interval_seconds: parse_var("SWEEP_INTERVAL_SECONDS", "30")?,
            stuck_processing_seconds: parse_var("STUCK_PROCESSING_SECONDS", "120")?,
            delivery_channel: std::env::var("DELIVERY_CHANNEL")
                .unwrap_or_else(|_| "simulated".to_string()),
            delivery_webhook_url: std::env::var("DELIVERY_WEBHOOK_URL").ok(),
            simulated_success_rate: parse_var("SIMULATED_SUCCESS_RATE", "0.7")?,
            seed_templates: parse_var("SEED_TEMPLATES", "true")?,
        })
    }

    /// The retry policy shared by the dispatcher (job options) and the worker
    /// (terminal check).
    pub fn retry_policy(&self) -> anyhow::Result<RetryPolicy> {
        let policy = RetryPolicy::new(
            self.delivery_max_attempts,
            std::time::Duration::from_millis(self.delivery_backoff_ms),
        )?;
        Ok(policy)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| {
            anyhow::anyhow!(
                "{name} must be a valid {}",
                std::any::type_name::<T>()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_uses_default_when_unset() {
        let value: u32 = parse_var("HERALD_TEST_UNSET_VARIABLE", "42").unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_parse_var_rejects_garbage_default() {
        let result: anyhow::Result<u64> = parse_var("HERALD_TEST_UNSET_VARIABLE", "nope");
        assert!(result.is_err());
    }
}

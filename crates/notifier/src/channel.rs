//! Delivery channels.
//!
//! A channel performs the outward side effect of a delivery attempt. The
//! worker only needs to know whether the attempt succeeded; rendering and the
//! ledger write happen after a successful send.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use herald_common::config::AppConfig;
use herald_common::types::Delivery;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The receiving side answered but refused the delivery.
    #[error("delivery rejected: {0}")]
    Rejected(String),

    /// The receiving side could not be reached.
    #[error("transport failure: {0}")]
    Transport(String),
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Attempt one delivery. Any error counts as a failed attempt.
    async fn send(&self, delivery: &Delivery) -> Result<(), ChannelError>;
}

/// Build the channel named by `DELIVERY_CHANNEL`.
pub fn from_config(config: &AppConfig) -> anyhow::Result<Box<dyn DeliveryChannel>> {
    match config.delivery_channel.as_str() {
        "simulated" => Ok(Box::new(SimulatedChannel::new(
            config.simulated_success_rate,
        )?)),
        "webhook" => {
            let url = config.delivery_webhook_url.clone().ok_or_else(|| {
                anyhow::anyhow!("DELIVERY_WEBHOOK_URL is required for the webhook channel")
            })?;
            Ok(Box::new(WebhookChannel::new(url)?))
        }
        other => anyhow::bail!("unknown delivery channel '{other}' (expected simulated or webhook)"),
    }
}

// ============================================================
// Simulated
// ============================================================

/// Succeeds with a fixed probability. Stands in for a real provider in
/// development deployments.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedChannel {
    success_rate: f64,
}

impl SimulatedChannel {
    pub fn new(success_rate: f64) -> anyhow::Result<Self> {
        if !(0.0..=1.0).contains(&success_rate) {
            anyhow::bail!("SIMULATED_SUCCESS_RATE must be between 0 and 1, got {success_rate}");
        }
        Ok(Self { success_rate })
    }
}

#[async_trait]
impl DeliveryChannel for SimulatedChannel {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn send(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        if rand::random::<f64>() < self.success_rate {
            Ok(())
        } else {
            Err(ChannelError::Rejected(format!(
                "simulated failure for delivery {}",
                delivery.id
            )))
        }
    }
}

// ============================================================
// Webhook
// ============================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload {
    delivery_id: i64,
    notification_id: i64,
    user_id: i64,
}

/// POSTs the delivery identity to a fixed URL. Any 2xx is a success.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl DeliveryChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        let payload = WebhookPayload {
            delivery_id: delivery.id,
            notification_id: delivery.notification_id,
            user_id: delivery.user_id,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ChannelError::Rejected(format!("webhook answered {status}")))
        }
    }
}

// ============================================================
// Scripted
// ============================================================

/// Test double with a per-recipient script of outcomes. Once a recipient's
/// script runs out, `default_outcome` applies.
pub struct ScriptedChannel {
    scripts: Mutex<HashMap<i64, VecDeque<bool>>>,
    default_outcome: bool,
    calls: AtomicUsize,
}

impl ScriptedChannel {
    /// Every send succeeds unless scripted otherwise.
    pub fn succeeding() -> Self {
        Self::with_default(true)
    }

    /// Every send fails unless scripted otherwise.
    pub fn failing() -> Self {
        Self::with_default(false)
    }

    fn with_default(default_outcome: bool) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_outcome,
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue outcomes for a recipient, consumed one per send.
    pub fn script(self, user_id: i64, outcomes: &[bool]) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts
                .entry(user_id)
                .or_default()
                .extend(outcomes.iter().copied());
        }
        self
    }

    /// Number of sends attempted so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryChannel for ScriptedChannel {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn send(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.get_mut(&delivery.user_id)?.pop_front())
            .unwrap_or(self.default_outcome);

        if outcome {
            Ok(())
        } else {
            Err(ChannelError::Rejected(format!(
                "scripted failure for user {}",
                delivery.user_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use herald_common::types::DeliveryStatus;

    fn delivery(user_id: i64) -> Delivery {
        Delivery {
            id: 7,
            notification_id: 3,
            user_id,
            status: DeliveryStatus::Processing,
            retry_count: 0,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_simulated_extremes_are_deterministic() {
        let always = SimulatedChannel::new(1.0).unwrap();
        let never = SimulatedChannel::new(0.0).unwrap();
        for _ in 0..20 {
            assert!(always.send(&delivery(1)).await.is_ok());
            assert!(never.send(&delivery(1)).await.is_err());
        }
    }

    #[test]
    fn test_simulated_rate_out_of_range_rejected() {
        assert!(SimulatedChannel::new(1.5).is_err());
        assert!(SimulatedChannel::new(-0.1).is_err());
    }

    #[tokio::test]
    async fn test_scripted_outcomes_then_default() {
        let channel = ScriptedChannel::succeeding().script(1, &[false, false]);

        assert!(channel.send(&delivery(1)).await.is_err());
        assert!(channel.send(&delivery(1)).await.is_err());
        assert!(channel.send(&delivery(1)).await.is_ok());
        // Unscripted recipient uses the default.
        assert!(channel.send(&delivery(2)).await.is_ok());
        assert_eq!(channel.calls(), 4);
    }

    #[test]
    fn test_webhook_payload_wire_format() {
        let payload = WebhookPayload {
            delivery_id: 7,
            notification_id: 3,
            user_id: 1,
        };
        assert_eq!(
            serde_json::to_value(payload).unwrap(),
            serde_json::json!({"deliveryId": 7, "notificationId": 3, "userId": 1})
        );
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let mut config = test_config();
        config.delivery_channel = "carrier-pigeon".into();
        assert!(from_config(&config).is_err());

        config.delivery_channel = "webhook".into();
        config.delivery_webhook_url = None;
        assert!(from_config(&config).is_err());

        config.delivery_channel = "simulated".into();
        assert_eq!(from_config(&config).unwrap().name(), "simulated");
    }

    fn test_config() -> AppConfig {
        AppConfig {
            database_url: "postgres://localhost/herald".into(),
            redis_url: "redis://localhost:6379".into(),
            api_port: 4000,
            db_max_connections: 5,
            queue_name: "event-delivery".into(),
            worker_concurrency: 1,
            delivery_max_attempts: 3,
            delivery_backoff_ms: 2000,
            queue_poll_interval_ms: 500,
            queue_lease_seconds: 30,
            sweep_interval_seconds: 30,
            stuck_processing_seconds: 120,
            delivery_channel: "simulated".into(),
            delivery_webhook_url: None,
            simulated_success_rate: 0.7,
            seed_templates: false,
        }
    }
}

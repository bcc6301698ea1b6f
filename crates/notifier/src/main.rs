//! Herald notifier binary: consumes delivery jobs and recovers stuck
//! deliveries.

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db::connect_database;
use herald_common::redis_pool::connect_redis;
use herald_engine::ledger::{DeliveryLedger, PgDeliveryLedger};
use herald_engine::queue::{JobQueue, RedisJobQueue};

use herald_notifier::channel;
use herald_notifier::consumer::{ConsumerConfig, QueueConsumer};
use herald_notifier::sweep::{StuckDeliverySweep, SweepConfig};
use herald_notifier::worker::DeliveryWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald_notifier=info,herald_engine=info")
        }))
        .json()
        .init();

    tracing::info!("Herald notifier starting...");

    let config = AppConfig::from_env()?;
    let policy = config.retry_policy()?;

    let pool = connect_database(&config).await?;

    let redis = connect_redis(&config).await?;

    let ledger: Arc<dyn DeliveryLedger> = Arc::new(PgDeliveryLedger::new(pool));
    let queue: Arc<dyn JobQueue> = Arc::new(RedisJobQueue::new(
        redis,
        &config.queue_name,
        config.queue_lease_seconds,
    ));
    let channel: Arc<dyn channel::DeliveryChannel> = Arc::from(channel::from_config(&config)?);

    tracing::info!(
        queue = %config.queue_name,
        channel = channel.name(),
        max_attempts = policy.max_attempts(),
        backoff_base_ms = policy.backoff_base().as_millis() as u64,
        "Delivery pipeline configured"
    );

    let worker = Arc::new(DeliveryWorker::new(ledger.clone(), channel, policy));
    let consumer = Arc::new(QueueConsumer::new(
        queue.clone(),
        worker,
        ConsumerConfig::from_app_config(&config),
    ));
    let sweep = StuckDeliverySweep::new(ledger, queue, policy, SweepConfig::from_app_config(&config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_task = tokio::spawn(consumer.run(shutdown_rx.clone()));
    let sweep_task = tokio::spawn(async move { sweep.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    shutdown_tx.send(true)?;

    let (consumer_result, sweep_result) = tokio::join!(consumer_task, sweep_task);
    consumer_result?;
    sweep_result?;

    tracing::info!("Herald notifier stopped.");
    Ok(())
}

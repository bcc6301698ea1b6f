//! Redis connection for the job queue.

use redis::Client;
use redis::aio::ConnectionManager;

use crate::config::AppConfig;

/// Open a reconnecting Redis handle and check the server answers.
///
/// Clones share one multiplexed connection; every queue handle gets a clone.
pub async fn connect_redis(config: &AppConfig) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(config.redis_url.as_str())?;
    let mut manager = ConnectionManager::new(client).await?;

    let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
    tracing::info!(reply = %pong, queue = %config.queue_name, "Redis ready");
    Ok(manager)
}

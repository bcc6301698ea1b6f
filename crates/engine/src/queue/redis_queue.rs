//! Redis-backed job queue.
//!
//! Layout under `herald:{queue}:`
//! - `wait`     list of ready job ids (pushed left, popped right)
//! - `active`   list of leased job ids
//! - `delayed`  sorted set of job ids scored by ready-at (epoch ms)
//! - `job:{id}` JSON job record
//! - `lease:{id}` lease marker with `EX` expiry
//! - `dead`     capped list of ids that exhausted their attempts; records of
//!   ids trimmed off the end are deleted with them
//!
//! Moves between lists run as Lua scripts so a crash never leaves a job id in
//! two places or in none.

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::Script;
use redis::aio::ConnectionManager;

use herald_common::retry::JobOptions;
use herald_common::types::DeliveryJob;

use super::{FailureDisposition, JobQueue, QueueCounts, QueueError, QueuedJob, record_failure};

/// Delayed jobs promoted per fetch.
const PROMOTE_BATCH: i64 = 100;

/// Ids kept in the dead list for inspection.
const DEAD_LIST_CAP: isize = 1000;

const PROMOTE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('LPUSH', KEYS[2], id)
end
return #ids
"#;

const LEASE_SCRIPT: &str = r#"
local id = redis.call('LMOVE', KEYS[1], KEYS[2], 'RIGHT', 'LEFT')
if not id then
  return false
end
redis.call('SET', ARGV[1] .. id, '1', 'EX', ARGV[2])
return id
"#;

const DROP_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], ARGV[1])
redis.call('LREM', KEYS[2], 1, ARGV[2])
redis.call('DEL', KEYS[3])
redis.call('LPUSH', KEYS[4], ARGV[2])
local cap = tonumber(ARGV[3])
local trimmed = redis.call('LRANGE', KEYS[4], cap, -1)
for _, id in ipairs(trimmed) do
  redis.call('DEL', ARGV[4] .. id)
end
redis.call('LTRIM', KEYS[4], 0, cap - 1)
return #trimmed
"#;

const RECLAIM_SCRIPT: &str = r#"
local ids = redis.call('LRANGE', KEYS[1], 0, -1)
local reclaimed = 0
for _, id in ipairs(ids) do
  if redis.call('EXISTS', ARGV[1] .. id) == 0 then
    redis.call('LREM', KEYS[1], 1, id)
    redis.call('RPUSH', KEYS[2], id)
    reclaimed = reclaimed + 1
  end
end
return reclaimed
"#;

fn queue_prefix(queue_name: &str) -> String {
    format!("herald:{queue_name}:")
}

/// Prefix the Lua scripts concatenate with a job id to reach its record.
fn job_prefix(prefix: &str) -> String {
    format!("{prefix}job:")
}

fn job_key(prefix: &str, id: &str) -> String {
    format!("{}{id}", job_prefix(prefix))
}

/// Prefix the Lua scripts concatenate with a job id to reach its lease.
fn lease_prefix(prefix: &str) -> String {
    format!("{prefix}lease:")
}

fn lease_key(prefix: &str, id: &str) -> String {
    format!("{}{id}", lease_prefix(prefix))
}

#[derive(Clone)]
pub struct RedisJobQueue {
    redis: ConnectionManager,
    prefix: String,
    lease_seconds: u64,
    dead_cap: isize,
}

impl RedisJobQueue {
    pub fn new(redis: ConnectionManager, queue_name: &str, lease_seconds: u64) -> Self {
        Self {
            redis,
            prefix: queue_prefix(queue_name),
            lease_seconds: lease_seconds.max(1),
            dead_cap: DEAD_LIST_CAP,
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    fn job_key(&self, id: &str) -> String {
        job_key(&self.prefix, id)
    }

    fn lease_prefix(&self) -> String {
        lease_prefix(&self.prefix)
    }

    fn lease_key(&self, id: &str) -> String {
        lease_key(&self.prefix, id)
    }

    async fn promote_delayed(&self) -> Result<i64, QueueError> {
        let mut redis = self.redis.clone();
        let now_ms = Utc::now().timestamp_millis();
        let promoted: i64 = Script::new(PROMOTE_SCRIPT)
            .key(self.key("delayed"))
            .key(self.key("wait"))
            .arg(now_ms)
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut redis)
            .await?;

        if promoted > 0 {
            tracing::debug!(promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, data: DeliveryJob, opts: JobOptions) -> Result<String, QueueError> {
        let job = QueuedJob::new(data, opts);
        let record = serde_json::to_string(&job)?;
        let mut redis = self.redis.clone();

        let _: () = redis::pipe()
            .atomic()
            .set(self.job_key(&job.id), record)
            .ignore()
            .lpush(self.key("wait"), &job.id)
            .ignore()
            .query_async(&mut redis)
            .await?;

        tracing::debug!(
            job_id = %job.id,
            notification_id = data.notification_id,
            user_id = data.user_id,
            "Job enqueued"
        );
        Ok(job.id)
    }

    async fn fetch(&self) -> Result<Option<QueuedJob>, QueueError> {
        self.promote_delayed().await?;
        let mut redis = self.redis.clone();

        loop {
            let id: Option<String> = Script::new(LEASE_SCRIPT)
                .key(self.key("wait"))
                .key(self.key("active"))
                .arg(self.lease_prefix())
                .arg(self.lease_seconds)
                .invoke_async(&mut redis)
                .await?;

            let Some(id) = id else {
                return Ok(None);
            };

            let record: Option<String> = redis.get(self.job_key(&id)).await?;
            match record {
                Some(record) => return Ok(Some(serde_json::from_str(&record)?)),
                None => {
                    // Record vanished (completed by a duplicate). Drop the id.
                    tracing::warn!(job_id = %id, "Leased job has no record, discarding");
                    let _: () = redis::pipe()
                        .atomic()
                        .lrem(self.key("active"), 1, &id)
                        .ignore()
                        .del(self.lease_key(&id))
                        .ignore()
                        .query_async(&mut redis)
                        .await?;
                }
            }
        }
    }

    async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut redis = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .lrem(self.key("active"), 1, &job.id)
            .ignore()
            .del(self.job_key(&job.id))
            .ignore()
            .del(self.lease_key(&job.id))
            .ignore()
            .query_async(&mut redis)
            .await?;
        Ok(())
    }

    async fn fail(
        &self,
        job: &QueuedJob,
        reason: &str,
    ) -> Result<FailureDisposition, QueueError> {
        let (failed, disposition) = record_failure(job, reason);
        let record = serde_json::to_string(&failed)?;
        let mut redis = self.redis.clone();

        match disposition {
            FailureDisposition::Rescheduled { delay, .. } => {
                let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                let _: () = redis::pipe()
                    .atomic()
                    .set(self.job_key(&failed.id), record)
                    .ignore()
                    .lrem(self.key("active"), 1, &failed.id)
                    .ignore()
                    .del(self.lease_key(&failed.id))
                    .ignore()
                    .zadd(self.key("delayed"), &failed.id, ready_at)
                    .ignore()
                    .query_async(&mut redis)
                    .await?;
            }
            FailureDisposition::Dropped { .. } => {
                let evicted: i64 = Script::new(DROP_SCRIPT)
                    .key(self.job_key(&failed.id))
                    .key(self.key("active"))
                    .key(self.lease_key(&failed.id))
                    .key(self.key("dead"))
                    .arg(record)
                    .arg(&failed.id)
                    .arg(self.dead_cap)
                    .arg(job_prefix(&self.prefix))
                    .invoke_async(&mut redis)
                    .await?;

                if evicted > 0 {
                    tracing::debug!(evicted, "Evicted oldest dead jobs");
                }
            }
        }

        Ok(disposition)
    }

    async fn reclaim_stalled(&self) -> Result<u64, QueueError> {
        let mut redis = self.redis.clone();
        let reclaimed: u64 = Script::new(RECLAIM_SCRIPT)
            .key(self.key("active"))
            .key(self.key("wait"))
            .arg(self.lease_prefix())
            .invoke_async(&mut redis)
            .await?;

        if reclaimed > 0 {
            tracing::warn!(reclaimed, "Reclaimed stalled jobs");
        }
        Ok(reclaimed)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut redis = self.redis.clone();
        let (waiting, active, delayed, dead): (u64, u64, u64, u64) = redis::pipe()
            .llen(self.key("wait"))
            .llen(self.key("active"))
            .zcard(self.key("delayed"))
            .llen(self.key("dead"))
            .query_async(&mut redis)
            .await?;

        Ok(QueueCounts {
            waiting,
            active,
            delayed,
            dead,
        })
    }
}

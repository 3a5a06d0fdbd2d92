//! Redis implementation of [`JobQueue`].
//!
//! This is the durable backend: waiting, delayed, and repeating jobs
//! live in Redis and survive process restarts. Consumers poll; claimed
//! jobs are parked in a visibility set and re-queued with an advanced
//! attempt counter if their consumer dies.
//!
//! Key layout per queue (prefix `p`, queue `q`):
//!
//! | Key                 | Type | Contents                               |
//! |---------------------|------|----------------------------------------|
//! | `p:q:job:<id>`      | str  | JSON payload + attempt counter         |
//! | `p:q:ready`         | list | ids ready to run                       |
//! | `p:q:delayed`       | zset | id scored by due time (epoch ms)       |
//! | `p:q:active`        | zset | id scored by visibility deadline       |
//! | `p:q:repeat`        | hash | id -> repeat schedule JSON             |
//! | `p:q:completed`     | list | last 100 finished ids                  |
//! | `p:q:failed`        | list | last 500 permanently failed ids        |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::RedisConfig;
use crate::error::{Result, WebhookError};
use crate::queue::{
    Job, JobHandler, JobQueue, QueueCounts, QueueName, QueuePolicies, QueuePolicy, RepeatSchedule,
    COMPLETED_RETENTION, FAILED_RETENTION,
};

#[derive(Debug, Serialize, Deserialize)]
struct StoredJob {
    payload: Value,
    attempts_made: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRepeat {
    payload: Value,
    schedule: StoredSchedule,
    next_fire_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum StoredSchedule {
    Every { period_ms: u64 },
    Hourly,
}

impl From<RepeatSchedule> for StoredSchedule {
    fn from(schedule: RepeatSchedule) -> Self {
        match schedule {
            RepeatSchedule::Every(period) => StoredSchedule::Every {
                period_ms: period.as_millis() as u64,
            },
            RepeatSchedule::Hourly => StoredSchedule::Hourly,
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn first_fire_ms(schedule: StoredSchedule, now: i64) -> i64 {
    match schedule {
        StoredSchedule::Every { period_ms } => now + period_ms as i64,
        StoredSchedule::Hourly => next_hour_ms(now),
    }
}

/// Next top-of-hour, epoch milliseconds. Epoch hours align with UTC.
fn next_hour_ms(now: i64) -> i64 {
    now - now.rem_euclid(3_600_000) + 3_600_000
}

fn redis_err(e: redis::RedisError) -> WebhookError {
    WebhookError::Internal(format!("redis: {e}"))
}

fn json_err(e: serde_json::Error) -> WebhookError {
    WebhookError::Internal(format!("queue codec: {e}"))
}

struct Keys {
    prefix: String,
    queue: QueueName,
}

impl Keys {
    fn job(&self, id: &str) -> String {
        format!("{}:{}:job:{}", self.prefix, self.queue, id)
    }

    fn ready(&self) -> String {
        format!("{}:{}:ready", self.prefix, self.queue)
    }

    fn delayed(&self) -> String {
        format!("{}:{}:delayed", self.prefix, self.queue)
    }

    fn active(&self) -> String {
        format!("{}:{}:active", self.prefix, self.queue)
    }

    fn repeat(&self) -> String {
        format!("{}:{}:repeat", self.prefix, self.queue)
    }

    fn completed(&self) -> String {
        format!("{}:{}:completed", self.prefix, self.queue)
    }

    fn failed(&self) -> String {
        format!("{}:{}:failed", self.prefix, self.queue)
    }
}

/// Redis-backed queue.
pub struct RedisQueue {
    client: redis::Client,
    prefix: String,
    policies: QueuePolicies,
    visibility_timeout: Duration,
    poll_interval: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl RedisQueue {
    /// Connect using the process configuration.
    pub fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url()).map_err(redis_err)?;
        Ok(Self::new(client, "webhooks"))
    }

    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            client,
            prefix: prefix.into(),
            policies: QueuePolicies::default(),
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            handles: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    pub fn with_policies(mut self, policies: QueuePolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn keys(&self, queue: QueueName) -> Keys {
        Keys {
            prefix: self.prefix.clone(),
            queue,
        }
    }

    async fn conn(&self) -> Result<redis::aio::Connection> {
        self.client.get_tokio_connection().await.map_err(redis_err)
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, queue: QueueName, job_id: &str, payload: Value) -> Result<()> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let exists: bool = conn.exists(keys.job(job_id)).await.map_err(redis_err)?;
        if exists {
            // An instance with this id is already pending; coalesce.
            return Ok(());
        }

        let stored = serde_json::to_string(&StoredJob {
            payload,
            attempts_made: 0,
        })
        .map_err(json_err)?;
        let _: () = conn.set(keys.job(job_id), stored).await.map_err(redis_err)?;
        let _: () = conn.lpush(keys.ready(), job_id).await.map_err(redis_err)?;
        Ok(())
    }

    async fn add_repeating(
        &self,
        queue: QueueName,
        job_id: &str,
        payload: Value,
        schedule: RepeatSchedule,
    ) -> Result<()> {
        let keys = self.keys(queue);
        let schedule = StoredSchedule::from(schedule);
        let stored = serde_json::to_string(&StoredRepeat {
            payload,
            schedule,
            next_fire_ms: first_fire_ms(schedule, now_ms()),
        })
        .map_err(json_err)?;

        let mut conn = self.conn().await?;
        let _: () = conn
            .hset(keys.repeat(), job_id, stored)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn remove_scheduled(&self, queue: QueueName, job_id: &str) -> Result<()> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;
        let _: () = conn
            .hdel(keys.repeat(), job_id)
            .await
            .map_err(redis_err)?;
        let _: () = conn.del(keys.job(job_id)).await.map_err(redis_err)?;
        let _: () = conn
            .zrem(keys.delayed(), job_id)
            .await
            .map_err(redis_err)?;
        let _: () = conn.zrem(keys.active(), job_id).await.map_err(redis_err)?;
        let _: () = conn
            .lrem(keys.ready(), 0, job_id)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;
        let waiting: usize = conn.llen(keys.ready()).await.map_err(redis_err)?;
        let active: usize = conn.zcard(keys.active()).await.map_err(redis_err)?;
        let delayed: usize = conn.zcard(keys.delayed()).await.map_err(redis_err)?;
        let repeats: usize = conn.hlen(keys.repeat()).await.map_err(redis_err)?;
        let completed: usize = conn.llen(keys.completed()).await.map_err(redis_err)?;
        let failed: usize = conn.llen(keys.failed()).await.map_err(redis_err)?;
        Ok(QueueCounts {
            waiting,
            active,
            completed,
            failed,
            delayed: delayed + repeats,
        })
    }

    async fn process(&self, queue: QueueName, handler: Arc<dyn JobHandler>) -> Result<()> {
        let consumer = RedisConsumer {
            client: self.client.clone(),
            keys: self.keys(queue),
            policy: self.policies.get(queue),
            visibility_timeout: self.visibility_timeout,
            poll_interval: self.poll_interval,
            handler,
        };
        let shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(consumer.run(shutdown));
        self.handles.lock().await.push(handle);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        Ok(())
    }
}

struct RedisConsumer {
    client: redis::Client,
    keys: Keys,
    policy: QueuePolicy,
    visibility_timeout: Duration,
    poll_interval: Duration,
    handler: Arc<dyn JobHandler>,
}

impl RedisConsumer {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(component = "queue", queue = %self.keys.queue, "consumer started");

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(err) = self.poll_once().await {
                        error!(component = "queue", queue = %self.keys.queue,
                               error = %err, "poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(component = "queue", queue = %self.keys.queue,
                              "consumer shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let mut conn = self
            .client
            .get_tokio_connection()
            .await
            .map_err(redis_err)?;

        self.promote_delayed(&mut conn).await?;
        self.requeue_stalled(&mut conn).await?;
        self.fire_repeats(&mut conn).await?;

        // Drain everything ready this tick.
        loop {
            let id: Option<String> = conn
                .rpop(self.keys.ready(), None)
                .await
                .map_err(redis_err)?;
            let Some(id) = id else { break };
            self.run_job(&mut conn, &id).await?;
        }
        Ok(())
    }

    async fn promote_delayed(&self, conn: &mut redis::aio::Connection) -> Result<()> {
        let due: Vec<String> = conn
            .zrangebyscore(self.keys.delayed(), 0, now_ms())
            .await
            .map_err(redis_err)?;
        for id in due {
            let removed: i64 = conn
                .zrem(self.keys.delayed(), &id)
                .await
                .map_err(redis_err)?;
            if removed > 0 {
                let _: () = conn.lpush(self.keys.ready(), &id).await.map_err(redis_err)?;
            }
        }
        Ok(())
    }

    async fn requeue_stalled(&self, conn: &mut redis::aio::Connection) -> Result<()> {
        let stalled: Vec<String> = conn
            .zrangebyscore(self.keys.active(), 0, now_ms())
            .await
            .map_err(redis_err)?;
        for id in stalled {
            let removed: i64 = conn
                .zrem(self.keys.active(), &id)
                .await
                .map_err(redis_err)?;
            if removed == 0 {
                continue;
            }
            if let Some(mut job) = self.read_job(conn, &id).await? {
                job.attempts_made += 1;
                self.write_job(conn, &id, &job).await?;
                let _: () = conn.lpush(self.keys.ready(), &id).await.map_err(redis_err)?;
                debug!(component = "queue", queue = %self.keys.queue, job_id = %id,
                       "stalled job re-queued");
            }
        }
        Ok(())
    }

    async fn fire_repeats(&self, conn: &mut redis::aio::Connection) -> Result<()> {
        let repeats: Vec<(String, String)> = conn
            .hgetall(self.keys.repeat())
            .await
            .map_err(redis_err)?;
        let now = now_ms();

        for (id, raw) in repeats {
            let Ok(mut repeat) = serde_json::from_str::<StoredRepeat>(&raw) else {
                continue;
            };
            if repeat.next_fire_ms > now {
                continue;
            }

            let pending: bool = conn.exists(self.keys.job(&id)).await.map_err(redis_err)?;
            if !pending {
                let job = StoredJob {
                    payload: repeat.payload.clone(),
                    attempts_made: 0,
                };
                self.write_job(conn, &id, &job).await?;
                let _: () = conn.lpush(self.keys.ready(), &id).await.map_err(redis_err)?;
            }

            repeat.next_fire_ms = match repeat.schedule {
                StoredSchedule::Every { period_ms } => {
                    let period = period_ms.max(1) as i64;
                    let mut next = repeat.next_fire_ms + period;
                    while next <= now {
                        next += period;
                    }
                    next
                }
                StoredSchedule::Hourly => next_hour_ms(now),
            };
            let raw = serde_json::to_string(&repeat).map_err(json_err)?;
            let _: () = conn
                .hset(self.keys.repeat(), &id, raw)
                .await
                .map_err(redis_err)?;
        }
        Ok(())
    }

    async fn run_job(&self, conn: &mut redis::aio::Connection, id: &str) -> Result<()> {
        let Some(stored) = self.read_job(conn, id).await? else {
            // Removed while waiting; nothing to do.
            return Ok(());
        };

        let deadline = now_ms() + self.visibility_timeout.as_millis() as i64;
        let _: () = conn
            .zadd(self.keys.active(), id, deadline)
            .await
            .map_err(redis_err)?;

        let job = Job {
            id: id.to_string(),
            payload: stored.payload.clone(),
            attempts_made: stored.attempts_made,
        };
        let result = self.handler.handle(&job).await;

        let _: () = conn.zrem(self.keys.active(), id).await.map_err(redis_err)?;
        match result {
            Ok(()) => {
                let _: () = conn.del(self.keys.job(id)).await.map_err(redis_err)?;
                let _: () = conn
                    .lpush(self.keys.completed(), id)
                    .await
                    .map_err(redis_err)?;
                let _: () = conn
                    .ltrim(self.keys.completed(), 0, COMPLETED_RETENTION as isize - 1)
                    .await
                    .map_err(redis_err)?;
            }
            Err(err) => {
                let mut stored = stored;
                stored.attempts_made += 1;
                if stored.attempts_made < self.policy.max_attempts {
                    let due = now_ms() + self.policy.delay(stored.attempts_made).as_millis() as i64;
                    self.write_job(conn, id, &stored).await?;
                    let _: () = conn
                        .zadd(self.keys.delayed(), id, due)
                        .await
                        .map_err(redis_err)?;
                    debug!(component = "queue", queue = %self.keys.queue, job_id = %id,
                           failures = stored.attempts_made, error = %err,
                           "job failed, retry scheduled");
                } else {
                    let _: () = conn.del(self.keys.job(id)).await.map_err(redis_err)?;
                    let _: () = conn
                        .lpush(self.keys.failed(), id)
                        .await
                        .map_err(redis_err)?;
                    let _: () = conn
                        .ltrim(self.keys.failed(), 0, FAILED_RETENTION as isize - 1)
                        .await
                        .map_err(redis_err)?;
                    error!(component = "queue", queue = %self.keys.queue, job_id = %id,
                           failures = stored.attempts_made, error = %err,
                           "job failed permanently");
                }
            }
        }
        Ok(())
    }

    async fn read_job(
        &self,
        conn: &mut redis::aio::Connection,
        id: &str,
    ) -> Result<Option<StoredJob>> {
        let raw: Option<String> = conn.get(self.keys.job(id)).await.map_err(redis_err)?;
        match raw {
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(json_err),
            None => Ok(None),
        }
    }

    async fn write_job(
        &self,
        conn: &mut redis::aio::Connection,
        id: &str,
        job: &StoredJob,
    ) -> Result<()> {
        let raw = serde_json::to_string(job).map_err(json_err)?;
        let _: () = conn.set(self.keys.job(id), raw).await.map_err(redis_err)?;
        Ok(())
    }
}

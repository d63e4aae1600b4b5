//! Redis-backed queue store shared by every backend process.
//!
//! Layout per queue `q`:
//! - `scribe:job:{id}`: job JSON as of the last release (PX = retention once terminal)
//! - `scribe:queue:{q}:waiting`: zset, score = ready-at (ms)
//! - `scribe:queue:{q}:active`: zset, score = lease deadline (ms)
//! - `scribe:queue:{q}:completed` / `:failed`: zset, score = eviction time (ms)
//!
//! Claim, release and reclaim run as Lua scripts, so set membership moves are
//! atomic with respect to other processes. A job is active exactly while its
//! id is in the active set; the record is not rewritten on claim. The lease
//! deadline doubles as the [`LeaseToken`]: every claim or reclaim moves it
//! forward, and release only succeeds for the deadline the caller was given.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{instrument, warn};

use super::store::{QueueCounts, QueueError, QueueStore};
use super::types::{Job, JobId, JobState, LeaseToken, QueueName};

// KEYS: job, waiting; ARGV: id, json, ready_ms
const PUSH: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

// KEYS: waiting, active; ARGV: now_ms, deadline_ms
const CLAIM: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then return false end
redis.call('ZREM', KEYS[1], ids[1])
redis.call('ZADD', KEYS[2], ARGV[2], ids[1])
return ids[1]
"#;

// KEYS: active, target set, job; ARGV: id, json, score, px (0 = persist), lease
const RELEASE: &str = r#"
local held = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not held or tonumber(held) ~= tonumber(ARGV[5]) then return 0 end
redis.call('ZREM', KEYS[1], ARGV[1])
if tonumber(ARGV[4]) > 0 then
  redis.call('SET', KEYS[3], ARGV[2], 'PX', ARGV[4])
else
  redis.call('SET', KEYS[3], ARGV[2])
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

// KEYS: active; ARGV: now_ms, deadline_ms
const RECLAIM: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(ids) do
  redis.call('ZADD', KEYS[1], ARGV[2], id)
end
return ids
"#;

fn job_key(id: JobId) -> String {
    format!("scribe:job:{id}")
}

fn set_key(queue: QueueName, set: &str) -> String {
    format!("scribe:queue:{queue}:{set}")
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

fn storage(e: redis::RedisError) -> QueueError {
    QueueError::Storage(e.to_string())
}

fn encode(job: &Job) -> Result<String, QueueError> {
    serde_json::to_string(job).map_err(|e| QueueError::Encoding(e.to_string()))
}

fn decode(raw: &str) -> Result<Job, QueueError> {
    serde_json::from_str(raw).map_err(|e| QueueError::Encoding(e.to_string()))
}

#[derive(Clone)]
pub struct RedisQueueStore {
    conn: ConnectionManager,
    push: redis::Script,
    claim: redis::Script,
    release: redis::Script,
    reclaim: redis::Script,
}

impl std::fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueStore").finish_non_exhaustive()
    }
}

impl RedisQueueStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            push: redis::Script::new(PUSH),
            claim: redis::Script::new(CLAIM),
            release: redis::Script::new(RELEASE),
            reclaim: redis::Script::new(RECLAIM),
        }
    }

    async fn release_to(
        &self,
        job: &Job,
        target: String,
        score: i64,
        px: i64,
    ) -> Result<(), QueueError> {
        let Some(lease) = job.lease else {
            return Err(QueueError::LeaseLost(job.id));
        };
        let released = Job {
            lease: None,
            ..job.clone()
        };
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .release
            .key(set_key(job.queue, "active"))
            .key(target)
            .key(job_key(job.id))
            .arg(job.id.to_string())
            .arg(encode(&released)?)
            .arg(score)
            .arg(px)
            .arg(lease.0)
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;
        if moved == 0 {
            return Err(QueueError::LeaseLost(job.id));
        }
        Ok(())
    }

    /// Load a record, marking it claimed if its id sits in the active set.
    async fn load(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(job_key(id)).await.map_err(storage)?;
        let Some(mut job) = raw.as_deref().map(decode).transpose()? else {
            return Ok(None);
        };
        let held: Option<f64> = conn
            .zscore(set_key(job.queue, "active"), id.to_string())
            .await
            .map_err(storage)?;
        if let Some(deadline) = held {
            job.mark_claimed(LeaseToken(deadline as i64));
        }
        Ok(Some(job))
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue), err)]
    async fn push(&self, job: Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: i64 = self
            .push
            .key(job_key(job.id))
            .key(set_key(job.queue, "waiting"))
            .arg(job.id.to_string())
            .arg(encode(&job)?)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;
        if created == 0 {
            return Err(QueueError::AlreadyExists(job.id));
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.load(id).await
    }

    async fn claim(&self, queue: QueueName, lease: Duration) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let deadline = now + ms(lease);
        let claimed: Option<String> = self
            .claim
            .key(set_key(queue, "waiting"))
            .key(set_key(queue, "active"))
            .arg(now)
            .arg(deadline)
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;

        let Some(raw_id) = claimed else {
            return Ok(None);
        };
        let id: JobId = raw_id
            .parse()
            .map_err(|e: scribe_core::DomainError| QueueError::Encoding(e.to_string()))?;

        let Some(mut job) = self.load(id).await? else {
            warn!(job_id = %id, queue = %queue, "claimed job has no record; dropping");
            let _: i64 = conn.zrem(set_key(queue, "active"), id.to_string()).await.map_err(storage)?;
            return Ok(None);
        };
        job.mark_claimed(LeaseToken(deadline));
        Ok(Some(job))
    }

    async fn reschedule(&self, job: &Job, delay: Duration) -> Result<(), QueueError> {
        debug_assert_eq!(job.state, JobState::Waiting);
        self.release_to(job, set_key(job.queue, "waiting"), now_ms() + ms(delay), 0)
            .await
    }

    async fn finish(&self, job: &Job, retain_for: Duration) -> Result<(), QueueError> {
        let set = match job.state {
            JobState::Failed => "failed",
            _ => "completed",
        };
        let retain = ms(retain_for).max(1);
        self.release_to(job, set_key(job.queue, set), now_ms() + retain, retain)
            .await
    }

    async fn reclaim_stalled(&self, queue: QueueName, lease: Duration) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let ids: Vec<String> = self
            .reclaim
            .key(set_key(queue, "active"))
            .arg(now)
            .arg(now + ms(lease))
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;

        let mut jobs = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let Ok(id) = raw_id.parse::<JobId>() else {
                warn!(queue = %queue, id = %raw_id, "malformed id in active set");
                continue;
            };
            if let Some(job) = self.load(id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError> {
        let mut conn = self.conn.clone();
        let live = format!("({}", now_ms());
        let (waiting, active, completed, failed): (usize, usize, usize, usize) = redis::pipe()
            .zcard(set_key(queue, "waiting"))
            .zcard(set_key(queue, "active"))
            .zcount(set_key(queue, "completed"), &live, "+inf")
            .zcount(set_key(queue, "failed"), &live, "+inf")
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        Ok(QueueCounts {
            waiting,
            active,
            completed,
            failed,
        })
    }

    async fn prune(&self, queue: QueueName) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let (completed, failed): (usize, usize) = redis::pipe()
            .zrembyscore(set_key(queue, "completed"), "-inf", now)
            .zrembyscore(set_key(queue, "failed"), "-inf", now)
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        Ok(completed + failed)
    }
}

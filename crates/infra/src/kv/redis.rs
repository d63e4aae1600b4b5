//! Redis-backed key/value store (shared across backend processes).
//!
//! Single-key operations map to plain commands; the compound primitives run as
//! Lua scripts so they stay atomic with other clients interleaving.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::instrument;

use super::{KvError, KvStore};

const DELETE_IF_EQ: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const INCR_WITH_TTL: &str = r#"
local v = redis.call('INCR', KEYS[1])
if v == 1 and tonumber(ARGV[1]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return v
"#;

// KEYS[1] guard, KEYS[2] target; ARGV: expected, value, ttl_ms, expect_absent
const COMPARE_AND_SET: &str = r#"
local cur = redis.call('GET', KEYS[1])
if ARGV[4] == '1' then
  if cur then return 0 end
elseif cur ~= ARGV[1] then
  return 0
end
if tonumber(ARGV[3]) > 0 then
  redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
else
  redis.call('SET', KEYS[2], ARGV[2])
end
return 1
"#;

#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
    delete_if_eq: redis::Script,
    incr_with_ttl: redis::Script,
    compare_and_set: redis::Script,
}

impl std::fmt::Debug for RedisKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKvStore").finish_non_exhaustive()
    }
}

impl RedisKvStore {
    /// Connect to Redis (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| KvError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| KvError::Connection(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            delete_if_eq: redis::Script::new(DELETE_IF_EQ),
            incr_with_ttl: redis::Script::new(INCR_WITH_TTL),
            compare_and_set: redis::Script::new(COMPARE_AND_SET),
        }
    }
}

fn command(e: redis::RedisError) -> KvError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        KvError::Connection(e.to_string())
    } else {
        KvError::Command(e.to_string())
    }
}

fn millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis.
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(command)
    }

    #[instrument(skip(self, value), err)]
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn).await.map_err(command)
    }

    #[instrument(skip(self, value), err)]
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(command)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(command)?;
        Ok(removed > 0)
    }

    #[instrument(skip(self, expected), err)]
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .delete_if_eq
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(command)?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str, ttl_on_create: Option<Duration>) -> Result<i64, KvError> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl_on_create.map(millis).unwrap_or(0);
        self.incr_with_ttl
            .key(key)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| match e.kind() {
                redis::ErrorKind::ResponseError => KvError::NotAnInteger {
                    key: key.to_string(),
                },
                _ => command(e),
            })
    }

    #[instrument(skip(self, value), err)]
    async fn compare_and_set(
        &self,
        guard_key: &str,
        expected_guard: Option<&str>,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let written: i64 = self
            .compare_and_set
            .key(guard_key)
            .key(key)
            .arg(expected_guard.unwrap_or(""))
            .arg(value)
            .arg(ttl.map(millis).unwrap_or(0))
            .arg(if expected_guard.is_none() { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(command)?;
        Ok(written == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let mut conn = self.conn.clone();
        let ms: i64 = conn.pttl(key).await.map_err(command)?;
        // -2: missing, -1: no expiry
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }
}

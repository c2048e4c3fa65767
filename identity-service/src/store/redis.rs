use ::redis::{aio::ConnectionManager, Client};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use super::{KeyedStore, WindowAdmission};
use crate::config::RedisConfig;
use crate::services::IdentityError;

/// Prune, count, conditionally add, all inside one script so concurrent
/// callers on the same key cannot overshoot the limit.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  redis.call('PEXPIRE', key, window)
  count = count + 1
  admitted = 1
end
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = -1
if oldest[2] then
  oldest_score = tonumber(oldest[2])
end
return {admitted, count, oldest_score}
"#;

#[derive(Clone)]
pub struct RedisStore {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn new(config: &RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // ConnectionManager reconnects on its own
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

/// Redis rejects `EX 0`; sub-second TTLs round up to one second.
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KeyedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, IdentityError> {
        let mut conn = self.manager.clone();
        ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| IdentityError::Store(anyhow::anyhow!("Failed to get {}: {}", key, e)))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), IdentityError> {
        let mut conn = self.manager.clone();
        ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| IdentityError::Store(anyhow::anyhow!("Failed to set {}: {}", key, e)))
    }

    async fn delete(&self, key: &str) -> Result<(), IdentityError> {
        let mut conn = self.manager.clone();
        ::redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| IdentityError::Store(anyhow::anyhow!("Failed to delete {}: {}", key, e)))
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, IdentityError> {
        let mut conn = self.manager.clone();
        ::redis::cmd("INCRBY")
            .arg(key)
            .arg(by)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                IdentityError::Store(anyhow::anyhow!("Failed to increment {}: {}", key, e))
            })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), IdentityError> {
        let mut conn = self.manager.clone();
        ::redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_seconds(ttl))
            .query_async::<_, i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| IdentityError::Store(anyhow::anyhow!("Failed to expire {}: {}", key, e)))
    }

    async fn admit_sliding_window(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u32,
    ) -> Result<Option<WindowAdmission>, IdentityError> {
        let mut conn = self.manager.clone();
        let now_ms = now.timestamp_millis();
        let member = format!("{}-{}", now_ms, Uuid::new_v4());

        let (admitted, count, oldest): (i64, i64, i64) = ::redis::cmd("EVAL")
            .arg(SLIDING_WINDOW_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(now_ms)
            .arg(window.as_millis() as u64)
            .arg(limit)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                IdentityError::Store(anyhow::anyhow!("Sliding window script failed: {}", e))
            })?;

        Ok(Some(WindowAdmission {
            admitted: admitted == 1,
            count: u32::try_from(count).unwrap_or(u32::MAX),
            oldest: (oldest >= 0)
                .then(|| DateTime::<Utc>::from_timestamp_millis(oldest))
                .flatten(),
        }))
    }

    async fn health_check(&self) -> Result<(), IdentityError> {
        let mut conn = self.manager.clone();
        ::redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| IdentityError::Store(anyhow::anyhow!("Redis health check failed: {}", e)))
    }
}

//! Keyed TTL store shared by every component.
//!
//! No in-process lock coordinates callers: correctness relies on the
//! operations the backing store guarantees atomic (`get`, `set` with TTL,
//! `delete`, `increment`, `expire`, and optionally `admit_sliding_window`).

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::services::IdentityError;

/// Outcome of an atomic sliding-window admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowAdmission {
    pub admitted: bool,
    /// Entries in the window after the decision (including this call when admitted).
    pub count: u32,
    /// Oldest entry still inside the window.
    pub oldest: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait KeyedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, IdentityError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), IdentityError>;

    async fn delete(&self, key: &str) -> Result<(), IdentityError>;

    /// Atomically add `by` to the integer at `key` (absent counts as 0).
    async fn increment(&self, key: &str, by: i64) -> Result<i64, IdentityError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), IdentityError>;

    /// Prune, count and conditionally append in one atomic step.
    ///
    /// Stores without such a primitive return `Ok(None)`.
    async fn admit_sliding_window(
        &self,
        _key: &str,
        _now: DateTime<Utc>,
        _window: Duration,
        _limit: u32,
    ) -> Result<Option<WindowAdmission>, IdentityError> {
        Ok(None)
    }

    async fn health_check(&self) -> Result<(), IdentityError> {
        Ok(())
    }
}

/// Run a store or database call under a deadline. An elapsed deadline is
/// an error, so callers deny rather than allow.
pub async fn bounded<T, F>(
    deadline: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T, IdentityError>
where
    F: Future<Output = Result<T, IdentityError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, deadline_ms = deadline.as_millis() as u64, "Deadline exceeded");
            Err(IdentityError::Timeout(operation))
        }
    }
}

pub(crate) async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyedStore,
    key: &str,
) -> Result<Option<T>, IdentityError> {
    match store.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| IdentityError::Store(anyhow::anyhow!("Corrupt value at {}: {}", key, e))),
        None => Ok(None),
    }
}

pub(crate) async fn set_json<T: Serialize + Sync>(
    store: &dyn KeyedStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), IdentityError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| IdentityError::Internal(anyhow::anyhow!("Failed to encode value: {}", e)))?;
    store.set(key, &bytes, ttl).await
}

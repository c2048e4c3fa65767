use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{KeyedStore, WindowAdmission};
use crate::clock::{Clock, SystemClock};
use crate::services::IdentityError;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    /// Sorted millisecond timestamps for the atomic sliding window.
    Window(Vec<i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// In-process store with the same TTL semantics as the Redis adapter.
///
/// Every operation runs under one lock, so `admit_sliding_window` is exact.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|e| is_live(e, now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, IdentityError> {
        self.entries
            .lock()
            .map_err(|e| IdentityError::Store(anyhow::anyhow!("Memory store mutex poisoned: {}", e)))
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|e| !is_live(e, now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

fn is_live(entry: &Entry, now: DateTime<Utc>) -> bool {
    entry.expires_at.map_or(true, |at| at > now)
}

fn deadline(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, IdentityError> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| IdentityError::Internal(anyhow::anyhow!("TTL out of range: {}", e)))?;
    Ok(now + ttl)
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, IdentityError> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        match Self::live(&mut entries, key, now).map(|e| &e.value) {
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(Value::Window(_)) => Err(IdentityError::Store(anyhow::anyhow!(
                "Wrong value type at {}",
                key
            ))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), IdentityError> {
        let now = self.clock.now();
        let expires_at = deadline(now, ttl)?;
        self.lock()?.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value.to_vec()),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), IdentityError> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, IdentityError> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        let (current, expires_at) = match Self::live(&mut entries, key, now) {
            Some(Entry {
                value: Value::Bytes(bytes),
                expires_at,
            }) => {
                let current = std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| {
                        IdentityError::Store(anyhow::anyhow!("Value at {} is not an integer", key))
                    })?;
                (current, *expires_at)
            }
            Some(_) => {
                return Err(IdentityError::Store(anyhow::anyhow!(
                    "Wrong value type at {}",
                    key
                )))
            }
            None => (0, None),
        };

        let next = current + by;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(next.to_string().into_bytes()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), IdentityError> {
        let now = self.clock.now();
        let expires_at = deadline(now, ttl)?;
        let mut entries = self.lock()?;
        if let Some(entry) = Self::live(&mut entries, key, now) {
            entry.expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn admit_sliding_window(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u32,
    ) -> Result<Option<WindowAdmission>, IdentityError> {
        let store_now = self.clock.now();
        let window_ms = i64::try_from(window.as_millis())
            .map_err(|e| IdentityError::Internal(anyhow::anyhow!("Window out of range: {}", e)))?;
        let now_ms = now.timestamp_millis();
        let cutoff = now_ms - window_ms;

        let mut entries = self.lock()?;
        let mut stamps = match Self::live(&mut entries, key, store_now).map(|e| &e.value) {
            Some(Value::Window(stamps)) => stamps.clone(),
            Some(Value::Bytes(_)) => {
                return Err(IdentityError::Store(anyhow::anyhow!(
                    "Wrong value type at {}",
                    key
                )))
            }
            None => Vec::new(),
        };

        stamps.retain(|&ts| ts > cutoff);
        let admitted = (stamps.len() as u32) < limit;
        if admitted {
            stamps.push(now_ms);
            stamps.sort_unstable();
        }

        let admission = WindowAdmission {
            admitted,
            count: stamps.len() as u32,
            oldest: stamps
                .first()
                .and_then(|&ms| DateTime::<Utc>::from_timestamp_millis(ms)),
        };

        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Window(stamps),
                expires_at: Some(deadline(store_now, window)?),
            },
        );

        Ok(Some(admission))
    }
}

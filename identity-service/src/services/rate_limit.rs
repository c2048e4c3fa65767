use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::{metrics, IdentityError};
use crate::clock::Clock;
use crate::config::{RateLimitConfig, WindowStrategy};
use crate::models::{RateAction, RateDecision};
use crate::store::{bounded, get_json, set_json, KeyedStore};

/// Sliding-window admission control keyed by (action, identifier).
///
/// The count is taken before the current call is added, so the call that
/// would be number `limit + 1` is the first one rejected.
pub struct RateLimiter {
    store: Arc<dyn KeyedStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
    deadline: Duration,
}

fn window_key(action: &str, identifier: &str) -> String {
    format!("rate:{}:{}", action, identifier)
}

fn atomic_window_key(action: &str, identifier: &str) -> String {
    format!("rate:z:{}:{}", action, identifier)
}

/// Whole seconds until `reset_at`, at least 1.
fn retry_after(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let wait_ms = (reset_at - now).num_milliseconds().max(0) as u64;
    wait_ms.div_ceil(1000).max(1)
}

fn reset_at(oldest: Option<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    let window = ChronoDuration::milliseconds(window.as_millis() as i64);
    oldest.unwrap_or(now) + window
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn KeyedStore>,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            deadline,
        }
    }

    /// Admit or reject one call for `identifier` under `action`.
    #[tracing::instrument(skip(self, identifier, window), fields(window_seconds = window.as_secs()))]
    pub async fn check(
        &self,
        identifier: &str,
        action: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, IdentityError> {
        let now = self.clock.now();

        let decision = match self.config.strategy {
            WindowStrategy::Atomic => {
                match self.check_atomic(identifier, action, limit, window, now).await? {
                    Some(decision) => decision,
                    None => {
                        tracing::debug!("Store has no atomic window primitive, using read-filter-append");
                        self.check_best_effort(identifier, action, limit, window, now)
                            .await?
                    }
                }
            }
            WindowStrategy::BestEffort => {
                self.check_best_effort(identifier, action, limit, window, now)
                    .await?
            }
        };

        if !decision.allowed {
            metrics::rate_limited(action);
            let retry_after = retry_after(decision.reset_at, now);
            tracing::warn!(action, retry_after, "Rate limit exceeded");
            return Err(IdentityError::RateLimitExceeded { retry_after });
        }

        Ok(decision)
    }

    /// Check against the configured policy for `action`.
    pub async fn check_policy(
        &self,
        identifier: &str,
        action: RateAction,
    ) -> Result<RateDecision, IdentityError> {
        let policy = self.config.policy(action);
        self.check(identifier, action.as_str(), policy.limit, policy.window())
            .await
    }

    /// Forget every counted call for the key.
    #[tracing::instrument(skip(self, identifier))]
    pub async fn reset(&self, identifier: &str, action: &str) -> Result<(), IdentityError> {
        bounded(
            self.deadline,
            "rate_limit.reset",
            self.store.delete(&window_key(action, identifier)),
        )
        .await?;
        bounded(
            self.deadline,
            "rate_limit.reset",
            self.store.delete(&atomic_window_key(action, identifier)),
        )
        .await?;
        tracing::info!(action, "Rate limit window reset");
        Ok(())
    }

    async fn check_best_effort(
        &self,
        identifier: &str,
        action: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, IdentityError> {
        let key = window_key(action, identifier);
        let now_ms = now.timestamp_millis();
        let cutoff = now_ms - window.as_millis() as i64;

        let stored: Option<Vec<i64>> = bounded(
            self.deadline,
            "rate_limit.read_window",
            get_json(self.store.as_ref(), &key),
        )
        .await?;

        // Entries exactly `window` old are already out
        let mut stamps: Vec<i64> = stored
            .unwrap_or_default()
            .into_iter()
            .filter(|&ts| ts > cutoff)
            .collect();
        stamps.sort_unstable();

        let oldest = stamps
            .first()
            .and_then(|&ts| DateTime::<Utc>::from_timestamp_millis(ts));

        if stamps.len() as u32 >= limit {
            return Ok(RateDecision {
                allowed: false,
                remaining: 0,
                reset_at: reset_at(oldest, window, now),
            });
        }

        stamps.push(now_ms);
        bounded(
            self.deadline,
            "rate_limit.write_window",
            set_json(self.store.as_ref(), &key, &stamps, window),
        )
        .await?;

        Ok(RateDecision {
            allowed: true,
            remaining: limit - stamps.len() as u32,
            reset_at: reset_at(oldest.or(Some(now)), window, now),
        })
    }

    async fn check_atomic(
        &self,
        identifier: &str,
        action: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<RateDecision>, IdentityError> {
        let key = atomic_window_key(action, identifier);
        let admission = bounded(
            self.deadline,
            "rate_limit.admit",
            self.store.admit_sliding_window(&key, now, window, limit),
        )
        .await?;

        Ok(admission.map(|admission| RateDecision {
            allowed: admission.admitted,
            remaining: limit.saturating_sub(admission.count),
            reset_at: reset_at(admission.oldest, window, now),
        }))
    }
}

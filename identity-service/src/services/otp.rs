use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;

use super::notifier::{mask_destination, Notifier};
use super::{metrics, IdentityError};
use crate::clock::Clock;
use crate::config::OtpConfig;
use crate::models::otp::OtpHold;
use crate::models::{OtpPurpose, OtpRecord};
use crate::store::{bounded, get_json, set_json, KeyedStore};

type HmacSha256 = Hmac<Sha256>;

const GENERATION_WINDOW: Duration = Duration::from_secs(60 * 60);

/// A freshly generated code. `Debug` never prints the code.
pub struct GeneratedOtp {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for GeneratedOtp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedOtp")
            .field("code", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Issues and checks one-time codes per (identifier, purpose).
pub struct OtpService {
    store: Arc<dyn KeyedStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: OtpConfig,
    deadline: Duration,
}

struct OtpKeys {
    record: String,
    cooldown: String,
    generations: String,
    lock: String,
}

impl OtpKeys {
    fn new(identifier: &str, purpose: OtpPurpose) -> Self {
        let suffix = format!("{}:{}", purpose.as_str(), identifier);
        Self {
            record: format!("otp:{}", suffix),
            cooldown: format!("otp_cooldown:{}", suffix),
            generations: format!("otp_gen:{}", suffix),
            lock: format!("otp_lock:{}", suffix),
        }
    }
}

impl OtpService {
    pub fn new(
        store: Arc<dyn KeyedStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: OtpConfig,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            config,
            deadline,
        }
    }

    /// Create a code, store its hash and hand it to the notifier.
    ///
    /// Rejected with `OtpCooldown` right after a previous generation and
    /// with `OtpLocked` once the hourly generation budget is spent.
    #[tracing::instrument(skip(self, identifier), fields(purpose = purpose.as_str()))]
    pub async fn generate(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
    ) -> Result<GeneratedOtp, IdentityError> {
        let now = self.clock.now();
        let keys = OtpKeys::new(identifier, purpose);

        if let Some(hold) = self.active_hold(&keys.lock, now).await? {
            return Err(IdentityError::OtpLocked {
                retry_after: Some(hold.retry_after(now)),
            });
        }

        if let Some(hold) = self.active_hold(&keys.cooldown, now).await? {
            return Err(IdentityError::OtpCooldown {
                retry_after: hold.retry_after(now),
            });
        }

        let generations = self.read_counter(&keys.generations).await?;
        if generations >= i64::from(self.config.max_generations_per_hour) {
            return Err(self.lock_out(&keys, now).await?);
        }

        let code = generate_code(self.config.code_length);
        let record = OtpRecord::new(
            self.hash_code(identifier, purpose, &code)?,
            now,
            self.config.ttl_seconds,
        );
        let ttl = Duration::from_secs(self.config.ttl_seconds);

        bounded(
            self.deadline,
            "otp.store_record",
            set_json(self.store.as_ref(), &keys.record, &record, ttl),
        )
        .await?;

        self.put_hold(&keys.cooldown, now, self.config.cooldown_seconds)
            .await?;

        bounded(
            self.deadline,
            "otp.count_generation",
            self.store.increment(&keys.generations, 1),
        )
        .await?;
        bounded(
            self.deadline,
            "otp.count_generation",
            self.store.expire(&keys.generations, GENERATION_WINDOW),
        )
        .await?;

        // Best effort: the user can always ask for a resend
        let dispatch = bounded(self.deadline, "otp.dispatch", async {
            self.notifier
                .send_code(identifier, &code, purpose)
                .await
                .map_err(IdentityError::Internal)
        })
        .await;
        if let Err(e) = dispatch {
            tracing::warn!(
                destination = %mask_destination(identifier),
                error = %e,
                "Failed to dispatch OTP"
            );
        }

        metrics::otp_sent(purpose.as_str());
        tracing::info!(
            destination = %mask_destination(identifier),
            "OTP generated"
        );

        Ok(GeneratedOtp {
            code,
            expires_at: record.expires_at(),
        })
    }

    /// Check `code` against the pending record. Success consumes the record;
    /// the attempt that reaches `max_attempts` deletes it.
    #[tracing::instrument(skip(self, identifier, code), fields(purpose = purpose.as_str()))]
    pub async fn verify(
        &self,
        identifier: &str,
        code: &str,
        purpose: OtpPurpose,
    ) -> Result<(), IdentityError> {
        let now = self.clock.now();
        let keys = OtpKeys::new(identifier, purpose);
        let max_attempts = self.config.max_attempts;

        let record: Option<OtpRecord> = bounded(
            self.deadline,
            "otp.load_record",
            get_json(self.store.as_ref(), &keys.record),
        )
        .await?;

        let Some(mut record) = record else {
            metrics::otp_verification(purpose.as_str(), "expired");
            return Err(IdentityError::OtpExpired);
        };

        let Some(remaining_ttl) = record.remaining_ttl(now) else {
            self.delete_record(&keys).await?;
            metrics::otp_verification(purpose.as_str(), "expired");
            return Err(IdentityError::OtpExpired);
        };

        if record.attempts >= max_attempts {
            self.delete_record(&keys).await?;
            metrics::otp_verification(purpose.as_str(), "locked");
            return Err(IdentityError::OtpLocked { retry_after: None });
        }

        if self.code_matches(identifier, purpose, code, &record.code_hash)? {
            self.delete_record(&keys).await?;
            metrics::otp_verification(purpose.as_str(), "success");
            tracing::info!(destination = %mask_destination(identifier), "OTP verified");
            return Ok(());
        }

        record.attempts += 1;

        if record.attempts >= max_attempts {
            self.delete_record(&keys).await?;
            metrics::otp_verification(purpose.as_str(), "locked");
            tracing::warn!(
                destination = %mask_destination(identifier),
                "OTP attempts exhausted"
            );
            return Err(IdentityError::OtpLocked { retry_after: None });
        }

        // Keep the original expiry rather than extending it
        bounded(
            self.deadline,
            "otp.store_record",
            set_json(self.store.as_ref(), &keys.record, &record, remaining_ttl),
        )
        .await?;

        metrics::otp_verification(purpose.as_str(), "invalid");
        Err(IdentityError::OtpInvalid {
            remaining: max_attempts - record.attempts,
        })
    }

    async fn lock_out(
        &self,
        keys: &OtpKeys,
        now: DateTime<Utc>,
    ) -> Result<IdentityError, IdentityError> {
        let hold = self
            .put_hold(&keys.lock, now, self.config.lockout_seconds)
            .await?;
        bounded(
            self.deadline,
            "otp.reset_generations",
            self.store.delete(&keys.generations),
        )
        .await?;

        tracing::warn!(
            lockout_seconds = self.config.lockout_seconds,
            "OTP generation limit reached, locking out"
        );
        Ok(IdentityError::OtpLocked {
            retry_after: Some(hold.retry_after(now)),
        })
    }

    async fn active_hold(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OtpHold>, IdentityError> {
        let hold: Option<OtpHold> =
            bounded(self.deadline, "otp.read_hold", get_json(self.store.as_ref(), key)).await?;
        Ok(hold.filter(|h| h.until > now))
    }

    async fn put_hold(
        &self,
        key: &str,
        now: DateTime<Utc>,
        seconds: u64,
    ) -> Result<OtpHold, IdentityError> {
        let hold = OtpHold {
            until: now + ChronoDuration::seconds(seconds as i64),
        };
        bounded(
            self.deadline,
            "otp.write_hold",
            set_json(self.store.as_ref(), key, &hold, Duration::from_secs(seconds)),
        )
        .await?;
        Ok(hold)
    }

    async fn read_counter(&self, key: &str) -> Result<i64, IdentityError> {
        let raw = bounded(self.deadline, "otp.read_generations", self.store.get(key)).await?;
        match raw {
            None => Ok(0),
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| {
                    IdentityError::Store(anyhow::anyhow!("Counter at {} is not an integer", key))
                }),
        }
    }

    async fn delete_record(&self, keys: &OtpKeys) -> Result<(), IdentityError> {
        bounded(
            self.deadline,
            "otp.delete_record",
            self.store.delete(&keys.record),
        )
        .await
    }

    fn mac(&self, identifier: &str, purpose: OtpPurpose, code: &str) -> Result<HmacSha256, IdentityError> {
        let mut mac = HmacSha256::new_from_slice(self.config.hash_secret.as_bytes())
            .map_err(|e| IdentityError::Internal(anyhow::anyhow!("Invalid OTP hash key: {}", e)))?;
        mac.update(purpose.as_str().as_bytes());
        mac.update(b":");
        mac.update(identifier.as_bytes());
        mac.update(b":");
        mac.update(code.as_bytes());
        Ok(mac)
    }

    fn hash_code(&self, identifier: &str, purpose: OtpPurpose, code: &str) -> Result<String, IdentityError> {
        let mac = self.mac(identifier, purpose, code)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn code_matches(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        code: &str,
        stored_hash: &str,
    ) -> Result<bool, IdentityError> {
        let Ok(stored) = hex::decode(stored_hash) else {
            tracing::warn!("Stored OTP hash is not valid hex");
            return Ok(false);
        };
        let candidate = self.mac(identifier, purpose, code)?.finalize().into_bytes();
        Ok(candidate.as_slice().ct_eq(&stored).into())
    }
}

fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

//! One-time passcode records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// What an OTP authorizes. Keys are namespaced by purpose, so a code for
/// one purpose never verifies another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpPurpose {
    EmailVerification,
    PasswordReset,
    Login,
    SensitiveAction,
}

impl OtpPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtpPurpose::EmailVerification => "email_verification",
            OtpPurpose::PasswordReset => "password_reset",
            OtpPurpose::Login => "login",
            OtpPurpose::SensitiveAction => "sensitive_action",
        }
    }
}

/// Pending OTP stored under `otp:{purpose}:{identifier}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpRecord {
    /// Hex HMAC of the code; the code itself is never stored
    pub code_hash: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl OtpRecord {
    pub fn new(code_hash: String, created_at: DateTime<Utc>, ttl_seconds: u64) -> Self {
        Self {
            code_hash,
            attempts: 0,
            created_at,
            ttl_seconds,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(self.ttl_seconds as i64)
    }

    /// Time left before the record lapses, if any.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        (self.expires_at() - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

/// Short-lived marker for cooldown and lockout keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OtpHold {
    pub until: DateTime<Utc>,
}

impl OtpHold {
    /// Whole seconds until the hold lifts, at least 1.
    pub fn retry_after(&self, now: DateTime<Utc>) -> u64 {
        let ms = (self.until - now).num_milliseconds().max(0) as u64;
        ms.div_ceil(1000).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_ttl_counts_down() {
        let now = Utc::now();
        let record = OtpRecord::new("h".into(), now, 600);
        assert_eq!(
            record.remaining_ttl(now + Duration::seconds(100)),
            Some(std::time::Duration::from_secs(500))
        );
        assert_eq!(record.remaining_ttl(now + Duration::seconds(600)), None);
    }

    #[test]
    fn test_hold_retry_after_rounds_up() {
        let now = Utc::now();
        let hold = OtpHold {
            until: now + Duration::milliseconds(1500),
        };
        assert_eq!(hold.retry_after(now), 2);
        assert_eq!(hold.retry_after(now + Duration::seconds(10)), 1);
    }
}

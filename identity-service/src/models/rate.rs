use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RatePolicy;

/// Named actions guarded by the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateAction {
    Login,
    Register,
    PasswordReset,
    OtpSend,
    OtpVerify,
    TokenRefresh,
    AdminWrite,
}

impl RateAction {
    pub const ALL: [RateAction; 7] = [
        RateAction::Login,
        RateAction::Register,
        RateAction::PasswordReset,
        RateAction::OtpSend,
        RateAction::OtpVerify,
        RateAction::TokenRefresh,
        RateAction::AdminWrite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RateAction::Login => "login",
            RateAction::Register => "register",
            RateAction::PasswordReset => "password_reset",
            RateAction::OtpSend => "otp_send",
            RateAction::OtpVerify => "otp_verify",
            RateAction::TokenRefresh => "token_refresh",
            RateAction::AdminWrite => "admin_write",
        }
    }

    pub const fn default_policy(&self) -> RatePolicy {
        match self {
            RateAction::Login => RatePolicy::new(5, 900),
            RateAction::Register => RatePolicy::new(3, 3600),
            RateAction::PasswordReset => RatePolicy::new(3, 3600),
            RateAction::OtpSend => RatePolicy::new(5, 3600),
            RateAction::OtpVerify => RatePolicy::new(10, 900),
            RateAction::TokenRefresh => RatePolicy::new(30, 60),
            RateAction::AdminWrite => RatePolicy::new(60, 60),
        }
    }
}

/// Accepted rate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Calls still admissible in the current window.
    pub remaining: u32,
    /// When the oldest counted call leaves the window.
    pub reset_at: DateTime<Utc>,
}

//! Services layer for identity-service.
//!
//! Token rotation, one-time codes, rate limiting and permission resolution.

pub mod error;
mod jwt;
pub mod metrics;
mod notifier;
mod otp;
mod permissions;
mod rate_limit;
mod tokens;

pub use error::IdentityError;
pub use jwt::{AccessTokenClaims, JwtService, RefreshTokenClaims, TokenType};
pub use notifier::{LogNotifier, Notifier, RecordingNotifier, SentCode};
pub use otp::{GeneratedOtp, OtpService};
pub use permissions::PermissionResolver;
pub use rate_limit::RateLimiter;
pub use tokens::{TokenPair, TokenService};

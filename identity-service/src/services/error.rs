use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Token expired")]
    TokenExpired,

    /// A rotated refresh token was presented again. The whole family has
    /// been revoked (or its revocation is being retried/alerted).
    #[error("Refresh token reuse detected")]
    TokenReused,

    #[error("OTP expired or not found")]
    OtpExpired,

    #[error("Invalid OTP code ({remaining} attempts remaining)")]
    OtpInvalid { remaining: u32 },

    #[error("OTP locked")]
    OtpLocked { retry_after: Option<u64> },

    #[error("OTP requested too recently, retry in {retry_after}s")]
    OtpCooldown { retry_after: u64 },

    #[error("Rate limit exceeded, retry in {retry_after}s")]
    RateLimitExceeded { retry_after: u64 },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found")]
    NotFound,

    #[error("Store error: {0}")]
    Store(anyhow::Error),

    #[error("Database error: {0}")]
    Database(anyhow::Error),

    #[error("Deadline exceeded during {0}")]
    Timeout(&'static str),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for IdentityError {
    fn from(err: sqlx::Error) -> Self {
        IdentityError::Database(anyhow::Error::new(err))
    }
}

impl From<redis::RedisError> for IdentityError {
    fn from(err: redis::RedisError) -> Self {
        IdentityError::Store(anyhow::Error::new(err))
    }
}

impl IdentityError {
    /// Infrastructure failures: the caller must deny, never allow.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            IdentityError::Store(_)
                | IdentityError::Database(_)
                | IdentityError::Timeout(_)
                | IdentityError::Internal(_)
        )
    }
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::InvalidCredentials => {
                AppError::AuthError(anyhow::anyhow!("Invalid credentials"))
            }
            IdentityError::TokenExpired => AppError::AuthError(anyhow::anyhow!("Token expired")),
            IdentityError::TokenReused => AppError::AuthError(anyhow::anyhow!(
                "Session revoked. Please sign in again."
            )),
            IdentityError::OtpExpired => {
                AppError::BadRequest(anyhow::anyhow!("Code expired. Please request a new one."))
            }
            IdentityError::OtpInvalid { remaining } => AppError::BadRequest(anyhow::anyhow!(
                "Invalid code. {} attempts remaining.",
                remaining
            )),
            IdentityError::OtpLocked { retry_after } => AppError::TooManyRequests(
                "Too many attempts. Please request a new code later.".to_string(),
                retry_after,
            ),
            IdentityError::OtpCooldown { retry_after } => AppError::TooManyRequests(
                "Please wait before requesting another code.".to_string(),
                Some(retry_after),
            ),
            IdentityError::RateLimitExceeded { retry_after } => AppError::TooManyRequests(
                "Too many requests. Please try again later.".to_string(),
                Some(retry_after),
            ),
            IdentityError::PermissionDenied(permission) => {
                AppError::Forbidden(anyhow::anyhow!("Missing permission: {}", permission))
            }
            IdentityError::NotFound => AppError::NotFound(anyhow::anyhow!("Not found")),
            IdentityError::Store(e) => AppError::CacheError(e),
            IdentityError::Database(e) => AppError::DatabaseError(e),
            IdentityError::Timeout(_) => AppError::ServiceUnavailable,
            IdentityError::Internal(e) => AppError::InternalError(e),
        }
    }
}

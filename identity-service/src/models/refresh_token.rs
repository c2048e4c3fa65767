use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// Persisted refresh token row. Only the SHA-256 of the token value is stored.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefreshToken {
    /// Row id, also the `jti` claim of the signed token
    pub id: Uuid,

    pub subject_id: String,

    /// SHA-256 hash of the refresh token
    pub token_hash: String,

    /// Shared by every token descending from one issuance
    pub family_id: Uuid,

    pub expires_at: DateTime<Utc>,

    /// Rotated, logged out or killed with its family
    pub revoked: bool,

    pub created_at: DateTime<Utc>,
}

impl RefreshToken {
    /// Create a row for a freshly signed token value.
    pub fn new(
        id: Uuid,
        subject_id: String,
        token: &str,
        family_id: Uuid,
        issued_at: DateTime<Utc>,
        expires_in_days: i64,
    ) -> Self {
        Self {
            id,
            subject_id,
            token_hash: Self::hash_token(token),
            family_id,
            expires_at: issued_at + Duration::days(expires_in_days),
            revoked: false,
            created_at: issued_at,
        }
    }

    /// Hash a token using SHA-256
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired_at(now)
    }
}

/// Active session as shown on a "manage sessions" screen.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub token_id: Uuid,
    pub family_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<RefreshToken> for SessionInfo {
    fn from(t: RefreshToken) -> Self {
        Self {
            token_id: t.id,
            family_id: t.family_id,
            created_at: t.created_at,
            expires_at: t.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_token_creation() {
        let now = Utc::now();
        let family = Uuid::new_v4();
        let token = RefreshToken::new(
            Uuid::new_v4(),
            "user_123".to_string(),
            "token_abc",
            family,
            now,
            7,
        );

        assert_eq!(token.subject_id, "user_123");
        assert_eq!(token.family_id, family);
        assert_ne!(token.token_hash, "token_abc");
        assert_eq!(token.token_hash, RefreshToken::hash_token("token_abc"));
        assert!(token.is_active_at(now));
    }

    #[test]
    fn test_refresh_token_expiry_boundary() {
        let now = Utc::now();
        let token = RefreshToken::new(Uuid::new_v4(), "u".into(), "t", Uuid::new_v4(), now, 7);

        assert!(!token.is_expired_at(now + Duration::days(7) - Duration::seconds(1)));
        assert!(token.is_expired_at(now + Duration::days(7)));
        assert!(!token.is_active_at(now + Duration::days(8)));
    }

    #[test]
    fn test_revoked_token_is_inactive() {
        let now = Utc::now();
        let mut token = RefreshToken::new(Uuid::new_v4(), "u".into(), "t", Uuid::new_v4(), now, 7);
        token.revoked = true;
        assert!(!token.is_active_at(now));
    }
}

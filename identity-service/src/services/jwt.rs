use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fs;
use uuid::Uuid;

use super::IdentityError;
use crate::config::JwtConfig;

/// RS256 signer/verifier for access and refresh tokens.
///
/// Expiry is checked against the caller-supplied `now` rather than the
/// system clock, so the injected [`crate::clock::Clock`] stays authoritative.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_token_expiry_minutes: i64,
    refresh_token_expiry_days: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Claims for access tokens (short-lived, stateless)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Subject (principal ID)
    pub sub: String,
    pub typ: TokenType,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    pub jti: String,
}

/// Claims for refresh tokens (long-lived)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenClaims {
    /// Subject (principal ID)
    pub sub: String,
    /// Token ID (matches database record)
    pub jti: String,
    pub typ: TokenType,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
}

impl JwtService {
    /// Create a new JWT service by loading RSA keys from files
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        let private_key_pem = fs::read_to_string(&config.private_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read private key from {}: {}",
                config.private_key_path,
                e
            )
        })?;

        let public_key_pem = fs::read_to_string(&config.public_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read public key from {}: {}",
                config.public_key_path,
                e
            )
        })?;

        Self::from_pem(
            private_key_pem.as_bytes(),
            public_key_pem.as_bytes(),
            config.access_token_expiry_minutes,
            config.refresh_token_expiry_days,
        )
    }

    pub fn from_pem(
        private_key_pem: &[u8],
        public_key_pem: &[u8],
        access_token_expiry_minutes: i64,
        refresh_token_expiry_days: i64,
    ) -> Result<Self, anyhow::Error> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem)
            .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

        tracing::info!("JWT service initialized with RS256 keys");

        Ok(Self {
            encoding_key,
            decoding_key,
            access_token_expiry_minutes,
            refresh_token_expiry_days,
        })
    }

    pub fn refresh_token_expiry_days(&self) -> i64 {
        self.refresh_token_expiry_days
    }

    /// Access token expiry in seconds (for client info)
    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }

    pub fn generate_access_token(
        &self,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String, IdentityError> {
        let claims = AccessTokenClaims {
            sub: subject_id.to_string(),
            typ: TokenType::Access,
            exp: (now + Duration::minutes(self.access_token_expiry_minutes)).timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| IdentityError::Internal(anyhow::anyhow!("Failed to encode access token: {}", e)))
    }

    /// Sign a refresh token whose `jti` is the persisted row id.
    pub fn generate_refresh_token(
        &self,
        subject_id: &str,
        token_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<String, IdentityError> {
        let claims = RefreshTokenClaims {
            sub: subject_id.to_string(),
            jti: token_id.to_string(),
            typ: TokenType::Refresh,
            exp: (now + Duration::days(self.refresh_token_expiry_days)).timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| IdentityError::Internal(anyhow::anyhow!("Failed to encode refresh token: {}", e)))
    }

    pub fn validate_access_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessTokenClaims, IdentityError> {
        let claims: AccessTokenClaims = self.decode_claims(token)?;
        check_claims(claims.typ, TokenType::Access, claims.exp, now)?;
        Ok(claims)
    }

    pub fn validate_refresh_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshTokenClaims, IdentityError> {
        let claims: RefreshTokenClaims = self.decode_claims(token)?;
        check_claims(claims.typ, TokenType::Refresh, claims.exp, now)?;
        Ok(claims)
    }

    fn decode_claims<T: serde::de::DeserializeOwned>(&self, token: &str) -> Result<T, IdentityError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;

        decode::<T>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token rejected");
                IdentityError::InvalidCredentials
            })
    }
}

fn check_claims(
    actual: TokenType,
    expected: TokenType,
    exp: i64,
    now: DateTime<Utc>,
) -> Result<(), IdentityError> {
    if actual != expected {
        return Err(IdentityError::InvalidCredentials);
    }
    if now.timestamp() >= exp {
        return Err(IdentityError::TokenExpired);
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn service() -> JwtService {
        JwtService::from_pem(
            test_keys::PRIVATE_KEY.as_bytes(),
            test_keys::PUBLIC_KEY.as_bytes(),
            15,
            7,
        )
        .unwrap()
    }

    #[test]
    fn test_load_keys_from_files() {
        let mut private_file = NamedTempFile::new().unwrap();
        private_file.write_all(test_keys::PRIVATE_KEY.as_bytes()).unwrap();
        let mut public_file = NamedTempFile::new().unwrap();
        public_file.write_all(test_keys::PUBLIC_KEY.as_bytes()).unwrap();

        let config = JwtConfig {
            private_key_path: private_file.path().to_str().unwrap().to_string(),
            public_key_path: public_file.path().to_str().unwrap().to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        };

        let jwt = JwtService::new(&config).unwrap();
        assert_eq!(jwt.access_token_expiry_seconds(), 900);
    }

    #[test]
    fn test_missing_key_file_is_error() {
        let config = JwtConfig {
            private_key_path: "/nonexistent/private.pem".to_string(),
            public_key_path: "/nonexistent/public.pem".to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        };
        assert!(JwtService::new(&config).is_err());
    }

    #[test]
    fn test_access_token_round_trip() {
        let jwt = service();
        let now = Utc::now();
        let token = jwt.generate_access_token("user_1", now).unwrap();

        let claims = jwt.validate_access_token(&token, now).unwrap();
        assert_eq!(claims.sub, "user_1");
        assert_eq!(claims.typ, TokenType::Access);
        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[test]
    fn test_token_types_are_not_interchangeable() {
        let jwt = service();
        let now = Utc::now();
        let access = jwt.generate_access_token("user_1", now).unwrap();
        let refresh = jwt.generate_refresh_token("user_1", Uuid::new_v4(), now).unwrap();

        assert!(matches!(
            jwt.validate_refresh_token(&access, now),
            Err(IdentityError::InvalidCredentials)
        ));
        assert!(matches!(
            jwt.validate_access_token(&refresh, now),
            Err(IdentityError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_expiry_uses_supplied_time() {
        let jwt = service();
        let now = Utc::now();
        let token = jwt.generate_access_token("user_1", now).unwrap();

        assert!(matches!(
            jwt.validate_access_token(&token, now + Duration::minutes(15)),
            Err(IdentityError::TokenExpired)
        ));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let jwt = service();
        let now = Utc::now();
        let mut token = jwt.generate_access_token("user_1", now).unwrap();
        token.push('x');

        assert!(matches!(
            jwt.validate_access_token(&token, now),
            Err(IdentityError::InvalidCredentials)
        ));
    }
}

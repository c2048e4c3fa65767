use serde::Serialize;
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::jwt::{AccessTokenClaims, JwtService};
use super::{metrics, IdentityError};
use crate::clock::Clock;
use crate::db::RefreshTokenRepository;
use crate::models::{RefreshToken, SessionInfo};
use crate::store::bounded;

const REVOKE_ALL_MAX_SWEEPS: usize = 3;

/// Token pair returned to the client
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

/// Issues, rotates and revokes refresh-token families.
pub struct TokenService {
    jwt: JwtService,
    repo: Arc<dyn RefreshTokenRepository>,
    clock: Arc<dyn Clock>,
    deadline: Duration,
    revocation_retry: RetryConfig,
}

impl TokenService {
    pub fn new(
        jwt: JwtService,
        repo: Arc<dyn RefreshTokenRepository>,
        clock: Arc<dyn Clock>,
        deadline: Duration,
    ) -> Self {
        Self {
            jwt,
            repo,
            clock,
            deadline,
            revocation_retry: RetryConfig::default(),
        }
    }

    /// Override the backoff used when a family revocation write fails.
    pub fn with_revocation_retry(mut self, retry: RetryConfig) -> Self {
        self.revocation_retry = retry;
        self
    }

    /// Start a new family for `subject_id`.
    #[tracing::instrument(skip(self))]
    pub async fn issue_tokens(&self, subject_id: &str) -> Result<TokenPair, IdentityError> {
        let (pair, row) = self.sign_pair(subject_id, Uuid::new_v4())?;

        bounded(self.deadline, "refresh_tokens.create", self.repo.create(&row)).await?;

        metrics::tokens_issued();
        tracing::info!(family_id = %row.family_id, "Issued token pair");
        Ok(pair)
    }

    /// Exchange a refresh token for a new pair in the same family.
    ///
    /// A revoked token presented while its family is still alive is reuse:
    /// the family is revoked and `TokenReused` is returned even if that
    /// write fails.
    #[tracing::instrument(skip_all)]
    pub async fn rotate(&self, refresh_token: &str) -> Result<TokenPair, IdentityError> {
        let now = self.clock.now();
        let claims = self.jwt.validate_refresh_token(refresh_token, now)?;

        let token_hash = RefreshToken::hash_token(refresh_token);
        let row = bounded(
            self.deadline,
            "refresh_tokens.get_by_hash",
            self.repo.get_by_hash(&token_hash),
        )
        .await?
        .ok_or(IdentityError::NotFound)?;

        if row.subject_id != claims.sub || row.id.to_string() != claims.jti {
            tracing::warn!(subject_id = %claims.sub, "Refresh token claims do not match stored row");
            return Err(IdentityError::InvalidCredentials);
        }

        if row.revoked {
            return Err(self.handle_reuse(&row).await);
        }

        if row.is_expired_at(now) {
            return Err(IdentityError::TokenExpired);
        }

        let (pair, successor) = self.sign_pair(&row.subject_id, row.family_id)?;

        let rotated = bounded(
            self.deadline,
            "refresh_tokens.rotate",
            self.repo.rotate(row.id, &successor),
        )
        .await?;

        if !rotated {
            // Lost a race against another presentation of the same token.
            return Err(self.handle_reuse(&row).await);
        }

        metrics::tokens_rotated();
        tracing::info!(
            subject_id = %row.subject_id,
            family_id = %row.family_id,
            "Rotated refresh token"
        );
        Ok(pair)
    }

    /// Revoke every active session of `subject_id`. Returns how many rows
    /// changed.
    ///
    /// A rotation already past its conditional revoke can still commit its
    /// successor after the first sweep, so there is always a second one and
    /// sweeping continues while rows keep changing.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_all(&self, subject_id: &str) -> Result<u64, IdentityError> {
        let mut revoked = 0;
        for sweep in 0..REVOKE_ALL_MAX_SWEEPS {
            let changed = bounded(
                self.deadline,
                "refresh_tokens.revoke_by_subject",
                self.repo.revoke_by_subject(subject_id),
            )
            .await?;
            revoked += changed;
            if changed == 0 && sweep > 0 {
                break;
            }
        }

        tracing::info!(revoked, "Revoked all sessions");
        Ok(revoked)
    }

    pub fn validate_access(&self, access_token: &str) -> Result<AccessTokenClaims, IdentityError> {
        self.jwt.validate_access_token(access_token, self.clock.now())
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_sessions(&self, subject_id: &str) -> Result<Vec<SessionInfo>, IdentityError> {
        let rows = bounded(
            self.deadline,
            "refresh_tokens.list_active_by_subject",
            self.repo.list_active_by_subject(subject_id, self.clock.now()),
        )
        .await?;
        Ok(rows.into_iter().map(SessionInfo::from).collect())
    }

    fn sign_pair(
        &self,
        subject_id: &str,
        family_id: Uuid,
    ) -> Result<(TokenPair, RefreshToken), IdentityError> {
        let now = self.clock.now();
        let token_id = Uuid::new_v4();

        let access_token = self.jwt.generate_access_token(subject_id, now)?;
        let refresh_token = self.jwt.generate_refresh_token(subject_id, token_id, now)?;

        let row = RefreshToken::new(
            token_id,
            subject_id.to_string(),
            &refresh_token,
            family_id,
            now,
            self.jwt.refresh_token_expiry_days(),
        );

        let pair = TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.jwt.access_token_expiry_seconds(),
        };

        Ok((pair, row))
    }

    /// Revoke the family of a re-presented token and pick the error to
    /// surface. A family with nothing left to revoke is already dead, so the
    /// presentation is treated as an expired token.
    async fn handle_reuse(&self, row: &RefreshToken) -> IdentityError {
        let family_id = row.family_id;
        let repo = &self.repo;
        let deadline = self.deadline;

        let result = retry_with_backoff(&self.revocation_retry, "refresh_tokens.revoke_family", move || {
            bounded(deadline, "refresh_tokens.revoke_family", repo.revoke_family(family_id))
        })
        .await;

        match result {
            Ok(0) => {
                tracing::info!(
                    subject_id = %row.subject_id,
                    family_id = %family_id,
                    "Revoked token presented for an already revoked family"
                );
                IdentityError::TokenExpired
            }
            Ok(revoked) => {
                metrics::token_reuse_detected();
                tracing::error!(
                    security_event = "refresh_token_reuse",
                    subject_id = %row.subject_id,
                    family_id = %family_id,
                    revoked,
                    "Refresh token reuse detected, family revoked"
                );
                IdentityError::TokenReused
            }
            Err(e) => {
                metrics::token_reuse_detected();
                tracing::error!(
                    security_event = "refresh_token_reuse",
                    alert = true,
                    subject_id = %row.subject_id,
                    family_id = %family_id,
                    error = %e,
                    "Refresh token reuse detected but family revocation failed"
                );
                IdentityError::TokenReused
            }
        }
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::RefreshToken;
use crate::services::IdentityError;

/// Durable refresh-token rows.
///
/// Every state change on a row is a conditional write, so two racing
/// callers can never both move the same row out of the active state.
#[async_trait]
pub trait RefreshTokenRepository: Send + Sync {
    async fn create(&self, token: &RefreshToken) -> Result<(), IdentityError>;

    async fn get_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, IdentityError>;

    /// Revoke the row if it is still unrevoked. `false` means someone else
    /// already did.
    async fn conditional_revoke(&self, id: Uuid) -> Result<bool, IdentityError>;

    /// Conditionally revoke `old_id` and insert `successor` as one unit.
    /// Returns `false` (and inserts nothing) when `old_id` was already revoked.
    async fn rotate(&self, old_id: Uuid, successor: &RefreshToken) -> Result<bool, IdentityError>;

    async fn list_active_by_subject(
        &self,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshToken>, IdentityError>;

    /// Revoke every unrevoked row of the family; returns how many changed.
    async fn revoke_family(&self, family_id: Uuid) -> Result<u64, IdentityError>;

    /// Revoke every unrevoked row of the subject in one statement; returns
    /// how many changed.
    async fn revoke_by_subject(&self, subject_id: &str) -> Result<u64, IdentityError>;

    async fn health_check(&self) -> Result<(), IdentityError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgRefreshTokenRepository {
    pool: PgPool,
}

impl PgRefreshTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const INSERT_REFRESH_TOKEN: &str = r#"
    INSERT INTO refresh_tokens (id, subject_id, token_hash, family_id, expires_at, revoked, created_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
"#;

#[async_trait]
impl RefreshTokenRepository for PgRefreshTokenRepository {
    async fn create(&self, token: &RefreshToken) -> Result<(), IdentityError> {
        sqlx::query(INSERT_REFRESH_TOKEN)
            .bind(token.id)
            .bind(&token.subject_id)
            .bind(&token.token_hash)
            .bind(token.family_id)
            .bind(token.expires_at)
            .bind(token.revoked)
            .bind(token.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, IdentityError> {
        let row = sqlx::query_as::<_, RefreshToken>(
            "SELECT id, subject_id, token_hash, family_id, expires_at, revoked, created_at \
             FROM refresh_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn conditional_revoke(&self, id: Uuid) -> Result<bool, IdentityError> {
        let result =
            sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE id = $1 AND revoked = FALSE")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn rotate(&self, old_id: Uuid, successor: &RefreshToken) -> Result<bool, IdentityError> {
        let mut tx = self.pool.begin().await?;

        let revoked =
            sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE id = $1 AND revoked = FALSE")
                .bind(old_id)
                .execute(&mut *tx)
                .await?;

        if revoked.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(INSERT_REFRESH_TOKEN)
            .bind(successor.id)
            .bind(&successor.subject_id)
            .bind(&successor.token_hash)
            .bind(successor.family_id)
            .bind(successor.expires_at)
            .bind(successor.revoked)
            .bind(successor.created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_active_by_subject(
        &self,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshToken>, IdentityError> {
        let rows = sqlx::query_as::<_, RefreshToken>(
            "SELECT id, subject_id, token_hash, family_id, expires_at, revoked, created_at \
             FROM refresh_tokens \
             WHERE subject_id = $1 AND revoked = FALSE AND expires_at > $2 \
             ORDER BY created_at DESC",
        )
        .bind(subject_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn revoke_family(&self, family_id: Uuid) -> Result<u64, IdentityError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE family_id = $1 AND revoked = FALSE",
        )
        .bind(family_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<(), IdentityError> {
        super::health_check(&self.pool).await
    }

    async fn revoke_by_subject(&self, subject_id: &str) -> Result<u64, IdentityError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE subject_id = $1 AND revoked = FALSE",
        )
        .bind(subject_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// In-memory repository with the same conditional-write guarantees, used in
/// tests. `fail_next_family_revocations` injects write failures.
#[derive(Default)]
pub struct MemoryRefreshTokenRepository {
    rows: Mutex<HashMap<Uuid, RefreshToken>>,
    family_revocation_failures: AtomicU32,
}

impl MemoryRefreshTokenRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `revoke_family` fail.
    pub fn fail_next_family_revocations(&self, n: u32) {
        self.family_revocation_failures.store(n, Ordering::SeqCst);
    }

    /// Every row of a family, for assertions.
    pub fn family(&self, family_id: Uuid) -> Vec<RefreshToken> {
        self.rows
            .lock()
            .map(|rows| {
                rows.values()
                    .filter(|t| t.family_id == family_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, RefreshToken>>, IdentityError> {
        self.rows.lock().map_err(|e| {
            IdentityError::Database(anyhow::anyhow!("Mock repository mutex poisoned: {}", e))
        })
    }
}

#[async_trait]
impl RefreshTokenRepository for MemoryRefreshTokenRepository {
    async fn create(&self, token: &RefreshToken) -> Result<(), IdentityError> {
        let mut rows = self.lock()?;
        if rows.values().any(|t| t.token_hash == token.token_hash) {
            return Err(IdentityError::Database(anyhow::anyhow!(
                "duplicate token_hash"
            )));
        }
        rows.insert(token.id, token.clone());
        Ok(())
    }

    async fn get_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, IdentityError> {
        Ok(self
            .lock()?
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn conditional_revoke(&self, id: Uuid) -> Result<bool, IdentityError> {
        let mut rows = self.lock()?;
        match rows.get_mut(&id) {
            Some(row) if !row.revoked => {
                row.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rotate(&self, old_id: Uuid, successor: &RefreshToken) -> Result<bool, IdentityError> {
        let mut rows = self.lock()?;
        match rows.get_mut(&old_id) {
            Some(row) if !row.revoked => row.revoked = true,
            _ => return Ok(false),
        }
        rows.insert(successor.id, successor.clone());
        Ok(true)
    }

    async fn list_active_by_subject(
        &self,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshToken>, IdentityError> {
        let mut active: Vec<RefreshToken> = self
            .lock()?
            .values()
            .filter(|t| t.subject_id == subject_id && t.is_active_at(now))
            .cloned()
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active)
    }

    async fn revoke_family(&self, family_id: Uuid) -> Result<u64, IdentityError> {
        let pending = self.family_revocation_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.family_revocation_failures
                .store(pending - 1, Ordering::SeqCst);
            return Err(IdentityError::Database(anyhow::anyhow!(
                "injected family revocation failure"
            )));
        }

        let mut rows = self.lock()?;
        let mut changed = 0;
        for row in rows.values_mut().filter(|t| t.family_id == family_id) {
            if !row.revoked {
                row.revoked = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn revoke_by_subject(&self, subject_id: &str) -> Result<u64, IdentityError> {
        let mut rows = self.lock()?;
        let mut changed = 0;
        for row in rows
            .values_mut()
            .filter(|t| t.subject_id == subject_id && !t.revoked)
        {
            row.revoked = true;
            changed += 1;
        }
        Ok(changed)
    }
}

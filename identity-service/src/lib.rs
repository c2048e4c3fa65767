pub mod clock;
pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod store;

pub use services::error;

use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{ComponentConfig, IdentityConfig};
use crate::db::{PgRefreshTokenRepository, PgRoleRepository, RefreshTokenRepository, RoleRepository};
use crate::error::IdentityError;
use crate::models::{OtpPurpose, PermissionSet, Principal, RateAction, RateDecision, SessionInfo};
use crate::services::{
    AccessTokenClaims, JwtService, Notifier, OtpService, PermissionResolver, RateLimiter,
    TokenPair, TokenService,
};
use crate::store::{bounded, KeyedStore, RedisStore};

/// External collaborators, constructed once at startup and shared by every
/// component.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn KeyedStore>,
    pub refresh_tokens: Arc<dyn RefreshTokenRepository>,
    pub roles: Arc<dyn RoleRepository>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

/// The identity and abuse-prevention core behind one handle.
#[derive(Clone)]
pub struct IdentityService {
    store: Arc<dyn KeyedStore>,
    refresh_tokens: Arc<dyn RefreshTokenRepository>,
    deadline: Duration,
    tokens: Arc<TokenService>,
    otp: Arc<OtpService>,
    rate_limiter: Arc<RateLimiter>,
    permissions: Arc<PermissionResolver>,
}

impl IdentityService {
    pub fn new(jwt: JwtService, backends: Backends, config: ComponentConfig) -> Self {
        let deadline = config.store.call_timeout();

        let tokens = TokenService::new(
            jwt,
            backends.refresh_tokens.clone(),
            backends.clock.clone(),
            deadline,
        );
        let otp = OtpService::new(
            backends.store.clone(),
            backends.notifier,
            backends.clock.clone(),
            config.otp,
            deadline,
        );
        let rate_limiter = RateLimiter::new(
            backends.store.clone(),
            backends.clock.clone(),
            config.rate_limit,
            deadline,
        );
        let permissions = PermissionResolver::new(
            backends.store.clone(),
            backends.roles,
            backends.clock,
            config.permissions.cache_ttl(),
            deadline,
        );

        Self {
            store: backends.store,
            refresh_tokens: backends.refresh_tokens,
            deadline,
            tokens: Arc::new(tokens),
            otp: Arc::new(otp),
            rate_limiter: Arc::new(rate_limiter),
            permissions: Arc::new(permissions),
        }
    }

    /// Connect Redis and PostgreSQL, run migrations and wire the components.
    pub async fn connect(
        config: &IdentityConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, AppError> {
        let jwt = JwtService::new(&config.jwt).map_err(AppError::ConfigError)?;

        let store = RedisStore::new(&config.redis)
            .await
            .map_err(AppError::CacheError)?;

        let pool = db::create_pool(&config.database, config.store.call_timeout())
            .await
            .map_err(|e| AppError::DatabaseError(e.into()))?;
        db::run_migrations(&pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.into()))?;

        let backends = Backends {
            store: Arc::new(store),
            refresh_tokens: Arc::new(PgRefreshTokenRepository::new(pool.clone())),
            roles: Arc::new(PgRoleRepository::new(pool)),
            notifier,
            clock: Arc::new(SystemClock),
        };

        tracing::info!(
            strategy = ?config.rate_limit.strategy,
            "Identity service components initialized"
        );

        Ok(Self::new(jwt, backends, config.components()))
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn otp(&self) -> &OtpService {
        &self.otp
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn permissions(&self) -> &PermissionResolver {
        &self.permissions
    }

    pub async fn issue_tokens(&self, subject_id: &str) -> Result<TokenPair, IdentityError> {
        self.tokens.issue_tokens(subject_id).await
    }

    pub async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenPair, IdentityError> {
        self.tokens.rotate(refresh_token).await
    }

    /// Log the subject out everywhere.
    pub async fn revoke_session(&self, subject_id: &str) -> Result<u64, IdentityError> {
        self.tokens.revoke_all(subject_id).await
    }

    pub fn validate_access(&self, access_token: &str) -> Result<AccessTokenClaims, IdentityError> {
        self.tokens.validate_access(access_token)
    }

    pub async fn list_sessions(&self, subject_id: &str) -> Result<Vec<SessionInfo>, IdentityError> {
        self.tokens.list_sessions(subject_id).await
    }

    /// Send a code to `identifier`. The code itself only leaves through the
    /// notifier; callers get its expiry.
    pub async fn generate_otp(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
    ) -> Result<DateTime<Utc>, IdentityError> {
        Ok(self.otp.generate(identifier, purpose).await?.expires_at)
    }

    pub async fn verify_otp(
        &self,
        identifier: &str,
        code: &str,
        purpose: OtpPurpose,
    ) -> Result<(), IdentityError> {
        self.otp.verify(identifier, code, purpose).await
    }

    pub async fn check_rate(
        &self,
        identifier: &str,
        action: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, IdentityError> {
        self.rate_limiter.check(identifier, action, limit, window).await
    }

    pub async fn check_policy(
        &self,
        identifier: &str,
        action: RateAction,
    ) -> Result<RateDecision, IdentityError> {
        self.rate_limiter.check_policy(identifier, action).await
    }

    pub async fn reset_rate(&self, identifier: &str, action: &str) -> Result<(), IdentityError> {
        self.rate_limiter.reset(identifier, action).await
    }

    pub async fn resolve_permissions(
        &self,
        principal: &Principal,
    ) -> Result<PermissionSet, IdentityError> {
        self.permissions.resolve(principal).await
    }

    pub async fn require_permission(
        &self,
        principal: &Principal,
        permission: &str,
    ) -> Result<(), IdentityError> {
        self.permissions.require(principal, permission).await
    }

    pub async fn invalidate_role(&self, role_id: Uuid) -> Result<i64, IdentityError> {
        self.permissions.invalidate_role(role_id).await
    }

    /// Ping the keyed store and the relational store, each under the call
    /// deadline.
    pub async fn health_check(&self) -> Result<(), IdentityError> {
        bounded(self.deadline, "store.health_check", self.store.health_check()).await?;
        bounded(
            self.deadline,
            "database.health_check",
            self.refresh_tokens.health_check(),
        )
        .await
    }
}

//! Relational persistence: connection pool, migrations and repositories.

mod refresh_tokens;
mod roles;

pub use refresh_tokens::{
    MemoryRefreshTokenRepository, PgRefreshTokenRepository, RefreshTokenRepository,
};
pub use roles::{MemoryRoleRepository, PgRoleRepository, RoleRepository};

use crate::config::DatabaseConfig;
use crate::services::IdentityError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Connect the PostgreSQL pool. `acquire_timeout` is the per-call deadline:
/// a starved pool fails the call instead of queueing it.
pub async fn create_pool(
    config: &DatabaseConfig,
    acquire_timeout: Duration,
) -> Result<PgPool, sqlx::Error> {
    tracing::info!(
        max_connections = config.max_connections,
        acquire_timeout_ms = acquire_timeout.as_millis() as u64,
        "Connecting to PostgreSQL"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(acquire_timeout)
        .idle_timeout(Duration::from_secs(600))
        .connect(&config.url)
        .await?;

    Ok(pool)
}

/// Apply the refresh-token and role schema.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Identity schema up to date");
    Ok(())
}

pub async fn health_check(pool: &PgPool) -> Result<(), IdentityError> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_create_pool_and_migrate() {
        let config = DatabaseConfig {
            url: "postgres://localhost/identity_test".to_string(),
            max_connections: 5,
            min_connections: 1,
        };

        let pool = create_pool(&config, Duration::from_secs(2)).await.unwrap();
        run_migrations(&pool).await.unwrap();
        health_check(&pool).await.unwrap();
    }
}

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::{PermissionOverrides, Role};
use crate::services::IdentityError;

/// Read side of roles, permissions and per-principal overrides.
#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, IdentityError>;

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<String>, IdentityError>;

    /// The full permission catalogue.
    async fn all_permission_codes(&self) -> Result<Vec<String>, IdentityError>;

    async fn principal_overrides(
        &self,
        principal_id: &str,
    ) -> Result<PermissionOverrides, IdentityError>;
}

#[derive(Clone)]
pub struct PgRoleRepository {
    pool: PgPool,
}

impl PgRoleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoleRepository for PgRoleRepository {
    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, IdentityError> {
        let role = sqlx::query_as::<_, Role>(
            "SELECT role_id, role_label, is_superuser FROM roles WHERE role_id = $1",
        )
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(role)
    }

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<String>, IdentityError> {
        let codes = sqlx::query_scalar::<_, String>(
            "SELECT permission_code FROM role_permissions WHERE role_id = $1",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(codes)
    }

    async fn all_permission_codes(&self) -> Result<Vec<String>, IdentityError> {
        let codes = sqlx::query_scalar::<_, String>("SELECT code FROM permissions ORDER BY code")
            .fetch_all(&self.pool)
            .await?;
        Ok(codes)
    }

    async fn principal_overrides(
        &self,
        principal_id: &str,
    ) -> Result<PermissionOverrides, IdentityError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT permission_code, effect FROM principal_permission_overrides WHERE principal_id = $1",
        )
        .bind(principal_id)
        .fetch_all(&self.pool)
        .await?;

        let mut overrides = PermissionOverrides::default();
        for (code, effect) in rows {
            match effect.as_str() {
                "add" => overrides.add.push(code),
                "remove" => overrides.remove.push(code),
                other => {
                    tracing::warn!(principal_id, effect = other, "Unknown override effect ignored")
                }
            }
        }
        Ok(overrides)
    }
}

#[derive(Default)]
struct Catalogue {
    permissions: Vec<String>,
    roles: HashMap<Uuid, (Role, Vec<String>)>,
    overrides: HashMap<String, PermissionOverrides>,
}

/// In-memory role data for tests and local runs.
#[derive(Default)]
pub struct MemoryRoleRepository {
    catalogue: Mutex<Catalogue>,
}

impl MemoryRoleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_permission(&self, code: &str) {
        if let Ok(mut c) = self.catalogue.lock() {
            if !c.permissions.iter().any(|p| p == code) {
                c.permissions.push(code.to_string());
            }
        }
    }

    /// Insert or replace a role and its base permissions.
    pub fn put_role(&self, role: Role, permissions: &[&str]) {
        for code in permissions {
            self.add_permission(code);
        }
        if let Ok(mut c) = self.catalogue.lock() {
            let codes = permissions.iter().map(|p| p.to_string()).collect();
            c.roles.insert(role.role_id, (role, codes));
        }
    }

    pub fn set_overrides(&self, principal_id: &str, overrides: PermissionOverrides) {
        if let Ok(mut c) = self.catalogue.lock() {
            c.overrides.insert(principal_id.to_string(), overrides);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Catalogue>, IdentityError> {
        self.catalogue.lock().map_err(|e| {
            IdentityError::Database(anyhow::anyhow!("Mock role repository mutex poisoned: {}", e))
        })
    }
}

#[async_trait]
impl RoleRepository for MemoryRoleRepository {
    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, IdentityError> {
        Ok(self.lock()?.roles.get(&role_id).map(|(role, _)| role.clone()))
    }

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<String>, IdentityError> {
        Ok(self
            .lock()?
            .roles
            .get(&role_id)
            .map(|(_, codes)| codes.clone())
            .unwrap_or_default())
    }

    async fn all_permission_codes(&self) -> Result<Vec<String>, IdentityError> {
        Ok(self.lock()?.permissions.clone())
    }

    async fn principal_overrides(
        &self,
        principal_id: &str,
    ) -> Result<PermissionOverrides, IdentityError> {
        Ok(self
            .lock()?
            .overrides
            .get(principal_id)
            .cloned()
            .unwrap_or_default())
    }
}

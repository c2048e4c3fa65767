use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{metrics, IdentityError};
use crate::clock::Clock;
use crate::db::RoleRepository;
use crate::models::{PermissionCacheEntry, PermissionSet, Principal, PrincipalKind};
use crate::store::{bounded, set_json, KeyedStore};

const WILDCARD: &str = "*";

fn cache_key(principal_id: &str) -> String {
    format!("perm:{}", principal_id)
}

fn version_key(role_id: Uuid) -> String {
    format!("role_version:{}", role_id)
}

/// Computes effective permission sets and caches them against a per-role
/// version counter. Bumping the counter is the only invalidation; stale
/// entries are replaced the next time they are read.
pub struct PermissionResolver {
    store: Arc<dyn KeyedStore>,
    roles: Arc<dyn RoleRepository>,
    clock: Arc<dyn Clock>,
    cache_ttl: Duration,
    deadline: Duration,
}

impl PermissionResolver {
    pub fn new(
        store: Arc<dyn KeyedStore>,
        roles: Arc<dyn RoleRepository>,
        clock: Arc<dyn Clock>,
        cache_ttl: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            roles,
            clock,
            cache_ttl,
            deadline,
        }
    }

    #[tracing::instrument(skip(self, principal), fields(principal_id = %principal.id))]
    pub async fn resolve(&self, principal: &Principal) -> Result<PermissionSet, IdentityError> {
        let role_id = match principal.kind {
            PrincipalKind::Customer => return Ok(PermissionSet::customer()),
            PrincipalKind::Staff { role_id } => role_id,
        };

        // Read the version first: a bump racing with the computation below
        // leaves the new entry stale instead of wrongly current.
        let version = self.current_version(role_id).await?;

        if let Some(entry) = self.cached(&principal.id).await? {
            if entry.role_id == role_id && entry.role_version == version {
                metrics::permission_cache(true);
                return Ok(entry.permissions);
            }
            tracing::debug!(
                %role_id,
                cached_version = entry.role_version,
                current_version = version,
                "Permission cache entry is stale"
            );
        }
        metrics::permission_cache(false);

        let permissions = self.compute(&principal.id, role_id).await?;

        let entry = PermissionCacheEntry {
            principal_id: principal.id.clone(),
            role_id,
            role_version: version,
            permissions,
            cached_at: self.clock.now(),
        };

        // A failed cache write costs a recompute next time, nothing more
        if let Err(e) = bounded(
            self.deadline,
            "permissions.write_cache",
            set_json(
                self.store.as_ref(),
                &cache_key(&principal.id),
                &entry,
                self.cache_ttl,
            ),
        )
        .await
        {
            tracing::warn!(error = %e, "Failed to cache permission set");
        }

        Ok(entry.permissions)
    }

    /// Bump the role's version so every cached set built from it goes stale.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate_role(&self, role_id: Uuid) -> Result<i64, IdentityError> {
        let version = bounded(
            self.deadline,
            "permissions.bump_version",
            self.store.increment(&version_key(role_id), 1),
        )
        .await?;
        tracing::info!(%role_id, version, "Role permissions invalidated");
        Ok(version)
    }

    /// `PermissionDenied` unless the principal holds `permission`.
    pub async fn require(
        &self,
        principal: &Principal,
        permission: &str,
    ) -> Result<(), IdentityError> {
        if self.resolve(principal).await?.contains(permission) {
            Ok(())
        } else {
            tracing::warn!(principal_id = %principal.id, permission, "Permission denied");
            Err(IdentityError::PermissionDenied(permission.to_string()))
        }
    }

    async fn current_version(&self, role_id: Uuid) -> Result<i64, IdentityError> {
        let raw = bounded(
            self.deadline,
            "permissions.read_version",
            self.store.get(&version_key(role_id)),
        )
        .await?;

        match raw {
            None => Ok(0),
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| {
                    IdentityError::Store(anyhow::anyhow!("Role version for {} is not an integer", role_id))
                }),
        }
    }

    async fn cached(&self, principal_id: &str) -> Result<Option<PermissionCacheEntry>, IdentityError> {
        let raw = bounded(
            self.deadline,
            "permissions.read_cache",
            self.store.get(&cache_key(principal_id)),
        )
        .await?;

        Ok(raw.and_then(|bytes| match serde_json::from_slice(&bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable permission cache entry");
                None
            }
        }))
    }

    async fn compute(&self, principal_id: &str, role_id: Uuid) -> Result<PermissionSet, IdentityError> {
        let role = bounded(self.deadline, "roles.find_role", self.roles.find_role(role_id))
            .await?
            .ok_or_else(|| {
                tracing::warn!(%role_id, "Principal references unknown role");
                IdentityError::NotFound
            })?;

        // The only place a superuser grant is turned into concrete codes
        if role.is_superuser {
            let all = bounded(
                self.deadline,
                "roles.all_permission_codes",
                self.roles.all_permission_codes(),
            )
            .await?;
            return Ok(strip_wildcard(all).collect());
        }

        let base = bounded(
            self.deadline,
            "roles.role_permissions",
            self.roles.role_permissions(role_id),
        )
        .await?;
        let mut overrides = bounded(
            self.deadline,
            "roles.principal_overrides",
            self.roles.principal_overrides(principal_id),
        )
        .await?;
        overrides.add = strip_wildcard(std::mem::take(&mut overrides.add)).collect();

        Ok(PermissionSet::with_overrides(strip_wildcard(base), &overrides))
    }
}

fn strip_wildcard(codes: Vec<String>) -> impl Iterator<Item = String> {
    codes.into_iter().filter(|code| {
        if code == WILDCARD {
            tracing::warn!("Ignoring literal wildcard permission code");
            false
        } else {
            true
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::MemoryRoleRepository;
    use crate::models::{PermissionOverrides, Role};
    use crate::store::MemoryStore;

    struct Harness {
        resolver: PermissionResolver,
        store: Arc<MemoryStore>,
        roles: Arc<MemoryRoleRepository>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let roles = Arc::new(MemoryRoleRepository::new());
        let resolver = PermissionResolver::new(
            store.clone(),
            roles.clone(),
            clock,
            Duration::from_secs(300),
            Duration::from_secs(1),
        );
        Harness {
            resolver,
            store,
            roles,
        }
    }

    fn role(is_superuser: bool) -> Role {
        Role {
            role_id: Uuid::new_v4(),
            role_label: if is_superuser { "owner" } else { "support" }.to_string(),
            is_superuser,
        }
    }

    #[tokio::test]
    async fn test_customer_bypasses_cache() {
        let h = harness();
        let set = h.resolver.resolve(&Principal::customer("c1")).await.unwrap();

        assert_eq!(set, PermissionSet::customer());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_superuser_expands_to_catalogue_without_wildcard() {
        let h = harness();
        h.roles.put_role(role(false), &["orders:read", "orders:refund"]);
        h.roles.add_permission("catalog:write");
        h.roles.add_permission(WILDCARD);
        let owner = role(true);
        h.roles.put_role(owner.clone(), &[]);

        let set = h
            .resolver
            .resolve(&Principal::staff("s1", owner.role_id))
            .await
            .unwrap();

        assert_eq!(set.len(), 3);
        assert!(set.contains("catalog:write"));
        assert!(!set.contains(WILDCARD));
    }

    #[tokio::test]
    async fn test_overrides_applied() {
        let h = harness();
        let support = role(false);
        h.roles.put_role(support.clone(), &["orders:read", "orders:refund"]);
        h.roles.set_overrides(
            "s1",
            PermissionOverrides {
                add: vec!["catalog:write".to_string(), WILDCARD.to_string()],
                remove: vec!["orders:refund".to_string()],
            },
        );

        let set = h
            .resolver
            .resolve(&Principal::staff("s1", support.role_id))
            .await
            .unwrap();
        let codes: Vec<&str> = set.iter().collect();
        assert_eq!(codes, vec!["catalog:write", "orders:read"]);
    }

    #[tokio::test]
    async fn test_cached_until_role_version_bumped() {
        let h = harness();
        let support = role(false);
        h.roles.put_role(support.clone(), &["orders:read"]);
        let principal = Principal::staff("s1", support.role_id);

        h.resolver.resolve(&principal).await.unwrap();
        h.roles.put_role(support.clone(), &["orders:read", "orders:refund"]);

        // Served from cache: the role edit is not visible yet
        assert!(!h.resolver.resolve(&principal).await.unwrap().contains("orders:refund"));

        assert_eq!(h.resolver.invalidate_role(support.role_id).await.unwrap(), 1);
        assert!(h.resolver.resolve(&principal).await.unwrap().contains("orders:refund"));
    }

    #[tokio::test]
    async fn test_unreadable_cache_entry_is_a_miss() {
        let h = harness();
        let support = role(false);
        h.roles.put_role(support.clone(), &["orders:read"]);
        h.store
            .set("perm:s1", b"{broken", Duration::from_secs(60))
            .await
            .unwrap();

        let set = h
            .resolver
            .resolve(&Principal::staff("s1", support.role_id))
            .await
            .unwrap();
        assert!(set.contains("orders:read"));
    }

    #[tokio::test]
    async fn test_unknown_role_is_not_found() {
        let h = harness();
        let result = h
            .resolver
            .resolve(&Principal::staff("s1", Uuid::new_v4()))
            .await;
        assert!(matches!(result, Err(IdentityError::NotFound)));
    }

    #[tokio::test]
    async fn test_require() {
        let h = harness();
        let customer = Principal::customer("c1");

        assert!(h.resolver.require(&customer, "catalog:read").await.is_ok());
        assert!(matches!(
            h.resolver.require(&customer, "orders:refund").await,
            Err(IdentityError::PermissionDenied(p)) if p == "orders:refund"
        ));
    }
}

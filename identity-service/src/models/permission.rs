//! Roles, principals and resolved permission sets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Fixed grant for plain customers. Never cached, never configurable.
pub const CUSTOMER_PERMISSIONS: &[&str] = &[
    "cart:manage",
    "catalog:read",
    "orders:create",
    "orders:read_own",
    "profile:manage",
];

/// Role row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub role_id: Uuid,
    pub role_label: String,
    /// Grants every permission in the catalogue.
    pub is_superuser: bool,
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub kind: PrincipalKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrincipalKind {
    Customer,
    Staff { role_id: Uuid },
}

impl Principal {
    pub fn customer(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: PrincipalKind::Customer,
        }
    }

    pub fn staff(id: impl Into<String>, role_id: Uuid) -> Self {
        Self {
            id: id.into(),
            kind: PrincipalKind::Staff { role_id },
        }
    }
}

/// Per-principal adjustments on top of the role's base permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionOverrides {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

/// Concrete, deduplicated permission codes. Never contains a wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    pub fn contains(&self, permission: &str) -> bool {
        self.0.contains(permission)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn customer() -> Self {
        CUSTOMER_PERMISSIONS.iter().map(|p| p.to_string()).collect()
    }

    /// Base set with overrides applied: removals win over additions.
    pub fn with_overrides(base: impl IntoIterator<Item = String>, overrides: &PermissionOverrides) -> Self {
        let mut set: BTreeSet<String> = base.into_iter().collect();
        set.extend(overrides.add.iter().cloned());
        for removed in &overrides.remove {
            set.remove(removed);
        }
        Self(set)
    }
}

impl FromIterator<String> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Cached resolution stored under `perm:{principal_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionCacheEntry {
    pub principal_id: String,
    pub role_id: Uuid,
    /// Role version observed before the set was computed.
    pub role_version: i64,
    pub permissions: PermissionSet,
    pub cached_at: DateTime<Utc>,
}

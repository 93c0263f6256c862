//! Tenant lifecycle, service tiers, and the tenant directory.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use clarion_core::error::{AuthzError, ClarionResult};
use clarion_core::types::TenantStatus;

/// Service tier controlling default limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantTier {
    Free,
    Team,
    Business,
    Enterprise,
}

/// Numeric resource limits for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantLimits {
    pub max_users: u32,
    pub max_agents: u32,
    pub max_managers: u32,
    pub max_calls_per_month: u64,
    pub max_storage_bytes: u64,
}

/// A customer account sharing the deployment with others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    /// Immutable after creation.
    pub slug: String,
    pub display_name: String,
    pub status: TenantStatus,
    pub tier: TenantTier,
    pub limits: TenantLimits,
    pub features: Vec<String>,
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Tenant directory backed by DashMap, indexed by id with a slug index.
pub struct TenantDirectory {
    tenants: DashMap<Uuid, Tenant>,
    slugs: DashMap<String, Uuid>,
}

impl Default for TenantDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantDirectory {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
            slugs: DashMap::new(),
        }
    }

    /// Create a tenant in `Pending` status with tier-appropriate limits.
    /// The slug is normalized to lowercase alphanumerics and hyphens and
    /// is immutable afterward.
    pub fn create(&self, slug: &str, display_name: &str, tier: TenantTier) -> ClarionResult<Tenant> {
        let normalized = normalize_slug(slug);
        if normalized.is_empty() {
            return Err(AuthzError::InvalidSlug(slug.to_string()));
        }
        let slug = normalized;

        let id = Uuid::new_v4();
        match self.slugs.entry(slug.clone()) {
            Entry::Occupied(_) => return Err(AuthzError::SlugInUse(slug)),
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }

        let now = Utc::now();
        let tenant = Tenant {
            id,
            slug: slug.clone(),
            display_name: display_name.to_string(),
            status: TenantStatus::Pending,
            tier,
            limits: Self::tier_limits(tier),
            features: Vec::new(),
            settings: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };

        info!(tenant_id = %tenant.id, slug = %slug, tier = ?tier, "Tenant created");
        self.tenants.insert(id, tenant.clone());
        Ok(tenant)
    }

    pub fn get(&self, id: Uuid) -> Option<Tenant> {
        self.tenants.get(&id).map(|e| e.value().clone())
    }

    pub fn get_by_slug(&self, slug: &str) -> Option<Tenant> {
        let id = self.slugs.get(slug)?;
        self.get(*id)
    }

    /// List all tenants. Callers reach this only through the gate's
    /// privileged super-admin path.
    pub fn list(&self) -> Vec<Tenant> {
        self.tenants.iter().map(|e| e.value().clone()).collect()
    }

    /// Activate a pending (or suspended) tenant.
    pub fn activate(&self, id: Uuid) -> ClarionResult<Tenant> {
        self.transition(id, TenantStatus::Active, |from| {
            matches!(from, TenantStatus::Pending | TenantStatus::Suspended)
        })
    }

    /// Suspend an active tenant (billing hold, abuse, ...). Reversible.
    pub fn suspend(&self, id: Uuid) -> ClarionResult<Tenant> {
        self.transition(id, TenantStatus::Suspended, |from| {
            matches!(from, TenantStatus::Active)
        })
    }

    /// Disable a tenant. Terminal: a disabled tenant never comes back and
    /// accepts no gated operation.
    pub fn disable(&self, id: Uuid) -> ClarionResult<Tenant> {
        self.transition(id, TenantStatus::Disabled, |from| {
            !matches!(from, TenantStatus::Disabled)
        })
    }

    fn transition(
        &self,
        id: Uuid,
        to: TenantStatus,
        allowed: impl Fn(TenantStatus) -> bool,
    ) -> ClarionResult<Tenant> {
        let mut entry = self
            .tenants
            .get_mut(&id)
            .ok_or_else(|| AuthzError::TenantNotFound(id.to_string()))?;
        if !allowed(entry.status) {
            return Err(AuthzError::InvalidTransition(format!(
                "tenant '{}': {} -> {}",
                entry.slug, entry.status, to
            )));
        }
        entry.status = to;
        entry.updated_at = Utc::now();
        info!(tenant_id = %id, slug = %entry.slug, status = %to, "Tenant status changed");
        Ok(entry.clone())
    }

    /// Add a coarse feature key to the tenant's feature set.
    pub fn enable_feature(&self, id: Uuid, feature: &str) -> ClarionResult<()> {
        let mut entry = self
            .tenants
            .get_mut(&id)
            .ok_or_else(|| AuthzError::TenantNotFound(id.to_string()))?;
        if !entry.features.iter().any(|f| f == feature) {
            entry.features.push(feature.to_string());
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Default limits for a tier.
    pub fn tier_limits(tier: TenantTier) -> TenantLimits {
        match tier {
            TenantTier::Free => TenantLimits {
                max_users: 5,
                max_agents: 3,
                max_managers: 1,
                max_calls_per_month: 200,
                max_storage_bytes: 1 << 30,
            },
            TenantTier::Team => TenantLimits {
                max_users: 25,
                max_agents: 20,
                max_managers: 5,
                max_calls_per_month: 5_000,
                max_storage_bytes: 50 << 30,
            },
            TenantTier::Business => TenantLimits {
                max_users: 200,
                max_agents: 150,
                max_managers: 40,
                max_calls_per_month: 50_000,
                max_storage_bytes: 500 << 30,
            },
            TenantTier::Enterprise => TenantLimits {
                max_users: u32::MAX,
                max_agents: u32::MAX,
                max_managers: u32::MAX,
                max_calls_per_month: u64::MAX,
                max_storage_bytes: u64::MAX,
            },
        }
    }
}

fn normalize_slug(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

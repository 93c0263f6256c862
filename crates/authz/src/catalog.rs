//! Permission catalog: the hard-coded role matrix plus per-tenant
//! override grants. Deny by default. Overrides are additive only --
//! revocation is the absence of a grant, never a negative grant.

use std::collections::HashSet;

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use clarion_core::types::{Grant, Role};

use crate::context::RequestContext;

/// Result of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    Deny { resource: String, action: String },
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allow)
    }
}

/// Role -> grant catalog with per-tenant additive overrides.
pub struct PermissionCatalog {
    /// (tenant, role) -> grants beyond the default matrix.
    overrides: DashMap<(Uuid, Role), HashSet<Grant>>,
}

impl Default for PermissionCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionCatalog {
    pub fn new() -> Self {
        Self {
            overrides: DashMap::new(),
        }
    }

    /// The default grant set for a role. Roles are enumerated
    /// independently, never derived from one another.
    pub fn defaults(role: Role) -> HashSet<Grant> {
        let g = Grant::new;
        match role {
            Role::SuperAdmin => HashSet::from([g("*", "*")]),
            Role::TenantAdmin => HashSet::from([
                g("organization", "*"),
                g("user", "*"),
                g("call", "*"),
                g("evaluation", "*"),
                g("analytics", "read"),
                g("analytics", "create"),
                g("report", "read"),
                g("report", "create"),
                g("settings", "read"),
                g("settings", "update"),
                g("department", "*"),
                g("team", "*"),
            ]),
            Role::Manager => HashSet::from([
                g("organization", "read"),
                g("agent", "create"),
                g("agent", "read"),
                g("agent", "update"),
                g("user", "read"),
                g("call", "*"),
                g("evaluation", "*"),
                g("analytics", "read"),
                g("report", "read"),
                g("report", "create"),
                g("department", "read"),
                g("team", "read"),
                g("team", "update"),
            ]),
            Role::Agent => HashSet::from([
                g("organization", "read"),
                g("user", "read_own"),
                g("call", "read"),
                g("analytics", "read"),
                g("department", "read"),
                g("team", "read"),
            ]),
            // Row-level scoping to assigned entities is expressed in the
            // caller's query predicate, not here.
            Role::Viewer => HashSet::from([g("*", "read")]),
        }
    }

    /// Add a tenant-specific grant on top of the defaults.
    pub fn grant_override(&self, tenant_id: Uuid, role: Role, grant: Grant) {
        info!(tenant_id = %tenant_id, role = %role, grant = %grant, "Permission override granted");
        self.overrides
            .entry((tenant_id, role))
            .or_default()
            .insert(grant);
    }

    /// Remove a previously added override row. Defaults cannot be revoked.
    /// Returns `true` when the row existed.
    pub fn revoke_override(&self, tenant_id: Uuid, role: Role, grant: &Grant) -> bool {
        self.overrides
            .get_mut(&(tenant_id, role))
            .map(|mut set| set.remove(grant))
            .unwrap_or(false)
    }

    /// The effective permission set: defaults unioned with the tenant's
    /// override rows for this role.
    pub fn resolve(&self, tenant_id: Uuid, role: Role) -> HashSet<Grant> {
        let mut grants = Self::defaults(role);
        if let Some(extra) = self.overrides.get(&(tenant_id, role)) {
            grants.extend(extra.iter().cloned());
        }
        grants
    }

    /// Check a (resource, action) against the context's effective set.
    /// Deny by default; a deny is routine and logged at debug only.
    pub fn check(&self, ctx: &RequestContext, resource: &str, action: &str) -> AccessDecision {
        if ctx.allows(resource, action) {
            AccessDecision::Allow
        } else {
            debug!(
                tenant_id = %ctx.tenant_id(),
                principal_id = %ctx.principal_id(),
                role = %ctx.role(),
                resource,
                action,
                "Access denied"
            );
            AccessDecision::Deny {
                resource: resource.to_string(),
                action: action.to_string(),
            }
        }
    }
}

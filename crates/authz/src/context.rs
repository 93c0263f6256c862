//! Request-scoped authorization context.
//!
//! A `RequestContext` is built once per request, passed explicitly to
//! every downstream call, and discarded at request end. It is never
//! recovered from ambient state: no global, thread-local, or
//! pooled-connection slot holds one, so pooled or work-stealing
//! execution cannot bleed one request's tenant into another's.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use clarion_core::error::{AuthzError, ClarionResult};
use clarion_core::types::{Grant, Role, TenantStatus};

use crate::catalog::PermissionCatalog;
use crate::tenancy::TenantDirectory;

/// Immutable request-scoped {tenant, principal, role, permission set}.
/// Fields are private; there is no mutation API.
#[derive(Debug, Clone)]
pub struct RequestContext {
    tenant_id: Uuid,
    tenant_slug: String,
    principal_id: Uuid,
    role: Role,
    permissions: HashSet<Grant>,
    issued_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn tenant_slug(&self) -> &str {
        &self.tenant_slug
    }

    pub fn principal_id(&self) -> Uuid {
        self.principal_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn permissions(&self) -> &HashSet<Grant> {
        &self.permissions
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Whether the effective permission set covers (resource, action).
    pub fn allows(&self, resource: &str, action: &str) -> bool {
        self.permissions
            .iter()
            .any(|grant| grant.covers(resource, action))
    }

    /// `allows` as a result, for use with `?` on enforcement paths.
    pub fn require(&self, resource: &str, action: &str) -> ClarionResult<()> {
        if self.allows(resource, action) {
            Ok(())
        } else {
            Err(AuthzError::PermissionDenied {
                resource: resource.to_string(),
                action: action.to_string(),
            })
        }
    }
}

/// Builds request contexts from the tenant directory and the catalog.
pub struct ContextBuilder {
    tenants: Arc<TenantDirectory>,
    catalog: Arc<PermissionCatalog>,
}

impl ContextBuilder {
    pub fn new(tenants: Arc<TenantDirectory>, catalog: Arc<PermissionCatalog>) -> Self {
        Self { tenants, catalog }
    }

    /// Assemble the context for one request. Fails fast on a suspended,
    /// disabled, or still-pending tenant before any permission work, and
    /// distinguishes that from an unknown tenant.
    pub fn build(
        &self,
        tenant_slug: &str,
        principal_id: Uuid,
        role: Role,
    ) -> ClarionResult<RequestContext> {
        let tenant = self
            .tenants
            .get_by_slug(tenant_slug)
            .ok_or_else(|| AuthzError::TenantNotFound(tenant_slug.to_string()))?;

        if tenant.status != TenantStatus::Active {
            return Err(AuthzError::TenantUnavailable {
                slug: tenant.slug,
                status: tenant.status,
            });
        }

        let permissions = self.catalog.resolve(tenant.id, role);
        debug!(
            tenant_id = %tenant.id,
            principal_id = %principal_id,
            role = %role,
            grants = permissions.len(),
            "Request context built"
        );

        Ok(RequestContext {
            tenant_id: tenant.id,
            tenant_slug: tenant.slug,
            principal_id,
            role,
            permissions,
            issued_at: Utc::now(),
        })
    }
}

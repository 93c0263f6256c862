//! The isolation gate: the single entry point for tenant-scoped storage.
//!
//! A query or mutation can only be constructed from a `RequestContext`,
//! which stamps the tenant id into the value at construction. There is
//! no unscoped constructor, so "forgot to scope the query" is not a code
//! path — the closest remaining defect, pairing a scoped value with a
//! different request's context, is caught and reported as an
//! `IsolationViolation` rather than returning empty results.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use clarion_core::error::{AuthzError, ClarionResult};
use clarion_core::types::{Role, TenantStatus};

use crate::audit::AuditRecorder;
use crate::context::RequestContext;
use crate::tenancy::{Tenant, TenantDirectory};

/// Every persisted tenant-scoped entity kind, statically enumerated.
/// A new persisted kind means a new variant here; the exhaustiveness
/// test below refuses to let one go unlisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopedEntity {
    Organization,
    User,
    Call,
    Evaluation,
    Report,
    Department,
    Team,
}

impl ScopedEntity {
    pub const ALL: [ScopedEntity; 7] = [
        ScopedEntity::Organization,
        ScopedEntity::User,
        ScopedEntity::Call,
        ScopedEntity::Evaluation,
        ScopedEntity::Report,
        ScopedEntity::Department,
        ScopedEntity::Team,
    ];

    /// Resource name used in permission checks and audit records.
    pub fn resource(&self) -> &'static str {
        match self {
            ScopedEntity::Organization => "organization",
            ScopedEntity::User => "user",
            ScopedEntity::Call => "call",
            ScopedEntity::Evaluation => "evaluation",
            ScopedEntity::Report => "report",
            ScopedEntity::Department => "department",
            ScopedEntity::Team => "team",
        }
    }
}

type Predicate = Box<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

/// A read constrained to one tenant. The tenant id is stamped in at
/// construction and not settable afterwards.
pub struct ScopedQuery {
    tenant_id: Uuid,
    entity: ScopedEntity,
    row_id: Option<Uuid>,
    predicate: Option<Predicate>,
}

impl ScopedQuery {
    /// All rows of one entity kind in the context's tenant.
    pub fn all(ctx: &RequestContext, entity: ScopedEntity) -> Self {
        Self {
            tenant_id: ctx.tenant_id(),
            entity,
            row_id: None,
            predicate: None,
        }
    }

    /// A single row by id.
    pub fn by_id(ctx: &RequestContext, entity: ScopedEntity, row_id: Uuid) -> Self {
        Self {
            row_id: Some(row_id),
            ..Self::all(ctx, entity)
        }
    }

    /// Narrow the result set with a document predicate. This is where
    /// callers express row-level scoping (e.g. a viewer's assignments).
    pub fn filtered(
        mut self,
        predicate: impl Fn(&serde_json::Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub fn entity(&self) -> ScopedEntity {
        self.entity
    }
}

enum MutationOp {
    Insert(serde_json::Value),
    Update(serde_json::Value),
    Delete,
}

impl MutationOp {
    fn action(&self) -> &'static str {
        match self {
            MutationOp::Insert(_) => "create",
            MutationOp::Update(_) => "update",
            MutationOp::Delete => "delete",
        }
    }
}

/// A write constrained to one tenant, same construction rule as
/// [`ScopedQuery`].
pub struct ScopedMutation {
    tenant_id: Uuid,
    entity: ScopedEntity,
    row_id: Uuid,
    op: MutationOp,
}

impl ScopedMutation {
    pub fn insert(
        ctx: &RequestContext,
        entity: ScopedEntity,
        row_id: Uuid,
        doc: serde_json::Value,
    ) -> Self {
        Self {
            tenant_id: ctx.tenant_id(),
            entity,
            row_id,
            op: MutationOp::Insert(doc),
        }
    }

    pub fn update(
        ctx: &RequestContext,
        entity: ScopedEntity,
        row_id: Uuid,
        doc: serde_json::Value,
    ) -> Self {
        Self {
            tenant_id: ctx.tenant_id(),
            entity,
            row_id,
            op: MutationOp::Update(doc),
        }
    }

    pub fn delete(ctx: &RequestContext, entity: ScopedEntity, row_id: Uuid) -> Self {
        Self {
            tenant_id: ctx.tenant_id(),
            entity,
            row_id,
            op: MutationOp::Delete,
        }
    }
}

/// Returned by a committed write; `audit_record_id` ties the mutation to
/// its single audit record.
#[derive(Debug, Clone, Serialize)]
pub struct WriteReceipt {
    pub entity: ScopedEntity,
    pub row_id: Uuid,
    pub audit_record_id: Uuid,
}

type RowKey = (ScopedEntity, Uuid, Uuid);

/// The only storage entry point for tenant-scoped data.
pub struct IsolationGate {
    rows: DashMap<RowKey, serde_json::Value>,
    tenants: Arc<TenantDirectory>,
    audit: Arc<AuditRecorder>,
}

impl IsolationGate {
    pub fn new(tenants: Arc<TenantDirectory>, audit: Arc<AuditRecorder>) -> Self {
        Self {
            rows: DashMap::new(),
            tenants,
            audit,
        }
    }

    /// Read rows, strictly within the context's tenant. Zero matches is
    /// a valid empty result, not an error.
    pub fn read(
        &self,
        ctx: &RequestContext,
        query: &ScopedQuery,
    ) -> ClarionResult<Vec<(Uuid, serde_json::Value)>> {
        self.enforce(ctx, query.tenant_id, query.entity, "read")?;

        let mut rows = match query.row_id {
            Some(row_id) => self
                .rows
                .get(&(query.entity, ctx.tenant_id(), row_id))
                .map(|e| vec![(row_id, e.value().clone())])
                .unwrap_or_default(),
            None => self
                .rows
                .iter()
                .filter(|e| {
                    let (entity, tenant_id, _) = *e.key();
                    entity == query.entity && tenant_id == ctx.tenant_id()
                })
                .map(|e| (e.key().2, e.value().clone()))
                .collect(),
        };

        if let Some(predicate) = &query.predicate {
            rows.retain(|(_, doc)| predicate(doc));
        }
        Ok(rows)
    }

    /// Apply a mutation, strictly within the context's tenant. On commit
    /// appends exactly one audit record; a denied or failed mutation
    /// appends none.
    pub fn write(&self, ctx: &RequestContext, mutation: ScopedMutation) -> ClarionResult<WriteReceipt> {
        let action = mutation.op.action();
        self.enforce(ctx, mutation.tenant_id, mutation.entity, action)?;

        let key = (mutation.entity, ctx.tenant_id(), mutation.row_id);
        let (before, after) = match mutation.op {
            MutationOp::Insert(doc) => match self.rows.entry(key) {
                Entry::Occupied(_) => return Err(AuthzError::DuplicateRow(mutation.row_id)),
                Entry::Vacant(vacant) => {
                    vacant.insert(doc.clone());
                    (None, Some(doc))
                }
            },
            MutationOp::Update(doc) => {
                let mut entry = self
                    .rows
                    .get_mut(&key)
                    .ok_or(AuthzError::RowNotFound(mutation.row_id))?;
                let before = entry.value().clone();
                *entry.value_mut() = doc.clone();
                (Some(before), Some(doc))
            }
            MutationOp::Delete => {
                let (_, before) = self
                    .rows
                    .remove(&key)
                    .ok_or(AuthzError::RowNotFound(mutation.row_id))?;
                (Some(before), None)
            }
        };

        let record = self.audit.record(
            ctx,
            &format!("{}.{}", mutation.entity.resource(), action),
            mutation.entity.resource(),
            mutation.row_id,
            before,
            after,
        );

        Ok(WriteReceipt {
            entity: mutation.entity,
            row_id: mutation.row_id,
            audit_record_id: record.id,
        })
    }

    /// The one cross-tenant path: listing tenants themselves, for
    /// super-admin administration. Explicit and always logged.
    pub fn list_tenants_privileged(&self, ctx: &RequestContext) -> ClarionResult<Vec<Tenant>> {
        if ctx.role() != Role::SuperAdmin {
            return Err(AuthzError::PermissionDenied {
                resource: "tenant".into(),
                action: "list_all".into(),
            });
        }
        info!(
            actor_id = %ctx.principal_id(),
            tenant_id = %ctx.tenant_id(),
            "Privileged cross-tenant tenant listing"
        );
        Ok(self.tenants.list())
    }

    /// Common enforcement for both paths: the scoped value must belong
    /// to this context, the tenant must still be active, and the
    /// context's permission set must cover the action.
    fn enforce(
        &self,
        ctx: &RequestContext,
        scoped_tenant: Uuid,
        entity: ScopedEntity,
        action: &str,
    ) -> ClarionResult<()> {
        if scoped_tenant != ctx.tenant_id() {
            // A scoped value paired with another request's context is a
            // programming defect, not routine traffic.
            error!(
                scoped_tenant = %scoped_tenant,
                context_tenant = %ctx.tenant_id(),
                entity = entity.resource(),
                action,
                "Isolation violation: query scoped to a different tenant than its context"
            );
            return Err(AuthzError::IsolationViolation(format!(
                "{} {} scoped to tenant {} but executed under tenant {}",
                entity.resource(),
                action,
                scoped_tenant,
                ctx.tenant_id()
            )));
        }

        let tenant = self
            .tenants
            .get(ctx.tenant_id())
            .ok_or_else(|| AuthzError::TenantNotFound(ctx.tenant_slug().to_string()))?;
        if tenant.status != TenantStatus::Active {
            return Err(AuthzError::TenantUnavailable {
                slug: tenant.slug,
                status: tenant.status,
            });
        }

        ctx.require(entity.resource(), action)
    }
}

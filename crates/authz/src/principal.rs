//! Principals and the append-only creation lineage.
//!
//! Every principal records who created it; a creator must already exist
//! (and be live), which keeps the lineage acyclic by construction. The
//! only rootless principals are the bootstrap admins of an organization.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use clarion_core::error::{AuthzError, ClarionResult};
use clarion_core::types::Role;

use crate::quota::QuotaLedger;

/// An authenticated actor belonging to one organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub org_id: Uuid,
    pub role: Role,
    pub display_name: String,
    /// How many agents this principal may itself create.
    pub max_agents_allowed: u32,
    /// How many managers this principal may itself create.
    pub max_managers_allowed: u32,
    /// Creation lineage back-reference; `None` only for bootstrap admins.
    pub created_by: Option<Uuid>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Default creation quotas (agents, managers) per role.
pub fn creation_quota(role: Role) -> (u32, u32) {
    match role {
        Role::SuperAdmin => (u32::MAX, u32::MAX),
        Role::TenantAdmin => (50, 10),
        Role::Manager => (20, 0),
        Role::Agent | Role::Viewer => (0, 0),
    }
}

/// Principal directory backed by DashMap. Creation is serialized per
/// creator so the quota check and the insert form one critical section.
pub struct PrincipalDirectory {
    principals: DashMap<Uuid, Principal>,
    creation_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl Default for PrincipalDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PrincipalDirectory {
    pub fn new() -> Self {
        Self {
            principals: DashMap::new(),
            creation_locks: DashMap::new(),
        }
    }

    /// Create a principal. `created_by` must reference a live principal
    /// of the same tenant whose own creation quota for this role is not
    /// exhausted; only tenant admins may be created without a creator.
    pub fn create(
        &self,
        tenant_id: Uuid,
        org_id: Uuid,
        role: Role,
        display_name: &str,
        created_by: Option<Uuid>,
    ) -> ClarionResult<Principal> {
        // Two concurrent creates through the same creator must not both
        // pass the quota check: hold the creator's lock from the count
        // to the insert. The lock Arc is cloned out first so no map
        // shard lock is held while waiting.
        let creation_lock = created_by.map(|creator_id| {
            self.creation_locks
                .entry(creator_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        });
        let _serialized = creation_lock.as_ref().map(|lock| lock.lock());

        match created_by {
            Some(creator_id) => {
                // Clone the creator out so no entry lock is held while
                // `minted_by` walks the map.
                let creator = self
                    .principals
                    .get(&creator_id)
                    .map(|e| e.value().clone())
                    .ok_or(AuthzError::PrincipalNotFound(creator_id))?;
                if creator.deleted {
                    return Err(AuthzError::LineageViolation(format!(
                        "creator {creator_id} is deleted"
                    )));
                }
                if creator.tenant_id != tenant_id {
                    return Err(AuthzError::IsolationViolation(format!(
                        "creator {creator_id} belongs to a different tenant"
                    )));
                }
                let limit = match role {
                    Role::Agent => creator.max_agents_allowed,
                    Role::Manager => creator.max_managers_allowed,
                    _ => u32::MAX,
                };
                let minted = self.minted_by(creator_id, role);
                if minted >= limit as u64 {
                    return Err(AuthzError::QuotaExceeded {
                        resource: format!("{}s created by principal", role),
                        current: minted,
                        limit: limit as u64,
                    });
                }
            }
            None => {
                if !matches!(role, Role::TenantAdmin | Role::SuperAdmin) {
                    return Err(AuthzError::LineageViolation(format!(
                        "a {role} requires a creator"
                    )));
                }
            }
        }

        let (max_agents_allowed, max_managers_allowed) = creation_quota(role);
        let now = Utc::now();
        let principal = Principal {
            id: Uuid::new_v4(),
            tenant_id,
            org_id,
            role,
            display_name: display_name.to_string(),
            max_agents_allowed,
            max_managers_allowed,
            created_by,
            deleted: false,
            created_at: now,
            updated_at: now,
        };

        info!(
            principal_id = %principal.id,
            tenant_id = %tenant_id,
            role = %role,
            created_by = ?created_by,
            "Principal created"
        );
        self.principals.insert(principal.id, principal.clone());
        Ok(principal)
    }

    pub fn get(&self, id: Uuid) -> Option<Principal> {
        self.principals.get(&id).map(|e| e.value().clone())
    }

    pub fn require(&self, id: Uuid) -> ClarionResult<Principal> {
        self.get(id).ok_or(AuthzError::PrincipalNotFound(id))
    }

    /// Live (non-deleted) principals of an organization.
    pub fn list_by_org(&self, org_id: Uuid) -> Vec<Principal> {
        self.principals
            .iter()
            .filter(|e| e.value().org_id == org_id && !e.value().deleted)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Live (agents, managers) counts for an organization. This is the
    /// ground truth the quota counters cache.
    pub fn live_counts(&self, org_id: Uuid) -> (u64, u64) {
        let mut agents = 0;
        let mut managers = 0;
        for entry in self.principals.iter() {
            let p = entry.value();
            if p.org_id != org_id || p.deleted {
                continue;
            }
            match p.role {
                Role::Agent => agents += 1,
                Role::Manager => managers += 1,
                _ => {}
            }
        }
        (agents, managers)
    }

    /// Mark a principal deleted. Idempotent: the first call returns the
    /// (org, role) whose seat the caller should release; repeated calls
    /// return `None` so nothing is ever decremented twice.
    pub fn delete(&self, id: Uuid) -> ClarionResult<Option<(Uuid, Role)>> {
        let mut entry = self
            .principals
            .get_mut(&id)
            .ok_or(AuthzError::PrincipalNotFound(id))?;
        if entry.deleted {
            return Ok(None);
        }
        entry.deleted = true;
        entry.updated_at = Utc::now();
        info!(principal_id = %id, role = %entry.role, "Principal deleted");
        Ok(Some((entry.org_id, entry.role)))
    }

    /// Delete a principal and release its seat in one step. Returns
    /// `true` when the principal was live and its seat was released.
    pub fn remove_with_release(&self, id: Uuid, ledger: &QuotaLedger) -> ClarionResult<bool> {
        match self.delete(id)? {
            Some((org_id, role)) => {
                ledger.release(org_id, role)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Change a principal's role, moving its seat atomically in the
    /// ledger. Rejected wholesale when the target seat pool is full.
    pub fn change_role(&self, id: Uuid, to: Role, ledger: &QuotaLedger) -> ClarionResult<Principal> {
        let current = self.require(id)?;
        if current.deleted {
            return Err(AuthzError::PrincipalNotFound(id));
        }
        if current.role == to {
            return Ok(current);
        }

        ledger.change_role(current.org_id, current.role, to)?;

        let mut entry = self
            .principals
            .get_mut(&id)
            .ok_or(AuthzError::PrincipalNotFound(id))?;
        entry.role = to;
        let (agents, managers) = creation_quota(to);
        entry.max_agents_allowed = agents;
        entry.max_managers_allowed = managers;
        entry.updated_at = Utc::now();
        info!(principal_id = %id, from = %current.role, to = %to, "Principal role changed");
        Ok(entry.clone())
    }

    /// Live principals of `role` minted by `creator_id`.
    fn minted_by(&self, creator_id: Uuid, role: Role) -> u64 {
        self.principals
            .iter()
            .filter(|e| {
                let p = e.value();
                p.created_by == Some(creator_id) && p.role == role && !p.deleted
            })
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lineage_requires_live_creator() {
        let dir = PrincipalDirectory::new();
        let tenant = Uuid::new_v4();
        let org = Uuid::new_v4();

        // Bootstrap admin needs no creator; an agent does.
        let admin = dir.create(tenant, org, Role::TenantAdmin, "root", None).unwrap();
        assert!(matches!(
            dir.create(tenant, org, Role::Agent, "orphan", None),
            Err(AuthzError::LineageViolation(_))
        ));

        let agent = dir
            .create(tenant, org, Role::Agent, "a1", Some(admin.id))
            .unwrap();
        assert_eq!(agent.created_by, Some(admin.id));

        // A deleted creator cannot mint principals.
        dir.delete(admin.id).unwrap();
        assert!(matches!(
            dir.create(tenant, org, Role::Agent, "a2", Some(admin.id)),
            Err(AuthzError::LineageViolation(_))
        ));
    }

    #[test]
    fn test_cross_tenant_creator_is_an_isolation_violation() {
        let dir = PrincipalDirectory::new();
        let org = Uuid::new_v4();
        let admin = dir
            .create(Uuid::new_v4(), org, Role::TenantAdmin, "root", None)
            .unwrap();

        let err = dir
            .create(Uuid::new_v4(), org, Role::Agent, "a1", Some(admin.id))
            .unwrap_err();
        assert!(err.is_invariant_breach());
    }

    #[test]
    fn test_creator_quota_defaults() {
        let dir = PrincipalDirectory::new();
        let tenant = Uuid::new_v4();
        let org = Uuid::new_v4();
        let admin = dir.create(tenant, org, Role::TenantAdmin, "root", None).unwrap();
        let manager = dir
            .create(tenant, org, Role::Manager, "m1", Some(admin.id))
            .unwrap();

        assert_eq!(admin.max_agents_allowed, 50);
        assert_eq!(admin.max_managers_allowed, 10);
        assert_eq!(manager.max_agents_allowed, 20);
        assert_eq!(manager.max_managers_allowed, 0);

        // A manager may not create managers at all.
        assert!(matches!(
            dir.create(tenant, org, Role::Manager, "m2", Some(manager.id)),
            Err(AuthzError::QuotaExceeded { .. })
        ));

        // Agents create nothing.
        let agent = dir
            .create(tenant, org, Role::Agent, "a1", Some(manager.id))
            .unwrap();
        assert!(matches!(
            dir.create(tenant, org, Role::Agent, "a2", Some(agent.id)),
            Err(AuthzError::QuotaExceeded { .. })
        ));
    }

    #[test]
    fn test_concurrent_creates_respect_the_creator_quota() {
        let dir = PrincipalDirectory::new();
        let tenant = Uuid::new_v4();
        let org = Uuid::new_v4();
        let admin = dir
            .create(tenant, org, Role::TenantAdmin, "root", None)
            .unwrap();
        let manager = dir
            .create(tenant, org, Role::Manager, "m1", Some(admin.id))
            .unwrap();
        assert_eq!(manager.max_agents_allowed, 20);

        // Many threads hire agents through the same manager; the count
        // and the insert are one critical section, so the limit holds.
        let created: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..64)
                .map(|i| {
                    let dir = &dir;
                    s.spawn(move || {
                        dir.create(tenant, org, Role::Agent, &format!("a{i}"), Some(manager.id))
                            .is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });

        assert_eq!(created, 20);
        assert_eq!(dir.minted_by(manager.id, Role::Agent), 20);

        // The next attempt is still a denial, not an overshoot.
        assert!(matches!(
            dir.create(tenant, org, Role::Agent, "late", Some(manager.id)),
            Err(AuthzError::QuotaExceeded { current: 20, limit: 20, .. })
        ));
    }

    #[test]
    fn test_change_role_moves_the_seat_or_nothing() {
        let dir = PrincipalDirectory::new();
        let ledger = QuotaLedger::new();
        let tenant = Uuid::new_v4();
        let org = ledger.register(tenant, "Acme", 5, 0, 10);
        let admin = dir
            .create(tenant, org.id, Role::TenantAdmin, "root", None)
            .unwrap();
        ledger.reserve(org.id, Role::Agent).unwrap();
        let agent = dir
            .create(tenant, org.id, Role::Agent, "a1", Some(admin.id))
            .unwrap();

        // Zero manager seats: the promotion is rejected wholesale and
        // neither the principal nor the counters change.
        let err = dir.change_role(agent.id, Role::Manager, &ledger).unwrap_err();
        assert!(matches!(err, AuthzError::QuotaExceeded { .. }));
        assert_eq!(dir.get(agent.id).unwrap().role, Role::Agent);
        assert_eq!(ledger.get(org.id).unwrap().current_agent_count, 1);
        assert_eq!(ledger.get(org.id).unwrap().current_manager_count, 0);
    }

    #[test]
    fn test_change_role_success_updates_creation_quotas() {
        let dir = PrincipalDirectory::new();
        let ledger = QuotaLedger::new();
        let tenant = Uuid::new_v4();
        let org = ledger.register(tenant, "Acme", 5, 1, 10);
        let admin = dir
            .create(tenant, org.id, Role::TenantAdmin, "root", None)
            .unwrap();
        ledger.reserve(org.id, Role::Agent).unwrap();
        let agent = dir
            .create(tenant, org.id, Role::Agent, "a1", Some(admin.id))
            .unwrap();

        let promoted = dir.change_role(agent.id, Role::Manager, &ledger).unwrap();
        assert_eq!(promoted.role, Role::Manager);
        assert_eq!(promoted.max_agents_allowed, 20);
        let org_after = ledger.get(org.id).unwrap();
        assert_eq!(org_after.current_agent_count, 0);
        assert_eq!(org_after.current_manager_count, 1);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = PrincipalDirectory::new();
        let tenant = Uuid::new_v4();
        let org = Uuid::new_v4();
        let admin = dir.create(tenant, org, Role::TenantAdmin, "root", None).unwrap();
        let agent = dir
            .create(tenant, org, Role::Agent, "a1", Some(admin.id))
            .unwrap();

        assert_eq!(dir.delete(agent.id).unwrap(), Some((org, Role::Agent)));
        // Second delete reports nothing to release.
        assert_eq!(dir.delete(agent.id).unwrap(), None);
        assert_eq!(dir.live_counts(org), (0, 0));
    }
}

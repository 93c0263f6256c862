//! Per-organization seat counters with atomic check-and-reserve.
//!
//! A counter is a cache of truth derivable from the principal directory,
//! so `reconcile` re-deriving it is a first-class operation, not an
//! afterthought. The compare and the increment in `reserve` happen under
//! the organization's map entry write lock: with one seat left and two
//! concurrent callers, exactly one wins. Nothing here blocks — a busy
//! entry comes back as `ConflictRetryable` for the caller to retry.

use dashmap::try_result::TryResult;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use clarion_core::error::{AuthzError, ClarionResult};
use clarion_core::types::Role;

use crate::principal::PrincipalDirectory;

/// An organization's live counters and seat limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub max_agents: u32,
    pub max_managers: u32,
    pub max_calls_per_month: u64,
    pub current_agent_count: u32,
    pub current_manager_count: u32,
    pub calls_this_month: u64,
}

/// What `reconcile` found and fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    pub org_id: Uuid,
    pub agents_before: u32,
    pub agents_after: u32,
    pub managers_before: u32,
    pub managers_after: u32,
}

impl DriftReport {
    pub fn clean(&self) -> bool {
        self.agents_before == self.agents_after && self.managers_before == self.managers_after
    }
}

/// What `reconcile_calls` found and fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallDriftReport {
    pub org_id: Uuid,
    pub calls_before: u64,
    pub calls_after: u64,
}

impl CallDriftReport {
    pub fn clean(&self) -> bool {
        self.calls_before == self.calls_after
    }
}

/// Seat ledger for every organization, keyed by org id.
pub struct QuotaLedger {
    orgs: DashMap<Uuid, Organization>,
}

impl Default for QuotaLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self {
            orgs: DashMap::new(),
        }
    }

    /// Register an organization with its seat limits. Counters start at
    /// zero; principals created afterwards reserve seats one by one.
    pub fn register(
        &self,
        tenant_id: Uuid,
        name: &str,
        max_agents: u32,
        max_managers: u32,
        max_calls_per_month: u64,
    ) -> Organization {
        let org = Organization {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            max_agents,
            max_managers,
            max_calls_per_month,
            current_agent_count: 0,
            current_manager_count: 0,
            calls_this_month: 0,
        };
        info!(org_id = %org.id, tenant_id = %tenant_id, name, "Organization registered");
        self.orgs.insert(org.id, org.clone());
        org
    }

    pub fn get(&self, org_id: Uuid) -> Option<Organization> {
        self.orgs.get(&org_id).map(|e| e.value().clone())
    }

    /// Atomically reserve one seat for `role`. A denial leaves the
    /// counters untouched. Roles without seat pools (admins, viewers)
    /// always succeed. Never blocks: a contended entry is a
    /// `ConflictRetryable`.
    pub fn reserve(&self, org_id: Uuid, role: Role) -> ClarionResult<()> {
        self.with_org(org_id, |org| match role {
            Role::Agent => {
                if org.current_agent_count >= org.max_agents {
                    return Err(AuthzError::QuotaExceeded {
                        resource: "agent".into(),
                        current: org.current_agent_count as u64,
                        limit: org.max_agents as u64,
                    });
                }
                org.current_agent_count += 1;
                Ok(())
            }
            Role::Manager => {
                if org.current_manager_count >= org.max_managers {
                    return Err(AuthzError::QuotaExceeded {
                        resource: "manager".into(),
                        current: org.current_manager_count as u64,
                        limit: org.max_managers as u64,
                    });
                }
                org.current_manager_count += 1;
                Ok(())
            }
            _ => Ok(()),
        })
    }

    /// Release one seat, floored at zero.
    pub fn release(&self, org_id: Uuid, role: Role) -> ClarionResult<()> {
        self.with_org(org_id, |org| {
            match role {
                Role::Agent => {
                    org.current_agent_count = org.current_agent_count.saturating_sub(1);
                }
                Role::Manager => {
                    org.current_manager_count = org.current_manager_count.saturating_sub(1);
                }
                _ => {}
            }
            Ok(())
        })
    }

    /// Move a seat from one role pool to another in a single critical
    /// section. If the target pool is full the whole change is rejected
    /// and neither counter moves.
    pub fn change_role(&self, org_id: Uuid, from: Role, to: Role) -> ClarionResult<()> {
        if from == to {
            return Ok(());
        }
        self.with_org(org_id, |org| {
            // Check the target pool before touching anything.
            match to {
                Role::Agent if org.current_agent_count >= org.max_agents => {
                    return Err(AuthzError::QuotaExceeded {
                        resource: "agent".into(),
                        current: org.current_agent_count as u64,
                        limit: org.max_agents as u64,
                    });
                }
                Role::Manager if org.current_manager_count >= org.max_managers => {
                    return Err(AuthzError::QuotaExceeded {
                        resource: "manager".into(),
                        current: org.current_manager_count as u64,
                        limit: org.max_managers as u64,
                    });
                }
                _ => {}
            }
            match from {
                Role::Agent => {
                    org.current_agent_count = org.current_agent_count.saturating_sub(1);
                }
                Role::Manager => {
                    org.current_manager_count = org.current_manager_count.saturating_sub(1);
                }
                _ => {}
            }
            match to {
                Role::Agent => org.current_agent_count += 1,
                Role::Manager => org.current_manager_count += 1,
                _ => {}
            }
            Ok(())
        })
    }

    /// Count one call against the monthly allowance.
    pub fn record_call(&self, org_id: Uuid) -> ClarionResult<()> {
        self.with_org(org_id, |org| {
            if org.calls_this_month >= org.max_calls_per_month {
                return Err(AuthzError::QuotaExceeded {
                    resource: "calls_per_month".into(),
                    current: org.calls_this_month,
                    limit: org.max_calls_per_month,
                });
            }
            org.calls_this_month += 1;
            Ok(())
        })
    }

    /// Reset the monthly call counter (billing-period rollover).
    pub fn reset_month(&self, org_id: Uuid) -> ClarionResult<()> {
        self.with_org(org_id, |org| {
            org.calls_this_month = 0;
            Ok(())
        })
    }

    /// Recompute the seat counters from the principal directory. The
    /// backstop for the `counter == live count` invariant; idempotent,
    /// and a no-op report when nothing drifted.
    pub fn reconcile(
        &self,
        org_id: Uuid,
        directory: &PrincipalDirectory,
    ) -> ClarionResult<DriftReport> {
        let (agents, managers) = directory.live_counts(org_id);
        self.with_org(org_id, |org| {
            let report = DriftReport {
                org_id,
                agents_before: org.current_agent_count,
                agents_after: agents as u32,
                managers_before: org.current_manager_count,
                managers_after: managers as u32,
            };
            org.current_agent_count = agents as u32;
            org.current_manager_count = managers as u32;
            if report.clean() {
                info!(org_id = %org_id, "Reconcile: counters match live principals");
            } else {
                warn!(
                    org_id = %org_id,
                    agents_before = report.agents_before,
                    agents_after = report.agents_after,
                    managers_before = report.managers_before,
                    managers_after = report.managers_after,
                    "Reconcile: counter drift corrected"
                );
            }
            Ok(report)
        })
    }

    /// Backstop for the monthly call counter, mirroring `reconcile` for
    /// seats. The caller re-derives the live count from call storage
    /// (the ledger does not parse row documents); idempotent.
    pub fn reconcile_calls(&self, org_id: Uuid, live_calls: u64) -> ClarionResult<CallDriftReport> {
        self.with_org(org_id, |org| {
            let report = CallDriftReport {
                org_id,
                calls_before: org.calls_this_month,
                calls_after: live_calls,
            };
            org.calls_this_month = live_calls;
            if report.clean() {
                info!(org_id = %org_id, "Reconcile: call counter matches live calls");
            } else {
                warn!(
                    org_id = %org_id,
                    calls_before = report.calls_before,
                    calls_after = report.calls_after,
                    "Reconcile: call counter drift corrected"
                );
            }
            Ok(report)
        })
    }

    fn with_org<T>(
        &self,
        org_id: Uuid,
        f: impl FnOnce(&mut Organization) -> ClarionResult<T>,
    ) -> ClarionResult<T> {
        match self.orgs.try_get_mut(&org_id) {
            TryResult::Present(mut org) => f(org.value_mut()),
            TryResult::Absent => Err(AuthzError::OrganizationNotFound(org_id)),
            TryResult::Locked => Err(AuthzError::ConflictRetryable(format!(
                "organization {org_id} is busy"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::thread;
    use std::time::Duration;

    /// Retry wrapper for tests: a lost lock race is retry-safe.
    fn reserve_retrying(ledger: &QuotaLedger, org_id: Uuid, role: Role) -> ClarionResult<()> {
        loop {
            match ledger.reserve(org_id, role) {
                Err(e) if e.is_retryable() => {
                    thread::sleep(Duration::from_micros(rand::thread_rng().gen_range(10..100)));
                }
                other => return other,
            }
        }
    }

    #[test]
    fn test_reserve_until_exhausted_then_release() {
        let ledger = QuotaLedger::new();
        let org = ledger.register(Uuid::new_v4(), "Acme", 2, 1, 1000);

        ledger.reserve(org.id, Role::Agent).unwrap();
        ledger.reserve(org.id, Role::Agent).unwrap();

        // Third agent seat is denied with the counters intact.
        let err = ledger.reserve(org.id, Role::Agent).unwrap_err();
        assert!(matches!(
            err,
            AuthzError::QuotaExceeded {
                current: 2,
                limit: 2,
                ..
            }
        ));
        assert_eq!(ledger.get(org.id).unwrap().current_agent_count, 2);

        // After a release the next reservation is granted.
        ledger.release(org.id, Role::Agent).unwrap();
        ledger.reserve(org.id, Role::Agent).unwrap();
        assert_eq!(ledger.get(org.id).unwrap().current_agent_count, 2);
    }

    #[test]
    fn test_untracked_roles_never_deny() {
        let ledger = QuotaLedger::new();
        let org = ledger.register(Uuid::new_v4(), "Acme", 0, 0, 0);
        ledger.reserve(org.id, Role::TenantAdmin).unwrap();
        ledger.reserve(org.id, Role::Viewer).unwrap();
    }

    #[test]
    fn test_release_floors_at_zero() {
        let ledger = QuotaLedger::new();
        let org = ledger.register(Uuid::new_v4(), "Acme", 2, 2, 10);
        ledger.release(org.id, Role::Agent).unwrap();
        assert_eq!(ledger.get(org.id).unwrap().current_agent_count, 0);
    }

    #[test]
    fn test_concurrent_reservations_grant_exactly_the_free_seats() {
        let ledger = QuotaLedger::new();
        let seats = 10u32;
        let contenders = 25;
        let org = ledger.register(Uuid::new_v4(), "Racy", seats, 0, 0);

        let granted: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..contenders)
                .map(|_| {
                    let ledger = &ledger;
                    s.spawn(move || reserve_retrying(ledger, org.id, Role::Agent).is_ok())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|granted| *granted)
                .count()
        });

        assert_eq!(granted, seats as usize);
        assert_eq!(ledger.get(org.id).unwrap().current_agent_count, seats);
    }

    #[test]
    fn test_role_change_is_all_or_nothing() {
        let ledger = QuotaLedger::new();
        let org = ledger.register(Uuid::new_v4(), "Acme", 5, 1, 10);
        ledger.reserve(org.id, Role::Agent).unwrap();
        ledger.reserve(org.id, Role::Agent).unwrap();
        ledger.reserve(org.id, Role::Manager).unwrap();

        // Manager pool is full: promotion is rejected, counters untouched.
        let err = ledger.change_role(org.id, Role::Agent, Role::Manager).unwrap_err();
        assert!(matches!(err, AuthzError::QuotaExceeded { .. }));
        let snapshot = ledger.get(org.id).unwrap();
        assert_eq!(snapshot.current_agent_count, 2);
        assert_eq!(snapshot.current_manager_count, 1);

        // Demotion moves the seat in one step.
        ledger.change_role(org.id, Role::Manager, Role::Agent).unwrap();
        let snapshot = ledger.get(org.id).unwrap();
        assert_eq!(snapshot.current_agent_count, 3);
        assert_eq!(snapshot.current_manager_count, 0);
    }

    #[test]
    fn test_monthly_call_quota() {
        let ledger = QuotaLedger::new();
        let org = ledger.register(Uuid::new_v4(), "Acme", 5, 1, 2);
        ledger.record_call(org.id).unwrap();
        ledger.record_call(org.id).unwrap();
        assert!(matches!(
            ledger.record_call(org.id),
            Err(AuthzError::QuotaExceeded { .. })
        ));

        ledger.reset_month(org.id).unwrap();
        ledger.record_call(org.id).unwrap();
    }

    #[test]
    fn test_reconcile_calls_corrects_drift_and_is_idempotent() {
        let ledger = QuotaLedger::new();
        let org = ledger.register(Uuid::new_v4(), "Acme", 5, 1, 100);
        for _ in 0..3 {
            ledger.record_call(org.id).unwrap();
        }

        // One of the recorded calls was since purged from storage.
        let first = ledger.reconcile_calls(org.id, 2).unwrap();
        assert!(!first.clean());
        assert_eq!(ledger.get(org.id).unwrap().calls_this_month, 2);

        let second = ledger.reconcile_calls(org.id, 2).unwrap();
        assert!(second.clean());
        assert_eq!(ledger.get(org.id).unwrap().calls_this_month, 2);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let ledger = QuotaLedger::new();
        let directory = PrincipalDirectory::new();
        let tenant = Uuid::new_v4();
        let org = ledger.register(tenant, "Acme", 10, 5, 100);

        let admin = directory
            .create(tenant, org.id, Role::TenantAdmin, "root", None)
            .unwrap();
        for i in 0..3 {
            ledger.reserve(org.id, Role::Agent).unwrap();
            directory
                .create(tenant, org.id, Role::Agent, &format!("a{i}"), Some(admin.id))
                .unwrap();
        }

        // Inject drift: a counter bumped without a live principal.
        ledger.reserve(org.id, Role::Agent).unwrap();
        assert_eq!(ledger.get(org.id).unwrap().current_agent_count, 4);

        let first = ledger.reconcile(org.id, &directory).unwrap();
        assert!(!first.clean());
        assert_eq!(ledger.get(org.id).unwrap().current_agent_count, 3);

        // Second run with no intervening mutation changes nothing.
        let second = ledger.reconcile(org.id, &directory).unwrap();
        assert!(second.clean());
        assert_eq!(ledger.get(org.id).unwrap().current_agent_count, 3);
    }
}

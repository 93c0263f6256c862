//! Deterministic feature-flag evaluation.
//!
//! The first decisive check wins: disabled flag, time window, principal
//! allow-list, role allow-list, then percentage rollout. Rollout
//! bucketing hashes the principal id with SHA-256, so a given principal
//! lands in the same bucket on every evaluation and never flickers at a
//! fixed percentage.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use clarion_core::types::Role;

/// Per-tenant configuration of one flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub key: String,
    pub enabled: bool,
    /// 0..=100; principals whose stable bucket falls below this are in.
    pub rollout_percentage: u8,
    pub allow_principals: HashSet<Uuid>,
    pub allow_roles: HashSet<Role>,
    /// Optional `[start, end)` activity window.
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl FeatureFlag {
    pub fn new(key: &str, enabled: bool, rollout_percentage: u8) -> Self {
        Self {
            key: key.to_string(),
            enabled,
            rollout_percentage: rollout_percentage.min(100),
            allow_principals: HashSet::new(),
            allow_roles: HashSet::new(),
            window: None,
        }
    }
}

/// Flag store and evaluator, keyed by (tenant, flag key).
pub struct FeatureFlagEvaluator {
    flags: DashMap<(Uuid, String), FeatureFlag>,
}

impl Default for FeatureFlagEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureFlagEvaluator {
    pub fn new() -> Self {
        Self {
            flags: DashMap::new(),
        }
    }

    /// Set (or replace) a tenant's configuration of a flag.
    pub fn set_flag(&self, tenant_id: Uuid, flag: FeatureFlag) {
        info!(
            tenant_id = %tenant_id,
            key = %flag.key,
            enabled = flag.enabled,
            rollout = flag.rollout_percentage,
            "Feature flag configured"
        );
        self.flags.insert((tenant_id, flag.key.clone()), flag);
    }

    pub fn get_flag(&self, tenant_id: Uuid, key: &str) -> Option<FeatureFlag> {
        self.flags
            .get(&(tenant_id, key.to_string()))
            .map(|e| e.value().clone())
    }

    /// Evaluate a flag for a principal now.
    pub fn is_enabled(&self, tenant_id: Uuid, key: &str, principal_id: Uuid, role: Role) -> bool {
        self.is_enabled_at(tenant_id, key, principal_id, role, Utc::now())
    }

    /// Evaluate a flag at a specific instant. Deterministic: same flag
    /// configuration, principal, and instant always give the same answer.
    pub fn is_enabled_at(
        &self,
        tenant_id: Uuid,
        key: &str,
        principal_id: Uuid,
        role: Role,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(flag) = self.flags.get(&(tenant_id, key.to_string())) else {
            return false;
        };
        let flag = flag.value();

        if !flag.enabled {
            return false;
        }
        if let Some((start, end)) = flag.window {
            if now < start || now >= end {
                return false;
            }
        }
        if flag.allow_principals.contains(&principal_id) {
            return true;
        }
        if flag.allow_roles.contains(&role) {
            return true;
        }
        match flag.rollout_percentage {
            100 => true,
            0 => false,
            pct => stable_bucket(principal_id) < pct,
        }
    }
}

/// Stable 0..100 bucket for a principal: first eight bytes of the
/// SHA-256 digest of the id, mod 100. Stable across runs and processes,
/// unlike the stdlib hasher.
fn stable_bucket(principal_id: Uuid) -> u8 {
    let digest = Sha256::digest(principal_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_unknown_or_disabled_flag_is_off() {
        let eval = FeatureFlagEvaluator::new();
        let tenant = Uuid::new_v4();
        assert!(!eval.is_enabled(tenant, "missing", Uuid::new_v4(), Role::Agent));

        eval.set_flag(tenant, FeatureFlag::new("coaching", false, 100));
        assert!(!eval.is_enabled(tenant, "coaching", Uuid::new_v4(), Role::Agent));
    }

    #[test]
    fn test_window_is_half_open() {
        let eval = FeatureFlagEvaluator::new();
        let tenant = Uuid::new_v4();
        let start = Utc::now();
        let end = start + Duration::hours(1);

        let mut flag = FeatureFlag::new("beta_scoring", true, 100);
        flag.window = Some((start, end));
        eval.set_flag(tenant, flag);

        let p = Uuid::new_v4();
        assert!(!eval.is_enabled_at(tenant, "beta_scoring", p, Role::Agent, start - Duration::seconds(1)));
        assert!(eval.is_enabled_at(tenant, "beta_scoring", p, Role::Agent, start));
        assert!(eval.is_enabled_at(tenant, "beta_scoring", p, Role::Agent, end - Duration::seconds(1)));
        // `end` itself is outside the window.
        assert!(!eval.is_enabled_at(tenant, "beta_scoring", p, Role::Agent, end));
    }

    #[test]
    fn test_allow_lists_beat_rollout() {
        let eval = FeatureFlagEvaluator::new();
        let tenant = Uuid::new_v4();
        let listed = Uuid::new_v4();

        let mut flag = FeatureFlag::new("coaching", true, 0);
        flag.allow_principals.insert(listed);
        flag.allow_roles.insert(Role::Manager);
        eval.set_flag(tenant, flag);

        // Zero rollout, but listed principal and listed role are in.
        assert!(eval.is_enabled(tenant, "coaching", listed, Role::Agent));
        assert!(eval.is_enabled(tenant, "coaching", Uuid::new_v4(), Role::Manager));
        assert!(!eval.is_enabled(tenant, "coaching", Uuid::new_v4(), Role::Agent));
    }

    #[test]
    fn test_rollout_is_deterministic() {
        let eval = FeatureFlagEvaluator::new();
        let tenant = Uuid::new_v4();
        eval.set_flag(tenant, FeatureFlag::new("coaching", true, 40));

        for _ in 0..20 {
            let p = Uuid::new_v4();
            let first = eval.is_enabled(tenant, "coaching", p, Role::Agent);
            for _ in 0..10 {
                assert_eq!(eval.is_enabled(tenant, "coaching", p, Role::Agent), first);
            }
        }
    }

    #[test]
    fn test_raising_rollout_is_monotonic() {
        let eval = FeatureFlagEvaluator::new();
        let tenant = Uuid::new_v4();
        let principals: Vec<Uuid> = (0..200).map(|_| Uuid::new_v4()).collect();

        let mut enabled_at_30: Vec<Uuid> = Vec::new();
        eval.set_flag(tenant, FeatureFlag::new("coaching", true, 30));
        for p in &principals {
            if eval.is_enabled(tenant, "coaching", *p, Role::Agent) {
                enabled_at_30.push(*p);
            }
        }

        // Everyone in at 30% stays in at 70%.
        eval.set_flag(tenant, FeatureFlag::new("coaching", true, 70));
        for p in &enabled_at_30 {
            assert!(eval.is_enabled(tenant, "coaching", *p, Role::Agent));
        }
    }

    #[test]
    fn test_bucket_distribution_is_plausible() {
        // Not a statistical proof, just a sanity check that buckets
        // spread instead of collapsing onto one value.
        let buckets: HashSet<u8> = (0..500).map(|_| stable_bucket(Uuid::new_v4())).collect();
        assert!(buckets.len() > 50);
    }
}

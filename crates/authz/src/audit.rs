//! Append-only audit recording with tamper-evident hash chaining.
//!
//! A record is written once and never updated or deleted; there is no
//! API for either. Each record links to its predecessor's hash, so any
//! later rewrite breaks the chain and `verify_chain` catches it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::context::RequestContext;

/// One immutable audit record of a state-changing action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub sequence: u64,
    pub tenant_id: Uuid,
    pub actor_id: Uuid,
    /// e.g. `call.update`.
    pub action: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub event_hash: String,
    pub previous_hash: String,
}

struct ChainState {
    sequence: u64,
    last_hash: String,
}

/// Result of verifying the audit chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainVerification {
    pub total_records: usize,
    pub valid_records: usize,
    pub tampered_sequences: Vec<u64>,
    pub chain_intact: bool,
}

/// Append-only audit store.
pub struct AuditRecorder {
    records: DashMap<Uuid, AuditRecord>,
    chain: Mutex<ChainState>,
}

impl Default for AuditRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditRecorder {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            chain: Mutex::new(ChainState {
                sequence: 0,
                last_hash: "genesis".to_string(),
            }),
        }
    }

    /// Append one record. Called by the isolation gate only after a
    /// mutation actually committed; denied or failed mutations never
    /// reach this point.
    pub fn record(
        &self,
        ctx: &RequestContext,
        action: &str,
        entity_type: &str,
        entity_id: Uuid,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> AuditRecord {
        let mut record = AuditRecord {
            id: Uuid::new_v4(),
            sequence: 0,
            tenant_id: ctx.tenant_id(),
            actor_id: ctx.principal_id(),
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id,
            before,
            after,
            timestamp: Utc::now(),
            event_hash: String::new(),
            previous_hash: String::new(),
        };

        {
            let mut chain = self.chain.lock();
            chain.sequence += 1;
            record.sequence = chain.sequence;
            record.previous_hash = chain.last_hash.clone();
            record.event_hash = chain_hash(&record);
            chain.last_hash = record.event_hash.clone();
        }

        info!(
            record_id = %record.id,
            sequence = record.sequence,
            tenant_id = %record.tenant_id,
            actor_id = %record.actor_id,
            action = %record.action,
            "Audit record appended"
        );
        self.records.insert(record.id, record.clone());
        record
    }

    /// Records for one tenant, newest first, optionally filtered by time
    /// range and action.
    pub fn query(
        &self,
        tenant_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        action: Option<&str>,
        limit: usize,
    ) -> Vec<AuditRecord> {
        let mut results: Vec<AuditRecord> = self
            .records
            .iter()
            .filter(|e| {
                let r = e.value();
                if r.tenant_id != tenant_id {
                    return false;
                }
                if let Some(f) = from {
                    if r.timestamp < f {
                        return false;
                    }
                }
                if let Some(t) = to {
                    if r.timestamp > t {
                        return false;
                    }
                }
                if let Some(a) = action {
                    if r.action != a {
                        return false;
                    }
                }
                true
            })
            .map(|e| e.value().clone())
            .collect();

        results.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        results.truncate(limit);
        results
    }

    /// Walk the whole chain and re-derive every hash.
    pub fn verify_chain(&self) -> ChainVerification {
        let mut records: Vec<AuditRecord> =
            self.records.iter().map(|e| e.value().clone()).collect();
        records.sort_by_key(|r| r.sequence);

        let total = records.len();
        let mut valid = 0;
        let mut tampered = Vec::new();
        let mut expected_prev = "genesis".to_string();

        for record in &records {
            if record.previous_hash != expected_prev || chain_hash(record) != record.event_hash {
                tampered.push(record.sequence);
            } else {
                valid += 1;
            }
            expected_prev = record.event_hash.clone();
        }

        ChainVerification {
            total_records: total,
            valid_records: valid,
            tampered_sequences: tampered,
            chain_intact: valid == total,
        }
    }
}

/// Hash over every chained field of a record, snapshots included, so a
/// rewrite of `before`/`after` is as detectable as one of the metadata.
fn chain_hash(record: &AuditRecord) -> String {
    let snapshot = |v: &Option<serde_json::Value>| {
        v.as_ref().map(|doc| doc.to_string()).unwrap_or_default()
    };
    let content = format!(
        "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
        record.sequence,
        record.tenant_id,
        record.actor_id,
        record.action,
        record.entity_type,
        record.entity_id,
        snapshot(&record.before),
        snapshot(&record.after),
        record.timestamp.to_rfc3339(),
        record.previous_hash,
    );
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

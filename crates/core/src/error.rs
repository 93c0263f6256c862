use thiserror::Error;
use uuid::Uuid;

use crate::types::TenantStatus;

pub type ClarionResult<T> = Result<T, AuthzError>;

/// Error taxonomy for the authorization core. Every variant except
/// `IsolationViolation` is routine traffic, not a fault: denials are the
/// engine doing its job. `ConflictRetryable` is the only variant a caller
/// may retry blindly.
#[derive(Error, Debug)]
pub enum AuthzError {
    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("tenant '{slug}' unavailable: {status}")]
    TenantUnavailable { slug: String, status: TenantStatus },

    #[error("permission denied: {resource}:{action}")]
    PermissionDenied { resource: String, action: String },

    #[error("quota exceeded for {resource}: {current}/{limit}")]
    QuotaExceeded {
        resource: String,
        current: u64,
        limit: u64,
    },

    #[error("isolation violation: {0}")]
    IsolationViolation(String),

    #[error("lost a concurrent update race: {0}")]
    ConflictRetryable(String),

    #[error("invalid lifecycle transition: {0}")]
    InvalidTransition(String),

    #[error("tenant slug already in use: {0}")]
    SlugInUse(String),

    #[error("invalid tenant slug: {0:?}")]
    InvalidSlug(String),

    #[error("principal not found: {0}")]
    PrincipalNotFound(Uuid),

    #[error("organization not found: {0}")]
    OrganizationNotFound(Uuid),

    #[error("creation lineage violation: {0}")]
    LineageViolation(String),

    #[error("duplicate row: {0}")]
    DuplicateRow(Uuid),

    #[error("row not found: {0}")]
    RowNotFound(Uuid),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AuthzError {
    /// Only lost concurrency races are safe to retry without rethinking.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthzError::ConflictRetryable(_))
    }

    /// An isolation violation means a caller reached storage without a
    /// properly scoped context. It should be unreachable by construction
    /// and is the only variant worth alerting on.
    pub fn is_invariant_breach(&self) -> bool {
        matches!(self, AuthzError::IsolationViolation(_))
    }
}

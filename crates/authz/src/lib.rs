//! Authorization and tenant-isolation core for the Clarion platform:
//! tenant lifecycle, request-scoped contexts, the permission catalog,
//! seat quotas, the storage isolation gate, feature flags, and the
//! audit record.

pub mod audit;
pub mod catalog;
pub mod context;
pub mod flags;
pub mod gate;
pub mod principal;
pub mod quota;
pub mod resolver;
pub mod tenancy;

pub use audit::AuditRecorder;
pub use catalog::{AccessDecision, PermissionCatalog};
pub use context::{ContextBuilder, RequestContext};
pub use flags::{FeatureFlag, FeatureFlagEvaluator};
pub use gate::{IsolationGate, ScopedEntity, ScopedMutation, ScopedQuery};
pub use principal::PrincipalDirectory;
pub use quota::QuotaLedger;
pub use resolver::{ResolutionInput, TenantResolver};
pub use tenancy::TenantDirectory;

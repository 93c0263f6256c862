//! Shared types, error taxonomy, and configuration for the Clarion
//! authorization and tenant-isolation core.

pub mod config;
pub mod error;
pub mod types;

pub use config::PlatformConfig;
pub use error::{AuthzError, ClarionResult};
pub use types::{Grant, Role, TenantStatus};

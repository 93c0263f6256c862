//! Tenant resolution from request metadata.
//!
//! Resolution order, first match wins: trusted service header, identity
//! claim, subdomain, configured default. The resolver fails closed: a
//! header or claim that was present but names an unknown tenant is a
//! hard `TenantNotFound`, never a fallthrough into the default tenant.

use tracing::debug;

use clarion_core::config::ResolverConfig;
use clarion_core::error::{AuthzError, ClarionResult};

use crate::tenancy::TenantDirectory;

/// Request metadata the resolver sees. Claims are assumed to come from
/// an already-validated identity token; validation itself is the
/// identity provider's job.
#[derive(Debug, Clone, Default)]
pub struct ResolutionInput<'a> {
    /// Value of the explicit tenant header, if present.
    pub tenant_header: Option<&'a str>,
    /// Tenant slug claim from the validated identity token.
    pub claim_tenant: Option<&'a str>,
    /// Host name the request arrived on.
    pub host: Option<&'a str>,
    /// Whether the caller separately authenticated as an internal service.
    pub service_authenticated: bool,
}

pub struct TenantResolver {
    config: ResolverConfig,
}

impl TenantResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Resolve the acting tenant slug. Pure over its inputs: the same
    /// input and directory state always yield the same answer.
    pub fn resolve(
        &self,
        input: &ResolutionInput<'_>,
        directory: &TenantDirectory,
    ) -> ClarionResult<String> {
        // (a) Explicit header, trusted only for authenticated service
        // calls. An untrusted caller's header is not resolver input at
        // all, so it neither resolves nor poisons the later rules.
        if self.config.trust_tenant_header && input.service_authenticated {
            if let Some(slug) = input.tenant_header {
                debug!(slug, "Resolving tenant from service header");
                return self.require_known(slug, directory);
            }
        }

        // (b) Claim in the validated identity token.
        if let Some(slug) = input.claim_tenant {
            debug!(slug, "Resolving tenant from identity claim");
            return self.require_known(slug, directory);
        }

        // (c) Subdomain of the configured base domain.
        if let Some(host) = input.host {
            if let Some(slug) = self.subdomain_of(host) {
                debug!(slug = %slug, host, "Resolving tenant from subdomain");
                return self.require_known(&slug, directory);
            }
        }

        // (d) Configured default, reached only when no earlier rule matched.
        if let Some(slug) = self.config.default_tenant.as_deref() {
            return self.require_known(slug, directory);
        }

        Err(AuthzError::TenantNotFound(
            "no tenant resolvable from request".into(),
        ))
    }

    /// A rule that matched must name a known tenant; otherwise the
    /// request fails closed right here.
    fn require_known(&self, slug: &str, directory: &TenantDirectory) -> ClarionResult<String> {
        if directory.get_by_slug(slug).is_some() {
            Ok(slug.to_string())
        } else {
            Err(AuthzError::TenantNotFound(slug.to_string()))
        }
    }

    fn subdomain_of(&self, host: &str) -> Option<String> {
        let host = host.split(':').next().unwrap_or(host);
        let suffix = format!(".{}", self.config.base_domain);
        host.strip_suffix(suffix.as_str())
            .filter(|sub| !sub.is_empty() && !sub.contains('.'))
            .map(str::to_string)
    }
}

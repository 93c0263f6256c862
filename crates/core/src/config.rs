use serde::Deserialize;

/// Root configuration for the authorization core. Loaded from environment
/// variables with the prefix `CLARION__`.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Tenant-resolution settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Base domain for subdomain resolution (`acme.api.clarion.io` -> `acme`).
    #[serde(default = "default_base_domain")]
    pub base_domain: String,
    /// Fallback tenant slug when no header, claim, or subdomain matched.
    #[serde(default)]
    pub default_tenant: Option<String>,
    /// Honor the explicit tenant header. Only meaningful for calls that
    /// authenticated separately as an internal service.
    #[serde(default)]
    pub trust_tenant_header: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_query_limit")]
    pub default_query_limit: usize,
}

fn default_base_domain() -> String {
    "api.clarion.io".to_string()
}
fn default_query_limit() -> usize {
    100
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_domain: default_base_domain(),
            default_tenant: None,
            trust_tenant_header: false,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            default_query_limit: default_query_limit(),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            resolver: ResolverConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl PlatformConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("CLARION")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

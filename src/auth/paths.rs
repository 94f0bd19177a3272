//! Paths that bypass or soften authentication

use crate::config::AuthConfig;

/// Paths that never go through the chain.
const UNPROTECTED_EXACT: [&str; 7] = [
    "/",
    "/login",
    "/status.php",
    "/favicon.ico",
    "/.well-known/openid-configuration",
    "/.well-known/webfinger",
    "/backchannel_logout",
];

/// Path prefixes that never go through the chain.
const UNPROTECTED_PREFIXES: [&str; 5] = ["/konnect/", "/js/", "/themes/", "/signin/", "/branding/logo"];

/// Paths that pass through anonymously when every authenticator declines.
const PUBLIC_PREFIXES: [&str; 7] = [
    "/dav/public-files/",
    "/remote.php/dav/public-files/",
    "/ocs/v1.php/apps/files_sharing/api/v1/tokeninfo/unprotected",
    "/ocs/v2.php/apps/files_sharing/api/v1/tokeninfo/unprotected",
    "/ocs/v1.php/cloud/capabilities",
    "/ocs/v2.php/cloud/capabilities",
    "/data",
];

/// Token endpoint of the built-in IdP; always exempt.
pub const TOKEN_ENDPOINT: &str = "/konnect/v1/token";

/// Built-in plus configured path tables.
#[derive(Debug, Clone, Default)]
pub struct PathRules {
    unprotected: Vec<String>,
    public: Vec<String>,
}

impl PathRules {
    /// Extend the built-in tables with configured extras.
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            unprotected: config.unprotected_paths.clone(),
            public: config.public_paths.clone(),
        }
    }

    /// Whether `path` is exempt from authentication.
    ///
    /// Configured extras ending in `/` are prefixes, the rest exact paths.
    pub fn is_unprotected(&self, path: &str) -> bool {
        UNPROTECTED_EXACT.contains(&path)
            || UNPROTECTED_PREFIXES.iter().any(|p| path.starts_with(p))
            || self.unprotected.iter().any(|p| {
                if p.ends_with('/') {
                    path.starts_with(p.as_str())
                } else {
                    path == p
                }
            })
    }

    /// Whether `path` may be served anonymously after a failed chain.
    pub fn is_public(&self, path: &str) -> bool {
        PUBLIC_PREFIXES.iter().any(|p| path.starts_with(p))
            || self.public.iter().any(|p| path.starts_with(p.as_str()))
    }
}

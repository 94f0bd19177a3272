//! Configuration management

use std::{
    collections::{HashMap, HashSet},
    env,
    path::Path,
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Claim values accepted for `identity.user_cs3_claim`.
pub const USER_CS3_CLAIMS: [&str; 3] = ["username", "mail", "userid"];

/// User properties the regex policy selector can match on.
pub const REGEX_SELECTOR_PROPERTIES: [&str; 3] = ["mail", "username", "id"];

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Policy selector (at most one variant); the first policy is used when absent.
    pub policy_selector: Option<PolicySelectorConfig>,
    /// Routing policies, in declaration order.
    pub policies: Vec<PolicyConfig>,
    /// Logical services resolvable by routes.
    pub services: HashMap<String, ServiceConfig>,
    /// OIDC provider settings.
    pub oidc: OidcConfig,
    /// Authentication chain settings.
    pub auth: AuthConfig,
    /// Signed URL settings.
    pub pre_signed_url: PreSignedUrlConfig,
    /// Identity resolution settings.
    pub identity: IdentityConfig,
    /// Role assignment settings.
    pub role_assignment: RoleAssignmentConfig,
    /// Seed data for the in-memory directory.
    pub directory: DirectoryConfig,
    /// Skip TLS verification when talking to backends.
    pub insecure_backends: bool,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Timeout for establishing upstream connections.
    #[serde(with = "humantime_serde")]
    pub upstream_connect_timeout: Duration,
    /// Idle read timeout on upstream responses.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Scheme assumed for the public URL when no `X-Forwarded-Proto` is sent.
    pub public_scheme: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9200,
            upstream_connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            public_scheme: "https".to_string(),
        }
    }
}

/// Policy selector configuration. Exactly one variant may be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySelectorConfig {
    /// Always select one policy.
    #[serde(rename = "static")]
    pub static_policy: Option<StaticSelectorConfig>,
    /// Select by routing claim or cookie.
    pub claims: Option<ClaimsSelectorConfig>,
    /// Select by regex rules over user properties.
    pub regex: Option<RegexSelectorConfig>,
}

impl PolicySelectorConfig {
    fn variant_count(&self) -> usize {
        usize::from(self.static_policy.is_some())
            + usize::from(self.claims.is_some())
            + usize::from(self.regex.is_some())
    }
}

/// Static selector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticSelectorConfig {
    /// Policy name
    pub policy: String,
}

/// Claims based selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimsSelectorConfig {
    /// Policy for authenticated requests without a routing claim or cookie.
    pub default_policy: String,
    /// Policy for requests without identity.
    pub unauthenticated_policy: String,
    /// Cookie carrying a previously selected policy.
    #[serde(default)]
    pub selector_cookie_name: Option<String>,
}

/// Regex based selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegexSelectorConfig {
    /// Policy when no rule matches.
    pub default_policy: String,
    /// Policy for requests without a resolved user.
    pub unauthenticated_policy: String,
    /// Rules, evaluated by ascending priority.
    #[serde(default)]
    pub matches_policies: Vec<RegexRuleConfig>,
    /// Cookie that remembers the selected policy.
    #[serde(default)]
    pub selector_cookie_name: Option<String>,
}

/// One regex selector rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegexRuleConfig {
    /// Lower numbers win.
    pub priority: i32,
    /// `mail`, `username` or `id`.
    pub property: String,
    /// Regular expression
    #[serde(rename = "match")]
    pub pattern: String,
    /// Policy to select on match.
    pub policy: String,
}

/// A named routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Unique policy name.
    pub name: String,
    /// Ordered routes
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Route match strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    /// Path prefix match.
    #[default]
    Prefix,
    /// Path prefix plus required query pairs.
    Query,
    /// Regex over path and query.
    Regex,
}

impl RouteType {
    /// Order in which strategies are tried; more specific first.
    pub const PRECEDENCE: [Self; 3] = [Self::Query, Self::Regex, Self::Prefix];
}

impl std::fmt::Display for RouteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Prefix => "prefix",
            Self::Query => "query",
            Self::Regex => "regex",
        };
        f.write_str(name)
    }
}

/// A single route.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Match strategy
    #[serde(rename = "type")]
    pub route_type: RouteType,
    /// Optional method filter.
    pub method: Option<String>,
    /// Endpoint pattern
    pub endpoint: String,
    /// Static backend URL.
    pub backend: Option<String>,
    /// Logical service name.
    pub service: Option<String>,
    /// Rewrite the outgoing Host header to the backend host.
    pub apache_vhost: bool,
    /// Skip the authentication chain.
    pub unprotected: bool,
}

/// Node selection strategy for a logical service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    /// Cycle through nodes.
    #[default]
    RoundRobin,
    /// Pick a random healthy node.
    Random,
}

/// A logical service and its registered nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Selection strategy
    pub strategy: LoadBalancing,
    /// Registered nodes
    pub nodes: Vec<ServiceNodeConfig>,
    /// How long a failed node is skipped.
    #[serde(with = "humantime_serde")]
    pub failure_cooldown: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancing::default(),
            nodes: Vec::new(),
            failure_cooldown: Duration::from_secs(10),
        }
    }
}

/// A registered service node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceNodeConfig {
    /// `host:port`
    pub address: String,
    /// URL scheme used to reach the node.
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "http".to_string()
}

/// How OIDC access tokens are verified before userinfo is trusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessTokenVerifyMethod {
    /// Verify the access token as a signed JWT against the provider JWKS.
    #[default]
    Jwt,
    /// Treat the access token as opaque.
    None,
}

/// OIDC provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// Issuer URL; empty disables OIDC.
    pub issuer: String,
    /// Skip TLS verification towards the provider.
    pub insecure: bool,
    /// Access token verification mode.
    pub access_token_verify_method: AccessTokenVerifyMethod,
    /// Use access token claims instead of calling userinfo.
    pub skip_user_info: bool,
    /// Serve the provider's discovery document under our own well-known path.
    pub rewrite_well_known: bool,
    /// Claims cache settings.
    pub user_info_cache: UserInfoCacheConfig,
    /// Key set refresh settings.
    pub jwks: JwksConfig,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            insecure: false,
            access_token_verify_method: AccessTokenVerifyMethod::Jwt,
            skip_user_info: false,
            rewrite_well_known: false,
            user_info_cache: UserInfoCacheConfig::default(),
            jwks: JwksConfig::default(),
        }
    }
}

impl OidcConfig {
    /// Whether an OIDC provider is configured.
    pub fn enabled(&self) -> bool {
        !self.issuer.is_empty()
    }
}

/// Claims cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserInfoCacheConfig {
    /// Default TTL when the token carries no expiry.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Maximum cached tokens.
    pub size: usize,
}

impl Default for UserInfoCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            size: 1024,
        }
    }
}

/// JWKS refresh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwksConfig {
    /// Background refresh period.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Timeout for a single fetch.
    #[serde(with = "humantime_serde")]
    pub refresh_timeout: Duration,
    /// Minimum time between on-demand refreshes.
    #[serde(with = "humantime_serde")]
    pub refresh_limit: Duration,
    /// Refresh when a token names an unknown key id.
    pub refresh_unknown_kid: bool,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60 * 60),
            refresh_timeout: Duration::from_secs(10),
            refresh_limit: Duration::from_secs(60),
            refresh_unknown_kid: true,
        }
    }
}

/// Challenge schemes advertised on 401 responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeScheme {
    /// `WWW-Authenticate: Basic`
    Basic,
    /// `WWW-Authenticate: Bearer`
    Bearer,
}

impl ChallengeScheme {
    /// Title-cased scheme name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "Basic",
            Self::Bearer => "Bearer",
        }
    }
}

/// Authentication chain configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable the basic authenticator (testing and development only).
    pub enable_basic_auth: bool,
    /// Enable app password authentication.
    pub enable_app_auth: bool,
    /// Deadline for the whole authentication phase.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// User agent substring -> single challenge scheme.
    pub credentials_by_user_agent: HashMap<String, ChallengeScheme>,
    /// Extra paths exempt from authentication.
    pub unprotected_paths: Vec<String>,
    /// Extra paths that pass through anonymously when authentication fails.
    pub public_paths: Vec<String>,
    /// Client API keys.
    pub api_keys: Vec<ApiKeyConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enable_basic_auth: false,
            enable_app_auth: false,
            timeout: Duration::from_secs(10),
            credentials_by_user_agent: HashMap::new(),
            unprotected_paths: Vec::new(),
            public_paths: Vec::new(),
            api_keys: Vec::new(),
        }
    }
}

/// API key configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// The API key value (supports `env:VAR_NAME`).
    pub key: String,

    /// Human-readable name for this client.
    #[serde(default)]
    pub name: String,

    /// Username the key acts as.
    pub username: String,

    /// Rate limit (requests per minute, 0 = unlimited).
    #[serde(default)]
    pub rate_limit: u32,
}

impl ApiKeyConfig {
    /// Resolve the API key (expand env vars).
    #[must_use]
    pub fn resolve_key(&self) -> String {
        if let Some(var_name) = self.key.strip_prefix("env:") {
            env::var(var_name).unwrap_or_else(|_| self.key.clone())
        } else {
            self.key.clone()
        }
    }
}

/// Signed URL configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreSignedUrlConfig {
    /// Enable the signed URL authenticator.
    pub enabled: bool,
    /// Methods a signed URL may be used with.
    pub allowed_http_methods: Vec<String>,
}

impl Default for PreSignedUrlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_http_methods: vec!["GET".to_string()],
        }
    }
}

/// Identity resolution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Claim path holding the external user id.
    pub user_oidc_claim: String,
    /// Attribute used to look the user up (`username`, `mail`, `userid`).
    pub user_cs3_claim: String,
    /// Create unknown users from their claims.
    pub auto_provision_accounts: bool,
    /// Minimum time between group syncs for one user.
    #[serde(with = "humantime_serde")]
    pub group_sync_ttl: Duration,
    /// Claim names used when provisioning.
    pub auto_provision_claims: AutoProvisionClaims,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_oidc_claim: "preferred_username".to_string(),
            user_cs3_claim: "username".to_string(),
            auto_provision_accounts: false,
            group_sync_ttl: Duration::from_secs(5 * 60),
            auto_provision_claims: AutoProvisionClaims::default(),
        }
    }
}

/// Claim names read when creating or updating users.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoProvisionClaims {
    /// Username claim
    pub username: String,
    /// Mail claim
    pub email: String,
    /// Display name claim.
    pub display_name: String,
    /// Groups claim
    pub groups: String,
}

impl Default for AutoProvisionClaims {
    fn default() -> Self {
        Self {
            username: "preferred_username".to_string(),
            email: "email".to_string(),
            display_name: "name".to_string(),
            groups: "groups".to_string(),
        }
    }
}

/// Role assignment driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleDriver {
    /// Give users without a role the default user role.
    #[default]
    Default,
    /// Derive the role from a claim.
    Oidc,
}

/// Role assignment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleAssignmentConfig {
    /// Driver
    pub driver: RoleDriver,
    /// Claim mapping for the `oidc` driver.
    pub oidc_role_mapper: OidcRoleMapperConfig,
}

/// Maps claim values to role names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcRoleMapperConfig {
    /// Claim holding role values.
    pub role_claim: String,
    /// Ordered mapping, first match wins.
    pub role_mapping: Vec<RoleMappingConfig>,
}

impl Default for OidcRoleMapperConfig {
    fn default() -> Self {
        Self {
            role_claim: "roles".to_string(),
            role_mapping: Vec::new(),
        }
    }
}

/// One claim value -> role name mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleMappingConfig {
    /// Role name (`admin`, `spaceadmin`, `user`, `user-light`).
    pub role_name: String,
    /// Claim value that grants it.
    pub claim_value: String,
}

/// Seed data for the in-memory directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Users
    pub users: Vec<DirectoryUser>,
    /// Public link shares.
    pub public_shares: Vec<PublicShareConfig>,
    /// Signing keys by user id.
    pub signing_keys: HashMap<String, String>,
    /// Role ids by user id.
    pub role_assignments: HashMap<String, Vec<String>>,
}

/// A directory user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryUser {
    /// Opaque id
    pub id: String,
    /// Login name
    pub username: String,
    /// Display name
    #[serde(default)]
    pub display_name: String,
    /// Mail address
    #[serde(default)]
    pub mail: String,
    /// Identity provider
    #[serde(default)]
    pub idp: String,
    /// Password for basic auth.
    #[serde(default)]
    pub password: Option<String>,
    /// App passwords
    #[serde(default)]
    pub app_passwords: Vec<String>,
    /// Group names
    #[serde(default)]
    pub groups: Vec<String>,
    /// Disabled users cannot sign in.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// A public link share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicShareConfig {
    /// Share token
    pub token: String,
    /// Password protecting the share.
    #[serde(default)]
    pub password: Option<String>,
    /// Secret used to sign share links.
    #[serde(default)]
    pub signing_secret: Option<String>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("EDGE_PROXY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files first so ${VAR} expansion can see them
        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!(path = %expanded, "Loaded env file"),
                    Err(e) => tracing::warn!(path = %expanded, error = %e, "Failed to load env file"),
                }
            } else {
                tracing::debug!(path = %expanded, "Env file not found (skipped)");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} in backend URLs and secrets.
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for route in self.policies.iter_mut().flat_map(|p| p.routes.iter_mut()) {
            if let Some(backend) = route.backend.as_mut() {
                *backend = Self::expand_string(&re, backend);
            }
        }
        for api_key in &mut self.auth.api_keys {
            api_key.key = Self::expand_string(&re, &api_key.key);
        }
        for key in self.directory.signing_keys.values_mut() {
            *key = Self::expand_string(&re, key);
        }
        for user in &mut self.directory.users {
            if let Some(password) = user.password.as_mut() {
                *password = Self::expand_string(&re, password);
            }
        }
        self.oidc.issuer = Self::expand_string(&re, &self.oidc.issuer);

        Ok(())
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Check cross-field consistency. Any error here must stop startup.
    pub fn validate(&self) -> Result<()> {
        if self.policies.is_empty() {
            return Err(Error::config("at least one policy must be configured"));
        }

        let mut names = HashSet::new();
        for policy in &self.policies {
            if !names.insert(policy.name.as_str()) {
                return Err(Error::config(format!("duplicate policy '{}'", policy.name)));
            }
            for route in &policy.routes {
                match (&route.backend, &route.service) {
                    (Some(_), None) | (None, Some(_)) => {}
                    _ => {
                        return Err(Error::config(format!(
                            "route '{}' in policy '{}' needs exactly one of backend or service",
                            route.endpoint, policy.name
                        )));
                    }
                }
                if let Some(backend) = &route.backend {
                    url::Url::parse(backend).map_err(|e| {
                        Error::config(format!(
                            "route '{}' in policy '{}' has invalid backend '{backend}': {e}",
                            route.endpoint, policy.name
                        ))
                    })?;
                }
                if route.route_type == RouteType::Regex {
                    Regex::new(&route.endpoint).map_err(|e| {
                        Error::config(format!(
                            "route '{}' in policy '{}' is not a valid regex: {e}",
                            route.endpoint, policy.name
                        ))
                    })?;
                }
                if let Some(service) = &route.service {
                    if !self.services.contains_key(service) {
                        tracing::warn!(
                            policy = %policy.name,
                            service = %service,
                            "Route targets a service with no configured nodes"
                        );
                    }
                }
            }
        }

        if let Some(selector) = &self.policy_selector {
            if selector.variant_count() > 1 {
                return Err(Error::config(
                    "policy_selector must configure only one of static, claims or regex",
                ));
            }
            for referenced in self.selector_policies() {
                if !names.contains(referenced) {
                    return Err(Error::config(format!(
                        "policy selector references unknown policy '{referenced}'"
                    )));
                }
            }
            if let Some(regex) = &selector.regex {
                for rule in &regex.matches_policies {
                    if !REGEX_SELECTOR_PROPERTIES.contains(&rule.property.as_str()) {
                        return Err(Error::config(format!(
                            "regex selector property '{}' is not supported",
                            rule.property
                        )));
                    }
                }
            }
        }

        if !USER_CS3_CLAIMS.contains(&self.identity.user_cs3_claim.as_str()) {
            return Err(Error::config(format!(
                "user_cs3_claim must be one of {USER_CS3_CLAIMS:?}, got '{}'",
                self.identity.user_cs3_claim
            )));
        }

        for (name, service) in &self.services {
            if service.nodes.is_empty() {
                tracing::warn!(service = %name, "Service has no nodes");
            }
        }

        Ok(())
    }

    /// Policy names referenced statically by the selector configuration.
    fn selector_policies(&self) -> Vec<&str> {
        let Some(selector) = &self.policy_selector else {
            return Vec::new();
        };
        let mut out = Vec::new();
        if let Some(s) = &selector.static_policy {
            out.push(s.policy.as_str());
        }
        if let Some(c) = &selector.claims {
            out.push(c.default_policy.as_str());
            out.push(c.unauthenticated_policy.as_str());
        }
        if let Some(r) = &selector.regex {
            out.push(r.default_policy.as_str());
            out.push(r.unauthenticated_policy.as_str());
            out.extend(r.matches_policies.iter().map(|m| m.policy.as_str()));
        }
        out
    }
}

/// Human-readable duration serialization (e.g., "30s", "5m", "100ms").
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s").
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms").
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        // "ms" before "s" and "m", both of which it ends with
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_policy(name: &str) -> PolicyConfig {
        PolicyConfig {
            name: name.to_string(),
            routes: vec![RouteConfig {
                endpoint: "/".to_string(),
                backend: Some("http://localhost:9100".to_string()),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "EDGE_PROXY_TEST_KEY_A=hello_from_env_file").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(
            env::var("EDGE_PROXY_TEST_KEY_A").unwrap(),
            "hello_from_env_file"
        );
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.oidc.access_token_verify_method, AccessTokenVerifyMethod::Jwt);
        assert_eq!(config.identity.group_sync_ttl, Duration::from_secs(300));
        assert_eq!(config.pre_signed_url.allowed_http_methods, vec!["GET"]);
        assert!(config.pre_signed_url.enabled);
        assert!(!config.oidc.enabled());
    }

    #[test]
    fn test_route_yaml_parsing() {
        let yaml = r#"
policies:
  - name: ocis
    routes:
      - endpoint: /
        backend: http://localhost:9100
      - type: query
        endpoint: /remote.php/?preview=1
        backend: http://localhost:9115
      - type: regex
        method: GET
        endpoint: /ocs/v[12].php/cloud/(users?|groups)
        service: graph
        unprotected: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let routes = &config.policies[0].routes;
        assert_eq!(routes[0].route_type, RouteType::Prefix);
        assert_eq!(routes[1].route_type, RouteType::Query);
        assert_eq!(routes[2].route_type, RouteType::Regex);
        assert_eq!(routes[2].method.as_deref(), Some("GET"));
        assert_eq!(routes[2].service.as_deref(), Some("graph"));
        assert!(routes[2].unprotected);
    }

    #[test]
    fn test_validate_rejects_empty_policies() {
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn test_validate_rejects_route_with_both_targets() {
        let mut policy = minimal_policy("ocis");
        policy.routes[0].service = Some("web".to_string());
        let config = Config {
            policies: vec![policy],
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("exactly one"), "{err}");
    }

    #[test]
    fn test_validate_rejects_unknown_selector_policy() {
        let config = Config {
            policies: vec![minimal_policy("ocis")],
            policy_selector: Some(PolicySelectorConfig {
                static_policy: Some(StaticSelectorConfig {
                    policy: "oc10".to_string(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_two_selectors() {
        let config = Config {
            policies: vec![minimal_policy("ocis")],
            policy_selector: Some(PolicySelectorConfig {
                static_policy: Some(StaticSelectorConfig {
                    policy: "ocis".to_string(),
                }),
                claims: Some(ClaimsSelectorConfig {
                    default_policy: "ocis".to_string(),
                    unauthenticated_policy: "ocis".to_string(),
                    selector_cookie_name: None,
                }),
                regex: None,
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_cs3_claim() {
        let mut config = Config {
            policies: vec![minimal_policy("ocis")],
            ..Default::default()
        };
        config.identity.user_cs3_claim = "uid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_backend_and_regex() {
        let mut policy = minimal_policy("ocis");
        policy.routes[0].backend = Some("not a url".to_string());
        let config = Config {
            policies: vec![policy],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut policy = minimal_policy("ocis");
        policy.routes.push(RouteConfig {
            route_type: RouteType::Regex,
            endpoint: "/ocs/(unclosed".to_string(),
            backend: Some("http://localhost:9110".to_string()),
            ..Default::default()
        });
        let config = Config {
            policies: vec![policy],
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("regex"), "{err}");
    }

    #[test]
    fn test_humantime_parsing() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(with = "humantime_serde")]
            d: Duration,
        }
        let parse = |s: &str| {
            serde_yaml::from_str::<Wrapper>(&format!("d: {s}"))
                .unwrap()
                .d
        };
        assert_eq!(parse("30s"), Duration::from_secs(30));
        assert_eq!(parse("5m"), Duration::from_secs(300));
        assert_eq!(parse("100ms"), Duration::from_millis(100));
        assert_eq!(parse("1h"), Duration::from_secs(3600));
        assert_eq!(parse("7"), Duration::from_secs(7));
    }

    #[test]
    fn test_load_from_file_and_expand() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.yaml");
        std::fs::write(
            &path,
            r"
policies:
  - name: ocis
    routes:
      - endpoint: /
        backend: http://${EDGE_PROXY_TEST_UNSET_HOST:-localhost}:9100
oidc:
  issuer: https://idp.example.com
  jwks:
    refresh_limit: 30s
",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(
            config.policies[0].routes[0].backend.as_deref(),
            Some("http://localhost:9100")
        );
        assert_eq!(config.oidc.jwks.refresh_limit, Duration::from_secs(30));
        assert!(config.oidc.enabled());
        config.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = Config::load(Some(Path::new("/nonexistent/proxy.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}

//! Policy selection

use axum::http::{HeaderMap, header, request::Parts};
use regex::Regex;

use crate::claims::ROUTING_POLICY_CLAIM;
use crate::config::{
    ClaimsSelectorConfig, PolicyConfig, PolicySelectorConfig, RegexSelectorConfig,
};
use crate::identity::{Identity, User};

/// Selector construction and selection failures.
#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    /// No policies to fall back on.
    #[error("no policies configured")]
    NoPolicies,

    /// More than one selector configured.
    #[error("only one policy selector may be configured")]
    Ambiguous,

    /// Regex rule on a property we cannot read.
    #[error("unsupported regex selector property '{0}'")]
    UnsupportedProperty(String),

    /// Regex rule does not compile.
    #[error("invalid regex selector rule '{pattern}': {reason}")]
    InvalidRule {
        /// Offending pattern
        pattern: String,
        /// Compiler message
        reason: String,
    },

    /// Selection produced an empty policy name.
    #[error("policy selector returned an empty policy name")]
    EmptyPolicy,
}

/// Chooses the routing policy for a request.
#[derive(Debug)]
pub enum PolicySelector {
    /// Always the same policy.
    Static {
        /// Policy name
        policy: String,
    },
    /// Routing claim, then cookie, then defaults.
    Claims(ClaimsSelector),
    /// Regex rules over user properties.
    Regex(RegexSelector),
}

/// Claims based selector.
#[derive(Debug)]
pub struct ClaimsSelector {
    default_policy: String,
    unauthenticated_policy: String,
    cookie_name: Option<String>,
}

/// Regex based selector.
#[derive(Debug)]
pub struct RegexSelector {
    default_policy: String,
    unauthenticated_policy: String,
    rules: Vec<RegexRule>,
    cookie_name: Option<String>,
}

#[derive(Debug)]
struct RegexRule {
    priority: i32,
    property: UserProperty,
    pattern: Regex,
    policy: String,
}

#[derive(Debug, Clone, Copy)]
enum UserProperty {
    Mail,
    Username,
    Id,
}

impl UserProperty {
    fn parse(name: &str) -> Result<Self, SelectorError> {
        match name {
            "mail" => Ok(Self::Mail),
            "username" => Ok(Self::Username),
            "id" => Ok(Self::Id),
            other => Err(SelectorError::UnsupportedProperty(other.to_string())),
        }
    }

    fn read(self, user: &User) -> &str {
        match self {
            Self::Mail => &user.mail,
            Self::Username => &user.username,
            Self::Id => &user.id,
        }
    }
}

impl PolicySelector {
    /// Build from config. Without a selector block the first policy is used.
    pub fn from_config(
        config: Option<&PolicySelectorConfig>,
        policies: &[PolicyConfig],
    ) -> Result<Self, SelectorError> {
        let Some(config) = config else {
            let first = policies.first().ok_or(SelectorError::NoPolicies)?;
            return Ok(Self::Static {
                policy: first.name.clone(),
            });
        };

        match (&config.static_policy, &config.claims, &config.regex) {
            (Some(s), None, None) => Ok(Self::Static {
                policy: s.policy.clone(),
            }),
            (None, Some(c), None) => Ok(Self::Claims(ClaimsSelector::new(c))),
            (None, None, Some(r)) => Ok(Self::Regex(RegexSelector::new(r)?)),
            (None, None, None) => {
                let first = policies.first().ok_or(SelectorError::NoPolicies)?;
                Ok(Self::Static {
                    policy: first.name.clone(),
                })
            }
            _ => Err(SelectorError::Ambiguous),
        }
    }

    /// Select the policy for a request.
    pub fn select(&self, parts: &Parts, identity: &Identity) -> Result<String, SelectorError> {
        let policy = match self {
            Self::Static { policy } => policy.clone(),
            Self::Claims(s) => s.select(&parts.headers, identity),
            Self::Regex(s) => s.select(identity),
        };
        if policy.is_empty() {
            return Err(SelectorError::EmptyPolicy);
        }
        Ok(policy)
    }

    /// Cookie that remembers the selection, if the selector uses one.
    pub fn cookie_name(&self) -> Option<&str> {
        match self {
            Self::Static { .. } => None,
            Self::Claims(s) => s.cookie_name.as_deref(),
            Self::Regex(s) => s.cookie_name.as_deref(),
        }
    }
}

impl ClaimsSelector {
    fn new(config: &ClaimsSelectorConfig) -> Self {
        Self {
            default_policy: config.default_policy.clone(),
            unauthenticated_policy: config.unauthenticated_policy.clone(),
            cookie_name: config.selector_cookie_name.clone().filter(|c| !c.is_empty()),
        }
    }

    fn select(&self, headers: &HeaderMap, identity: &Identity) -> String {
        if let Some(policy) = identity
            .claims
            .as_ref()
            .and_then(|c| c.get_str(ROUTING_POLICY_CLAIM))
            .filter(|p| !p.is_empty())
        {
            return policy.to_string();
        }

        if let Some(policy) = self
            .cookie_name
            .as_deref()
            .and_then(|name| read_cookie(headers, name))
        {
            return policy;
        }

        if identity.claims.is_some() || identity.user.is_some() {
            self.default_policy.clone()
        } else {
            self.unauthenticated_policy.clone()
        }
    }
}

impl RegexSelector {
    fn new(config: &RegexSelectorConfig) -> Result<Self, SelectorError> {
        let mut rules = config
            .matches_policies
            .iter()
            .map(|rule| {
                let pattern = Regex::new(&rule.pattern).map_err(|e| SelectorError::InvalidRule {
                    pattern: rule.pattern.clone(),
                    reason: e.to_string(),
                })?;
                Ok(RegexRule {
                    priority: rule.priority,
                    property: UserProperty::parse(&rule.property)?,
                    pattern,
                    policy: rule.policy.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        // Stable sort keeps config order among equal priorities
        rules.sort_by_key(|r| r.priority);

        Ok(Self {
            default_policy: config.default_policy.clone(),
            unauthenticated_policy: config.unauthenticated_policy.clone(),
            rules,
            cookie_name: config.selector_cookie_name.clone().filter(|c| !c.is_empty()),
        })
    }

    fn select(&self, identity: &Identity) -> String {
        let Some(user) = identity.user.as_ref() else {
            return self.unauthenticated_policy.clone();
        };
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(rule.property.read(user)))
            .map_or_else(|| self.default_policy.clone(), |rule| rule.policy.clone())
    }
}

/// Value of a request cookie, if present and non-empty.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::Claims;
    use crate::config::{RegexRuleConfig, StaticSelectorConfig};
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn parts(cookie: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/files");
        if let Some(c) = cookie {
            builder = builder.header(header::COOKIE, c);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn claims_selector(cookie: Option<&str>) -> PolicySelector {
        PolicySelector::from_config(
            Some(&PolicySelectorConfig {
                claims: Some(ClaimsSelectorConfig {
                    default_policy: "default".to_string(),
                    unauthenticated_policy: "anon".to_string(),
                    selector_cookie_name: cookie.map(str::to_string),
                }),
                ..Default::default()
            }),
            &[],
        )
        .unwrap()
    }

    fn with_claims(value: serde_json::Value) -> Identity {
        Identity {
            claims: Some(serde_json::from_value::<Claims>(value).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn test_claims_fallback_order() {
        let s = claims_selector(Some("owncloud-selector"));

        // claim wins over cookie
        let id = with_claims(json!({"ocis.routing.policy": "oc10"}));
        assert_eq!(s.select(&parts(Some("owncloud-selector=ocis")), &id).unwrap(), "oc10");

        // cookie beats defaults, authenticated or not
        let id = with_claims(json!({"sub": "x"}));
        assert_eq!(s.select(&parts(Some("a=b; owncloud-selector=ocis")), &id).unwrap(), "ocis");
        assert_eq!(
            s.select(&parts(Some("owncloud-selector=ocis")), &Identity::anonymous()).unwrap(),
            "ocis"
        );

        // empty claim and empty cookie are ignored
        let id = with_claims(json!({"ocis.routing.policy": ""}));
        assert_eq!(s.select(&parts(Some("owncloud-selector=")), &id).unwrap(), "default");

        assert_eq!(s.select(&parts(None), &Identity::anonymous()).unwrap(), "anon");
    }

    #[test]
    fn test_claims_without_cookie_name_ignores_cookies() {
        let s = claims_selector(None);
        assert_eq!(
            s.select(&parts(Some("owncloud-selector=ocis")), &Identity::anonymous()).unwrap(),
            "anon"
        );
        assert!(s.cookie_name().is_none());
    }

    fn regex_config(rules: Vec<RegexRuleConfig>) -> PolicySelectorConfig {
        PolicySelectorConfig {
            regex: Some(RegexSelectorConfig {
                default_policy: "default".to_string(),
                unauthenticated_policy: "anon".to_string(),
                matches_policies: rules,
                selector_cookie_name: None,
            }),
            ..Default::default()
        }
    }

    fn rule(priority: i32, property: &str, pattern: &str, policy: &str) -> RegexRuleConfig {
        RegexRuleConfig {
            priority,
            property: property.to_string(),
            pattern: pattern.to_string(),
            policy: policy.to_string(),
        }
    }

    #[test]
    fn test_regex_priority_order() {
        let s = PolicySelector::from_config(
            Some(&regex_config(vec![
                rule(20, "username", ".*", "catch-all"),
                rule(10, "mail", "@example\\.org$", "org"),
            ])),
            &[],
        )
        .unwrap();

        let identity = |mail: &str| Identity {
            user: Some(User {
                id: "1".to_string(),
                username: "alice".to_string(),
                mail: mail.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(s.select(&parts(None), &identity("a@example.org")).unwrap(), "org");
        assert_eq!(s.select(&parts(None), &identity("a@example.com")).unwrap(), "catch-all");
        assert_eq!(s.select(&parts(None), &Identity::anonymous()).unwrap(), "anon");
    }

    #[test]
    fn test_regex_no_match_uses_default() {
        let s = PolicySelector::from_config(
            Some(&regex_config(vec![rule(1, "id", "^admin-", "admins")])),
            &[],
        )
        .unwrap();
        let identity = Identity {
            user: Some(User {
                id: "u-1".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(s.select(&parts(None), &identity).unwrap(), "default");
    }

    #[test]
    fn test_regex_rejects_unsupported_property() {
        let err = PolicySelector::from_config(
            Some(&regex_config(vec![rule(1, "displayname", ".*", "x")])),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, SelectorError::UnsupportedProperty(_)));
    }

    #[test]
    fn test_missing_selector_uses_first_policy() {
        let policies = vec![
            PolicyConfig {
                name: "ocis".to_string(),
                routes: vec![],
            },
            PolicyConfig {
                name: "oc10".to_string(),
                routes: vec![],
            },
        ];
        let s = PolicySelector::from_config(None, &policies).unwrap();
        assert_eq!(s.select(&parts(None), &Identity::anonymous()).unwrap(), "ocis");
        assert!(matches!(
            PolicySelector::from_config(None, &[]),
            Err(SelectorError::NoPolicies)
        ));
    }

    #[test]
    fn test_two_selectors_rejected() {
        let config = PolicySelectorConfig {
            static_policy: Some(StaticSelectorConfig {
                policy: "ocis".to_string(),
            }),
            regex: regex_config(vec![]).regex,
            ..Default::default()
        };
        assert!(matches!(
            PolicySelector::from_config(Some(&config), &[]),
            Err(SelectorError::Ambiguous)
        ));
    }
}

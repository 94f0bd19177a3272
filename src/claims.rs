//! Token claims and claim-path lookup

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Claim carrying the routing policy for the claims selector.
pub const ROUTING_POLICY_CLAIM: &str = "ocis.routing.policy";

/// Claim set by the basic authenticator with the user's opaque id.
pub const OWNCLOUD_UUID_CLAIM: &str = "ownCloudUUID";

/// String-keyed claims derived from a token or userinfo response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    /// Empty claim set.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Raw value of a top-level claim.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Top-level claim as a string.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Set a top-level claim.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// `exp` as unix seconds.
    #[allow(clippy::cast_possible_truncation)]
    pub fn expires_at(&self) -> Option<i64> {
        self.0.get("exp").and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_f64().map(|f| f as i64))
        })
    }

    /// Session id (`sid`).
    pub fn session_id(&self) -> Option<&str> {
        self.get_str("sid").filter(|s| !s.is_empty())
    }

    /// Claim as a list of strings. A single string counts as a one-element list.
    pub fn get_strings(&self, name: &str) -> Vec<String> {
        match self.0.get(name) {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Resolve a claim path to a non-empty string.
    ///
    /// The whole path is tried as a top-level key first. Otherwise it is
    /// split on `.` (`\.` is a literal dot) and walked through nested objects.
    pub fn lookup_path(&self, path: &str) -> Option<&str> {
        if let Some(value) = self.get_str(path).filter(|s| !s.is_empty()) {
            return Some(value);
        }

        let segments = split_with_escaping(path, '.', '\\');
        let (last, parents) = segments.split_last()?;
        let mut current = &self.0;
        for segment in parents {
            current = current.get(segment.as_str())?.as_object()?;
        }
        current
            .get(last.as_str())
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Consume into the underlying map.
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Claims {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Split `s` on `sep`, treating `esc` followed by `sep` as a literal separator.
pub fn split_with_escaping(s: &str, sep: char, esc: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == esc && chars.peek() == Some(&sep) {
            current.push(sep);
            chars.next();
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: Value) -> Claims {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_split_with_escaping() {
        assert_eq!(split_with_escaping("a.b.c", '.', '\\'), vec!["a", "b", "c"]);
        assert_eq!(split_with_escaping(r"a\.b.c", '.', '\\'), vec!["a.b", "c"]);
        assert_eq!(split_with_escaping("abc", '.', '\\'), vec!["abc"]);
        assert_eq!(split_with_escaping(r"a\b", '.', '\\'), vec![r"a\b"]);
    }

    #[test]
    fn test_lookup_direct_key_with_dots() {
        let c = claims(json!({"ocis.routing.policy": "oc10"}));
        assert_eq!(c.lookup_path("ocis.routing.policy"), Some("oc10"));
    }

    #[test]
    fn test_lookup_nested_path() {
        let c = claims(json!({
            "ext": {"user": {"id": "u-1"}},
            "odd.key": {"v": "x"}
        }));
        assert_eq!(c.lookup_path("ext.user.id"), Some("u-1"));
        assert_eq!(c.lookup_path(r"odd\.key.v"), Some("x"));
        assert_eq!(c.lookup_path("ext.user.missing"), None);
        assert_eq!(c.lookup_path("ext.user"), None);
    }

    #[test]
    fn test_lookup_empty_value_is_none() {
        let c = claims(json!({"preferred_username": ""}));
        assert_eq!(c.lookup_path("preferred_username"), None);
    }

    #[test]
    fn test_get_strings_accepts_string_or_array() {
        let c = claims(json!({"roles": "admin", "groups": ["a", "b", 3]}));
        assert_eq!(c.get_strings("roles"), vec!["admin"]);
        assert_eq!(c.get_strings("groups"), vec!["a", "b"]);
        assert!(c.get_strings("missing").is_empty());
    }

    #[test]
    fn test_expiry_and_sid() {
        let c = claims(json!({"exp": 1_700_000_000, "sid": "s1"}));
        assert_eq!(c.expires_at(), Some(1_700_000_000));
        assert_eq!(c.session_id(), Some("s1"));
    }
}

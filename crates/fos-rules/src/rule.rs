//! Rule model
//!
//! The persisted shape of a rule is also the import/export unit, so the
//! serde layout here is the wire format (camelCase keys).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// What a rule connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    /// A specific logical server, referenced by id
    Server,
    /// Any eligible server in a country, referenced by country code
    Country,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Server => "server",
            TargetType::Country => "country",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

/// A routing rule.
///
/// `host` is lowercase without a leading `www.`. `path` is either absent
/// (any path) or starts with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub include_subdomains: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub target_type: TargetType,
    pub target_id: String,
    pub target_label: String,
}

/// Uniqueness key of a rule: `(host, path-or-empty, includeSubdomains)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub host: String,
    pub path: String,
    pub include_subdomains: bool,
}

impl Rule {
    /// Generate a fresh opaque rule id (`<millis>-<hex>`).
    pub fn generate_id() -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        format!("{}-{:x}", millis, rand::random::<u64>())
    }

    pub fn key(&self) -> RuleKey {
        RuleKey {
            host: self.host.clone(),
            path: self.path.clone().unwrap_or_default(),
            include_subdomains: self.include_subdomains,
        }
    }

    /// `"type:label"` descriptor used in debug events.
    pub fn target_descriptor(&self) -> String {
        format!("{}:{}", self.target_type, self.target_label)
    }

    /// Display form of the rule's site pattern.
    pub fn host_label(&self) -> String {
        crate::matcher::host_label(&self.host, self.path.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_json_layout() {
        let json = r#"{
            "id": "r1",
            "host": "example.com",
            "includeSubdomains": true,
            "targetType": "country",
            "targetId": "DE",
            "targetLabel": "Germany"
        }"#;

        let rule: Rule = serde_json::from_str(json).unwrap();
        assert!(rule.enabled);
        assert!(rule.path.is_none());
        assert_eq!(rule.target_type, TargetType::Country);
        assert_eq!(rule.target_descriptor(), "country:Germany");

        let back = serde_json::to_value(&rule).unwrap();
        assert_eq!(back["includeSubdomains"], true);
        assert!(back.get("path").is_none());
    }

    #[test]
    fn test_rule_key_ignores_id() {
        let a = Rule {
            id: "a".into(),
            host: "example.com".into(),
            path: None,
            include_subdomains: false,
            enabled: true,
            target_type: TargetType::Server,
            target_id: "1".into(),
            target_label: "S1".into(),
        };
        let b = Rule { id: "b".into(), target_id: "2".into(), ..a.clone() };
        let c = Rule { path: Some("/docs".into()), ..a.clone() };

        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(Rule::generate_id(), Rule::generate_id());
    }
}

//! Rule import/export (JSON)
//!
//! Export format:
//!
//! ```json
//! { "version": 1, "rules": [ { "id": "...", "host": "example.com", ... } ] }
//! ```
//!
//! Import accepts that document or a bare array of rules. Items are read
//! leniently: invalid items are dropped, duplicates (same host, path and
//! subdomain scope) keep the first occurrence, missing ids are synthesized.
//! The import fails as a whole only when no valid rule remains.

use crate::matcher::{normalize_path, parse_url_input};
use crate::rule::{Rule, RuleKey, TargetType};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};

/// Version written into exported documents
pub const EXPORT_VERSION: u32 = 1;

/// Errors while importing a rules document
#[derive(Debug, Error)]
pub enum RuleImportError {
    #[error("Malformed rules document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("No valid rules found")]
    NoValidRules,
}

impl RuleImportError {
    /// Message shown to the user on the rules page.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "Failed to import rules.",
            Self::NoValidRules => "No valid rules found.",
        }
    }
}

#[derive(Serialize)]
struct ExportDocument<'a> {
    version: u32,
    rules: &'a [Rule],
}

/// Serialize rules as a downloadable `{version, rules}` document.
pub fn export_rules(rules: &[Rule]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&ExportDocument {
        version: EXPORT_VERSION,
        rules,
    })
}

/// Parse an imported document into a non-empty, de-duplicated rule list.
pub fn import_rules(content: &str) -> Result<Vec<Rule>, RuleImportError> {
    let document: Value = serde_json::from_str(content)?;

    let items = match &document {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("rules") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => return Err(RuleImportError::NoValidRules),
        },
        _ => return Err(RuleImportError::NoValidRules),
    };

    let mut seen: HashSet<RuleKey> = HashSet::new();
    let mut rules = Vec::new();

    for item in items {
        let Some(rule) = parse_item(item) else {
            debug!("Skipping invalid rule item");
            continue;
        };

        if !seen.insert(rule.key()) {
            debug!("Skipping duplicate rule for {}", rule.host_label());
            continue;
        }

        rules.push(rule);
    }

    if rules.is_empty() {
        return Err(RuleImportError::NoValidRules);
    }

    info!(
        "Imported {} rules ({} items in document)",
        rules.len(),
        items.len()
    );
    Ok(rules)
}

fn parse_item(item: &Value) -> Option<Rule> {
    let object = item.as_object()?;

    let parsed = parse_url_input(object.get("host")?.as_str()?)?;
    let path = match object.get("path").and_then(Value::as_str) {
        Some(raw) => normalize_path(raw),
        None => parsed.path,
    };

    let target_type = match object.get("targetType").and_then(Value::as_str) {
        Some(raw) if raw.eq_ignore_ascii_case("country") => TargetType::Country,
        _ => TargetType::Server,
    };

    let target_id = non_empty_str(object.get("targetId"))?;
    let target_label = non_empty_str(object.get("targetLabel"))?;

    let id = non_empty_str(object.get("id")).unwrap_or_else(Rule::generate_id);

    Some(Rule {
        id,
        host: parsed.host,
        path,
        include_subdomains: object.get("includeSubdomains").is_some_and(is_truthy),
        enabled: !matches!(object.get("enabled"), Some(Value::Bool(false))),
        target_type,
        target_id,
        target_label,
    })
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Loose boolean reading used for hand-edited documents.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

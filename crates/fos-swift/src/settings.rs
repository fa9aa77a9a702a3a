//! Persisted user settings
//!
//! The rule list and the two feature flags are owned by the UI. The engine
//! reads them and the helpers below perform the UI-side edits, always as a
//! full read-modify-write of the rule list.

use crate::store::{keys, StorageItem, Store, StoreError};
use crate::target::{resolve_target, TargetError};
use fos_rules::{import_rules, parse_url_input, Rule, RuleImportError, RuleSet, TargetType};
use fos_vpn::{Directory, DirectoryError};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const RULES_ITEM: StorageItem<Vec<Rule>> = StorageItem::new(keys::RULES);
pub const ENABLED_ITEM: StorageItem<bool> = StorageItem::new(keys::ENABLED);
pub const DISCONNECT_ON_UNMATCHED_ITEM: StorageItem<bool> =
    StorageItem::new(keys::DISCONNECT_ON_UNMATCHED);

/// Errors from rule-list edits, each with a message for the user
#[derive(Debug, Error)]
pub enum RuleEditError {
    #[error("Invalid website input")]
    InvalidHost,

    #[error("Target not resolved: {0}")]
    Target(#[from] TargetError),

    #[error("Import failed: {0}")]
    Import(#[from] RuleImportError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl RuleEditError {
    pub fn user_message(&self) -> String {
        match self {
            RuleEditError::InvalidHost => "Enter a valid website.".to_string(),
            RuleEditError::Target(e) => e.to_string(),
            RuleEditError::Import(e) => e.user_message().to_string(),
            RuleEditError::Directory(_) | RuleEditError::Store(_) => {
                "Something went wrong, please try again.".to_string()
            }
        }
    }
}

/// Snapshot of the settings the engine acts on
#[derive(Debug, Clone, PartialEq)]
pub struct SwiftSettings {
    pub rules: RuleSet,
    pub enabled: bool,
    pub disconnect_on_unmatched: bool,
}

impl Default for SwiftSettings {
    fn default() -> Self {
        Self {
            rules: RuleSet::new(),
            enabled: true,
            disconnect_on_unmatched: false,
        }
    }
}

impl SwiftSettings {
    /// Load everything, writing flag defaults back when absent.
    pub fn load(store: &dyn Store) -> Result<Self, StoreError> {
        Ok(Self {
            rules: load_rules(store)?,
            enabled: load_flag(store, &ENABLED_ITEM, true)?,
            disconnect_on_unmatched: load_flag(store, &DISCONNECT_ON_UNMATCHED_ITEM, false)?,
        })
    }

    pub fn reload_enabled(&mut self, store: &dyn Store) -> Result<bool, StoreError> {
        self.enabled = load_flag(store, &ENABLED_ITEM, true)?;
        Ok(self.enabled)
    }

    pub fn reload_disconnect_on_unmatched(&mut self, store: &dyn Store) -> Result<bool, StoreError> {
        self.disconnect_on_unmatched = load_flag(store, &DISCONNECT_ON_UNMATCHED_ITEM, false)?;
        Ok(self.disconnect_on_unmatched)
    }
}

/// Read the rule list, normalizing paths and defaulting `enabled`.
/// A never-written list is empty.
pub fn load_rules(store: &dyn Store) -> Result<RuleSet, StoreError> {
    let rules = RULES_ITEM.get(store)?.unwrap_or_default();
    Ok(RuleSet::from_stored(rules))
}

pub fn save_rules(store: &dyn Store, rules: &RuleSet) -> Result<(), StoreError> {
    RULES_ITEM.set(store, &rules.rules().to_vec())
}

/// Read a boolean flag. A missing or non-boolean value is replaced by
/// `default`, which is written back.
fn load_flag(
    store: &dyn Store,
    item: &StorageItem<bool>,
    default: bool,
) -> Result<bool, StoreError> {
    match item.get(store) {
        Ok(Some(value)) => return Ok(value),
        Ok(None) => debug!("{} not set, defaulting to {}", item.key(), default),
        Err(StoreError::Decode { .. }) => warn!("{} is not a boolean, resetting to {}", item.key(), default),
        Err(e) => return Err(e),
    }

    item.set(store, &default)?;
    Ok(default)
}

pub fn set_enabled(store: &dyn Store, enabled: bool) -> Result<(), StoreError> {
    ENABLED_ITEM.set(store, &enabled)
}

pub fn set_disconnect_on_unmatched(store: &dyn Store, disconnect: bool) -> Result<(), StoreError> {
    DISCONNECT_ON_UNMATCHED_ITEM.set(store, &disconnect)
}

/// Apply `edit` to the stored rule list and write it back.
///
/// Nothing is written when the list can't be read.
pub fn edit_rules<R>(
    store: &dyn Store,
    edit: impl FnOnce(&mut RuleSet) -> R,
) -> Result<R, StoreError> {
    let mut rules = load_rules(store)?;
    let result = edit(&mut rules);
    save_rules(store, &rules)?;
    Ok(result)
}

/// Replace the stored rules with an imported document.
///
/// The previous list stays untouched unless at least one valid rule was
/// parsed. Returns the number of imported rules.
pub fn import_rules_into(store: &dyn Store, content: &str) -> Result<usize, RuleEditError> {
    let rules = import_rules(content)?;
    let count = rules.len();
    save_rules(store, &RuleSet::from(rules))?;
    info!("Imported {} rules", count);
    Ok(count)
}

/// Create (or replace) a rule from what the user typed.
///
/// `url_input` may omit the scheme. `target_input` is a server id or name,
/// or a country code or name.
pub async fn add_rule_from_input(
    store: &dyn Store,
    directory: &dyn Directory,
    url_input: &str,
    target_type: TargetType,
    target_input: &str,
    include_subdomains: bool,
) -> Result<Rule, RuleEditError> {
    let parsed = parse_url_input(url_input).ok_or(RuleEditError::InvalidHost)?;

    let logicals = directory.logicals().await?;
    let user_tier = directory.user_max_tier().await?.unwrap_or(0);
    let target = resolve_target(
        target_type,
        target_input,
        &logicals,
        user_tier,
        &directory.countries(),
    )?;

    let rule = edit_rules(store, |rules| {
        rules
            .upsert(
                &parsed.host,
                parsed.path.as_deref(),
                include_subdomains,
                target_type,
                &target.target_id,
                &target.target_label,
            )
            .clone()
    })?;

    info!("Rule {} routes {} to {}", rule.id, rule.host_label(), rule.target_descriptor());
    Ok(rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use fos_rules::{export_rules, MoveDirection};
    use fos_vpn::{CountryEntry, DirectoryConfig, Logical, PhysicalServer, StaticDirectory};

    fn directory() -> StaticDirectory {
        StaticDirectory::new(DirectoryConfig {
            user_tier: Some(1),
            secure_core: None,
            countries: vec![CountryEntry {
                code: "CH".into(),
                name: "Switzerland".into(),
                english_name: None,
            }],
            logicals: vec![Logical {
                id: "7".into(),
                name: "CH#7".into(),
                exit_country: "CH".into(),
                entry_country: None,
                tier: 1,
                features: 0,
                servers: vec![PhysicalServer { id: "7-a".into(), status: 1, load: 5 }],
            }],
        })
    }

    #[test]
    fn test_flag_defaults_written_back() {
        let store = MemoryStore::new();
        let settings = SwiftSettings::load(&store).unwrap();

        assert!(settings.enabled);
        assert!(!settings.disconnect_on_unmatched);
        assert!(settings.rules.is_empty());
        assert_eq!(ENABLED_ITEM.get(&store).unwrap(), Some(true));
        assert_eq!(DISCONNECT_ON_UNMATCHED_ITEM.get(&store).unwrap(), Some(false));
    }

    #[test]
    fn test_non_boolean_flag_reset() {
        let store = MemoryStore::new();
        store
            .set_raw(keys::ENABLED, serde_json::json!({"value": "yes"}))
            .unwrap();

        let mut settings = SwiftSettings::default();
        assert!(settings.reload_enabled(&store).unwrap());
        assert_eq!(ENABLED_ITEM.get(&store).unwrap(), Some(true));

        set_enabled(&store, false).unwrap();
        assert!(!settings.reload_enabled(&store).unwrap());
    }

    #[test]
    fn test_stored_rules_normalized() {
        let store = MemoryStore::new();
        store
            .set_raw(
                keys::RULES,
                serde_json::json!({"value": [{
                    "id": "a", "host": "example.com", "path": "/", "includeSubdomains": false,
                    "targetType": "country", "targetId": "CH", "targetLabel": "Switzerland"
                }]}),
            )
            .unwrap();

        let rules = load_rules(&store).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.rules()[0].path, None);
        assert!(rules.rules()[0].enabled);
    }

    #[tokio::test]
    async fn test_add_rule_from_input() {
        let store = MemoryStore::new();
        let dir = directory();

        let rule = add_rule_from_input(&store, &dir, "www.Example.com/docs", TargetType::Server, "ch#7", true)
            .await
            .unwrap();
        assert_eq!(rule.host, "example.com");
        assert_eq!(rule.path.as_deref(), Some("/docs"));
        assert_eq!(rule.target_id, "7");

        // Same key replaces in place
        let replaced = add_rule_from_input(&store, &dir, "example.com/docs", TargetType::Country, "ch", true)
            .await
            .unwrap();
        assert_eq!(replaced.id, rule.id);
        assert_eq!(load_rules(&store).unwrap().len(), 1);

        let err = add_rule_from_input(&store, &dir, "   ", TargetType::Country, "ch", false)
            .await
            .unwrap_err();
        assert_eq!(err.user_message(), "Enter a valid website.");

        let err = add_rule_from_input(&store, &dir, "a.com", TargetType::Country, "Atlantis", false)
            .await
            .unwrap_err();
        assert!(matches!(err, RuleEditError::Target(TargetError::CountryNotFound)));
    }

    #[test]
    fn test_import_keeps_previous_rules_on_failure() {
        let store = MemoryStore::new();
        edit_rules(&store, |rules| {
            rules.upsert("keep.com", None, false, TargetType::Country, "CH", "Switzerland");
        })
        .unwrap();

        let err = import_rules_into(&store, "{ not json").unwrap_err();
        assert_eq!(err.user_message(), "Failed to import rules.");

        let err = import_rules_into(&store, r#"{"version":1,"rules":[{"host":""}]}"#).unwrap_err();
        assert_eq!(err.user_message(), "No valid rules found.");

        let rules = load_rules(&store).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.rules()[0].host, "keep.com");
    }

    #[test]
    fn test_export_import_roundtrip_through_store() {
        let store = MemoryStore::new();
        edit_rules(&store, |rules| {
            rules.upsert("a.com", Some("/x"), true, TargetType::Server, "7", "CH#7");
            rules.upsert("b.com", None, false, TargetType::Country, "CH", "Switzerland");
            let id = rules.rules()[1].id.clone();
            rules.toggle(&id);
            rules.move_rule(&id, MoveDirection::Up);
        })
        .unwrap();

        let before = load_rules(&store).unwrap();
        let exported = export_rules(before.rules()).unwrap();

        let other = MemoryStore::new();
        assert_eq!(import_rules_into(&other, &exported).unwrap(), 2);
        assert_eq!(load_rules(&other).unwrap(), before);
    }
}

//! Active rule ledger
//!
//! Persisted record of the rule that owns the live connection. The
//! connection is "attributable" to the record while its target still
//! matches: same logical id for server targets, same exit country for
//! country targets.

use crate::store::{keys, StorageItem, Store, StoreError};
use fos_rules::{Rule, TargetType};
use fos_vpn::ConnectionState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub const ACTIVE_RULE_ITEM: StorageItem<Option<ActiveRuleRecord>> =
    StorageItem::new(keys::ACTIVE_RULE);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRuleRecord {
    pub rule_id: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub target_type: TargetType,
    pub target_id: String,
    pub target_label: String,
    pub time: u64,
}

impl ActiveRuleRecord {
    pub fn from_rule(rule: &Rule, time: u64) -> Self {
        Self {
            rule_id: rule.id.clone(),
            host: rule.host.clone(),
            path: rule.path.clone(),
            target_type: rule.target_type,
            target_id: rule.target_id.clone(),
            target_label: rule.target_label.clone(),
            time,
        }
    }

    pub fn is_attributable(&self, state: &ConnectionState) -> bool {
        targets_connection(self.target_type, &self.target_id, state)
    }
}

/// Does the connection in `state` point at `(target_type, target_id)`?
///
/// Looks at the connection's target even while it is still connecting.
pub fn targets_connection(target_type: TargetType, target_id: &str, state: &ConnectionState) -> bool {
    match target_type {
        TargetType::Server => state.server_id() == Some(target_id),
        TargetType::Country => state.exit_country() == Some(target_id),
    }
}

pub struct ActiveRuleLedger {
    store: Arc<dyn Store>,
    current: Mutex<Option<ActiveRuleRecord>>,
}

impl ActiveRuleLedger {
    /// Restore the ledger from storage. An unreadable record counts as empty.
    pub fn load(store: Arc<dyn Store>) -> Self {
        let current = match ACTIVE_RULE_ITEM.get(store.as_ref()) {
            Ok(record) => record.flatten(),
            Err(e) => {
                warn!("Ignoring unreadable active rule record: {}", e);
                None
            }
        };

        Self {
            store,
            current: Mutex::new(current),
        }
    }

    pub fn current(&self) -> Option<ActiveRuleRecord> {
        self.current.lock().clone()
    }

    pub fn is_set(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Record `rule` as the owner of the live connection.
    pub fn set(&self, rule: &Rule, time: u64) -> Result<(), StoreError> {
        let record = ActiveRuleRecord::from_rule(rule, time);
        debug!("Active rule is now {} ({})", record.rule_id, rule.target_descriptor());
        *self.current.lock() = Some(record.clone());
        ACTIVE_RULE_ITEM.set(self.store.as_ref(), &Some(record))
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        let previous = self.current.lock().take();
        if let Some(previous) = previous {
            debug!("Clearing active rule {}", previous.rule_id);
        }
        ACTIVE_RULE_ITEM.set(self.store.as_ref(), &None)
    }

    /// Is the ledger set and still describing the live connection?
    pub fn attributable(&self, state: &ConnectionState) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|record| record.is_attributable(state))
    }

    /// Clear the record if its rule no longer exists or was disabled.
    /// Returns whether it was cleared.
    pub fn retain_if_rule_enabled(&self, rules: &[Rule]) -> Result<bool, StoreError> {
        let orphaned = self.current.lock().as_ref().is_some_and(|record| {
            !rules
                .iter()
                .any(|rule| rule.id == record.rule_id && rule.enabled)
        });

        if orphaned {
            self.clear()?;
        }
        Ok(orphaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use fos_vpn::{ServerSummary, VpnState};

    fn rule(id: &str, target_type: TargetType, target_id: &str) -> Rule {
        Rule {
            id: id.into(),
            host: "example.com".into(),
            path: None,
            include_subdomains: false,
            enabled: true,
            target_type,
            target_id: target_id.into(),
            target_label: target_id.into(),
        }
    }

    fn connected(id: &str, country: &str) -> ConnectionState {
        ConnectionState {
            state: VpnState::Connected,
            server: Some(ServerSummary {
                id: id.into(),
                name: format!("{}#{}", country, id),
                exit_country: country.into(),
            }),
        }
    }

    #[test]
    fn test_attribution() {
        let state = connected("7", "CH");

        assert!(targets_connection(TargetType::Server, "7", &state));
        assert!(!targets_connection(TargetType::Server, "8", &state));
        assert!(targets_connection(TargetType::Country, "CH", &state));
        assert!(!targets_connection(TargetType::Country, "DE", &state));
        assert!(!targets_connection(TargetType::Server, "7", &ConnectionState::disconnected()));
    }

    #[test]
    fn test_set_clear_persist() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ledger = ActiveRuleLedger::load(store.clone());
        assert!(!ledger.is_set());

        ledger.set(&rule("r1", TargetType::Country, "CH"), 100).unwrap();
        assert!(ledger.attributable(&connected("7", "CH")));
        assert!(!ledger.attributable(&connected("9", "DE")));

        let restored = ActiveRuleLedger::load(store.clone());
        assert_eq!(restored.current().map(|r| r.time), Some(100));

        ledger.clear().unwrap();
        assert!(!ledger.is_set());
        assert_eq!(ACTIVE_RULE_ITEM.get(store.as_ref()).unwrap(), Some(None));
    }

    #[test]
    fn test_retain_if_rule_enabled() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ledger = ActiveRuleLedger::load(store);
        let mut owner = rule("r1", TargetType::Server, "7");
        ledger.set(&owner, 1).unwrap();

        assert!(!ledger.retain_if_rule_enabled(&[owner.clone()]).unwrap());
        assert!(ledger.is_set());

        owner.enabled = false;
        assert!(ledger.retain_if_rule_enabled(&[owner]).unwrap());
        assert!(!ledger.is_set());
    }
}

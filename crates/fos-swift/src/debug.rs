//! Decision trace published for the rules page.
//!
//! A single rolling slot: each decision overwrites the previous one.
//! Consecutive duplicates (same action, host, rule and detail) are dropped
//! so bursts of navigation events don't churn storage.

use crate::store::{keys, StorageItem, Store};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEBUG_ITEM: StorageItem<DebugEvent> = StorageItem::new(keys::DEBUG);

/// Decision taken for a navigation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DebugAction {
    /// No enabled rules at all
    NoRules,
    /// Rules exist but none matched
    NoRule,
    /// A rule matched, resolution follows
    Match,
    Connect,
    Disconnect,
    Skip,
    Error,
}

impl DebugAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebugAction::NoRules => "no-rules",
            DebugAction::NoRule => "no-rule",
            DebugAction::Match => "match",
            DebugAction::Connect => "connect",
            DebugAction::Disconnect => "disconnect",
            DebugAction::Skip => "skip",
            DebugAction::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugEvent {
    pub time: u64,
    /// Visited host and path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    /// Matched rule's host and path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_host: Option<String>,
    /// `"type:label"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub action: DebugAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DebugEvent {
    pub fn new(time: u64, action: DebugAction) -> Self {
        Self {
            time,
            host: None,
            rule_id: None,
            rule_host: None,
            target: None,
            action,
            detail: None,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn rule(
        mut self,
        rule_id: impl Into<String>,
        rule_host: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.rule_id = Some(rule_id.into());
        self.rule_host = Some(rule_host.into());
        self.target = Some(target.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.action.as_str(),
            self.host.as_deref().unwrap_or(""),
            self.rule_id.as_deref().unwrap_or(""),
            self.detail.as_deref().unwrap_or("")
        )
    }
}

/// Publisher for [`DebugEvent`]s
pub struct DebugEventBus {
    store: Arc<dyn Store>,
    last_key: Mutex<Option<String>>,
}

impl DebugEventBus {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            last_key: Mutex::new(None),
        }
    }

    /// Publish `event` unless it repeats the last stored one.
    /// Returns whether it was written.
    pub fn publish(&self, event: DebugEvent) -> bool {
        let key = event.dedup_key();
        if self.last_key.lock().as_deref() == Some(key.as_str()) {
            return false;
        }

        debug!(
            action = event.action.as_str(),
            host = event.host.as_deref().unwrap_or(""),
            rule = event.rule_id.as_deref().unwrap_or(""),
            detail = event.detail.as_deref().unwrap_or(""),
            "swift decision"
        );

        if let Err(e) = DEBUG_ITEM.set(self.store.as_ref(), &event) {
            warn!("Failed to store debug event: {}", e);
            return false;
        }
        *self.last_key.lock() = Some(key);
        true
    }

    /// Last stored event
    pub fn latest(&self) -> Option<DebugEvent> {
        DEBUG_ITEM.get(self.store.as_ref()).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FlakyStore;
    use crate::store::MemoryStore;

    #[test]
    fn test_consecutive_duplicates_dropped() {
        let bus = DebugEventBus::new(Arc::new(MemoryStore::new()));

        assert!(bus.publish(DebugEvent::new(1, DebugAction::NoRule).host("a.com")));
        assert!(!bus.publish(DebugEvent::new(2, DebugAction::NoRule).host("a.com")));
        assert_eq!(bus.latest().unwrap().time, 1);

        assert!(bus.publish(DebugEvent::new(3, DebugAction::NoRule).host("b.com")));
        assert!(bus.publish(DebugEvent::new(4, DebugAction::NoRule).host("a.com")));
        assert_eq!(bus.latest().unwrap().time, 4);
    }

    #[test]
    fn test_detail_and_rule_part_of_key() {
        let bus = DebugEventBus::new(Arc::new(MemoryStore::new()));

        assert!(bus.publish(DebugEvent::new(1, DebugAction::Skip).host("a.com").detail("x")));
        assert!(bus.publish(DebugEvent::new(2, DebugAction::Skip).host("a.com").detail("y")));
        assert!(bus.publish(
            DebugEvent::new(3, DebugAction::Skip).host("a.com").detail("y").rule("r1", "a.com", "server:S1")
        ));
    }

    #[test]
    fn test_json_layout() {
        let event = DebugEvent::new(5, DebugAction::NoRules).host("a.com");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, serde_json::json!({"time": 5, "host": "a.com", "action": "no-rules"}));
    }

    #[test]
    fn test_failed_write_is_retried() {
        let store = Arc::new(FlakyStore::new());
        let bus = DebugEventBus::new(store.clone());

        store.fail_writes(keys::DEBUG);
        assert!(!bus.publish(DebugEvent::new(1, DebugAction::NoRule).host("a.com")));
        assert_eq!(bus.latest(), None);

        store.heal(keys::DEBUG);
        assert!(bus.publish(DebugEvent::new(2, DebugAction::NoRule).host("a.com")));
        assert_eq!(bus.latest().unwrap().time, 2);
    }
}

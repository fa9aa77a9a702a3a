//! Per-tab memory of the last rule applied, used to skip repeated
//! connects when a tab fires several navigation events for the same site.
//! In-memory only.

use crate::event::TabId;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct TabActivityTracker {
    last_rule: Mutex<HashMap<TabId, String>>,
}

impl TabActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_rule(&self, tab_id: TabId) -> Option<String> {
        self.last_rule.lock().get(&tab_id).cloned()
    }

    pub fn record(&self, tab_id: TabId, rule_id: &str) {
        self.last_rule.lock().insert(tab_id, rule_id.to_string());
    }

    pub fn forget(&self, tab_id: TabId) {
        self.last_rule.lock().remove(&tab_id);
    }

    pub fn clear(&self) {
        self.last_rule.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.last_rule.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

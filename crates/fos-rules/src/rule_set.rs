//! Ordered rule list with the editing operations the rules page offers.

use crate::matcher::normalize_path;
use crate::rule::{Rule, TargetType};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Direction for [`RuleSet::move_rule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Up,
    Down,
}

/// Ordered list of rules. Index 0 has the highest priority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a stored list, re-normalizing every rule's path.
    pub fn from_stored(rules: Vec<Rule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|mut rule| {
                rule.path = rule.path.as_deref().and_then(normalize_path);
                rule
            })
            .collect();
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn into_vec(self) -> Vec<Rule> {
        self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.id == id)
    }

    /// Enabled rules, in priority order.
    pub fn enabled(&self) -> Vec<Rule> {
        self.rules.iter().filter(|rule| rule.enabled).cloned().collect()
    }

    /// Insert or replace the rule with the same `(host, path, subdomains)` key.
    ///
    /// A replaced rule keeps its position, id and enabled flag; a new rule is
    /// appended (lowest priority) with a fresh id.
    pub fn upsert(
        &mut self,
        host: &str,
        path: Option<&str>,
        include_subdomains: bool,
        target_type: TargetType,
        target_id: &str,
        target_label: &str,
    ) -> &Rule {
        let path = path.and_then(normalize_path);
        let existing = self.rules.iter().position(|rule| {
            rule.host == host
                && rule.path.as_deref().unwrap_or("") == path.as_deref().unwrap_or("")
                && rule.include_subdomains == include_subdomains
        });

        let rule = Rule {
            id: existing
                .map(|index| self.rules[index].id.clone())
                .unwrap_or_else(Rule::generate_id),
            host: host.to_string(),
            path,
            include_subdomains,
            enabled: existing.map(|index| self.rules[index].enabled).unwrap_or(true),
            target_type,
            target_id: target_id.to_string(),
            target_label: target_label.to_string(),
        };

        let index = match existing {
            Some(index) => {
                debug!("Replacing rule {} for {}", rule.id, rule.host_label());
                self.rules[index] = rule;
                index
            }
            None => {
                debug!("Adding rule {} for {}", rule.id, rule.host_label());
                self.rules.push(rule);
                self.rules.len() - 1
            }
        };

        &self.rules[index]
    }

    /// Remove a rule by id. Returns whether anything was removed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.id != id);
        before != self.rules.len()
    }

    /// Flip a rule's enabled flag. Returns the new value.
    pub fn toggle(&mut self, id: &str) -> Option<bool> {
        let rule = self.rules.iter_mut().find(|rule| rule.id == id)?;
        rule.enabled = !rule.enabled;
        Some(rule.enabled)
    }

    /// Move a rule one slot up or down. No-op at the list edges.
    pub fn move_rule(&mut self, id: &str, direction: MoveDirection) -> bool {
        let Some(index) = self.rules.iter().position(|rule| rule.id == id) else {
            return false;
        };

        let next = match direction {
            MoveDirection::Up if index > 0 => index - 1,
            MoveDirection::Down if index + 1 < self.rules.len() => index + 1,
            _ => return false,
        };

        self.rules.swap(index, next);
        true
    }
}

impl From<Vec<Rule>> for RuleSet {
    fn from(rules: Vec<Rule>) -> Self {
        Self::from_stored(rules)
    }
}

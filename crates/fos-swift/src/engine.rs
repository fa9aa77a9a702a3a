//! Swift Engine
//!
//! The connection orchestrator. Every navigation, activation or settings
//! change ends up in [`SwiftEngine::evaluate`], which matches the URL
//! against the rule list and reconciles the live VPN connection with it.
//!
//! # Per-tab state
//!
//! ```text
//!   Unevaluated ──evaluate──▶ Evaluated(rule id)   connected or already connected
//!                        └──▶ Evaluated(none)      no rule matched
//!   any ──tab removed / rules or flag changed──▶ Unevaluated
//! ```
//!
//! Re-evaluating a tab whose last applied rule still owns the live
//! connection is a no-op, so bursts of events for the same site never
//! reconnect.
//!
//! Every decision is published as a [`DebugEvent`]. Failures of the
//! collaborators are reported the same way; nothing here leaves the engine
//! in a state that blocks later evaluations.

use crate::clock::Clock;
use crate::debug::{DebugAction, DebugEvent, DebugEventBus};
use crate::event::{SettingsChange, TabEvent, TabId, TabQuery, TabSignal};
use crate::ledger::{targets_connection, ActiveRuleLedger, ActiveRuleRecord};
use crate::settings::{load_rules, SwiftSettings};
use crate::store::{Store, StoreError};
use crate::target::{find_endpoint, Endpoint, SkipReason};
use crate::tracker::TabActivityTracker;
use fos_rules::{host_label, parse_url, select, Rule};
use fos_vpn::{ConnectOptions, ConnectionManager, Directory, DirectoryError, VpnError};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Unexpected failures while applying a rule
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("VPN error: {0}")]
    Vpn(#[from] VpnError),
}

/// What one evaluation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Not an http(s) URL
    Ignored,
    /// No enabled rules at all
    NoRules,
    /// No rule matched, the connection was left alone
    NoRule,
    /// No rule matched and the rule-owned connection was dropped
    Disconnected,
    /// The tab's rule already owns the live connection
    Unchanged,
    /// Connected for the rule
    Connected { rule_id: String },
    /// A rule matched (or the feature is off) but nothing was connected
    Skipped(SkipReason),
    /// A collaborator failed
    Failed(String),
}

pub struct SwiftEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    vpn: Arc<dyn ConnectionManager>,
    directory: Arc<dyn Directory>,
    settings: RwLock<SwiftSettings>,
    tracker: TabActivityTracker,
    ledger: ActiveRuleLedger,
    debug: DebugEventBus,
}

impl SwiftEngine {
    /// Build the engine, loading settings and the active rule from `store`.
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        vpn: Arc<dyn ConnectionManager>,
        directory: Arc<dyn Directory>,
    ) -> Result<Self, StoreError> {
        let settings = SwiftSettings::load(store.as_ref())?;
        info!(
            "Swift engine loaded {} rules (enabled: {}, disconnect on unmatched: {})",
            settings.rules.len(),
            settings.enabled,
            settings.disconnect_on_unmatched
        );

        Ok(Self {
            ledger: ActiveRuleLedger::load(store.clone()),
            debug: DebugEventBus::new(store.clone()),
            tracker: TabActivityTracker::new(),
            settings: RwLock::new(settings),
            store,
            clock,
            vpn,
            directory,
        })
    }

    pub fn settings(&self) -> SwiftSettings {
        self.settings.read().clone()
    }

    pub fn tracker(&self) -> &TabActivityTracker {
        &self.tracker
    }

    pub fn ledger(&self) -> &ActiveRuleLedger {
        &self.ledger
    }

    fn publish(&self, event: DebugEvent) {
        self.debug.publish(event);
    }

    fn event(&self, action: DebugAction) -> DebugEvent {
        DebugEvent::new(self.clock.now_ms(), action)
    }

    /// Handle a tab signal. Returns the evaluation outcome when the signal
    /// carried a URL to evaluate.
    pub async fn on_tab_event(&self, event: &TabEvent) -> Option<Outcome> {
        match event.signal {
            TabSignal::Removed => {
                self.forget_tab(event.tab_id);
                None
            }
            TabSignal::NavigationCommitted | TabSignal::NavigationCompleted | TabSignal::Activated => {
                let url = event.url.as_deref()?;
                Some(self.evaluate(event.tab_id, url).await)
            }
        }
    }

    pub fn forget_tab(&self, tab_id: TabId) {
        trace!("Forgetting {}", tab_id);
        self.tracker.forget(tab_id);
    }

    /// Evaluate `url` as the current page of `tab_id`.
    pub async fn evaluate(&self, tab_id: TabId, url: &str) -> Outcome {
        let Some(parts) = parse_url(url) else {
            trace!("{}: ignoring {:?}", tab_id, url);
            return Outcome::Ignored;
        };

        let page = host_label(&parts.host, Some(parts.path.as_str()).filter(|p| *p != "/"));

        let (enabled, disconnect_on_unmatched, rules) = {
            let settings = self.settings.read();
            (
                settings.enabled,
                settings.disconnect_on_unmatched,
                settings.rules.enabled(),
            )
        };

        if !enabled {
            self.publish(
                self.event(DebugAction::Skip)
                    .host(&page)
                    .detail(SkipReason::Disabled.code()),
            );
            return Outcome::Skipped(SkipReason::Disabled);
        }

        if rules.is_empty() {
            self.publish(self.event(DebugAction::NoRules).host(&page));
            return Outcome::NoRules;
        }

        let selection = select(&rules, &parts);
        let multiple = selection.matching.len() > 1;

        match selection.rule.cloned() {
            None => self.handle_unmatched(tab_id, &page, disconnect_on_unmatched).await,
            Some(rule) => self.handle_match(tab_id, &page, &rule, multiple).await,
        }
    }

    async fn handle_unmatched(&self, tab_id: TabId, page: &str, disconnect_on_unmatched: bool) -> Outcome {
        let state = self.vpn.current_state().await;
        let attributable = self.ledger.attributable(&state);

        if self.ledger.is_set() && !attributable {
            debug!("Live connection no longer belongs to the active rule");
            if let Err(e) = self.ledger.clear() {
                warn!("Failed to clear active rule: {}", e);
                self.publish(self.event(DebugAction::Error).host(page).detail(e.to_string()));
                self.tracker.forget(tab_id);
                return Outcome::Failed(e.to_string());
            }
        }

        let outcome = if disconnect_on_unmatched && state.is_connected() && attributable {
            info!("{}: {} matches no rule, disconnecting", tab_id, page);
            match self.disconnect_owned().await {
                Ok(()) => {
                    self.publish(self.event(DebugAction::Disconnect).host(page).detail("no-rule"));
                    Outcome::Disconnected
                }
                Err(e) => {
                    warn!("Failed to disconnect: {}", e);
                    self.publish(self.event(DebugAction::Error).host(page).detail(e.to_string()));
                    Outcome::Failed(e.to_string())
                }
            }
        } else {
            self.publish(self.event(DebugAction::NoRule).host(page));
            Outcome::NoRule
        };

        self.tracker.forget(tab_id);
        outcome
    }

    async fn disconnect_owned(&self) -> Result<(), EngineError> {
        self.vpn.disconnect().await?;
        self.ledger.clear()?;
        Ok(())
    }

    async fn handle_match(&self, tab_id: TabId, page: &str, rule: &Rule, multiple: bool) -> Outcome {
        let state = self.vpn.current_state().await;
        if self.tracker.last_rule(tab_id).as_deref() == Some(rule.id.as_str())
            && targets_connection(rule.target_type, &rule.target_id, &state)
        {
            trace!("{}: rule {} already applied", tab_id, rule.id);
            return Outcome::Unchanged;
        }

        let rule_page = rule.host_label();
        let target = rule.target_descriptor();

        let mut matched = self
            .event(DebugAction::Match)
            .host(page)
            .rule(&rule.id, &rule_page, &target);
        if multiple {
            matched = matched.detail("multiple-rules");
        }
        self.publish(matched);

        match self.run_rule(tab_id, rule).await {
            Ok(Ok(endpoint)) => {
                self.publish(
                    self.event(DebugAction::Connect)
                        .host(page)
                        .rule(&rule.id, &rule_page, &target)
                        .detail("connected"),
                );
                info!("{}: {} connected to {} by rule {}", tab_id, page, endpoint.logical.name, rule.id);
                Outcome::Connected {
                    rule_id: rule.id.clone(),
                }
            }
            Ok(Err(reason)) => {
                self.publish(
                    self.event(DebugAction::Skip)
                        .host(page)
                        .rule(&rule.id, &rule_page, &target)
                        .detail(reason.code()),
                );
                debug!("{}: rule {} skipped: {}", tab_id, rule.id, reason.code());
                Outcome::Skipped(reason)
            }
            Err(e) => {
                warn!("{}: applying rule {} failed: {}", tab_id, rule.id, e);
                self.publish(
                    self.event(DebugAction::Error)
                        .host(page)
                        .rule(&rule.id, &rule.host, &target)
                        .detail(e.to_string()),
                );
                Outcome::Failed(e.to_string())
            }
        }
    }

    /// Apply `rule` and, when its target is live afterwards, record it as
    /// the tab's rule and the owner of the connection.
    async fn run_rule(&self, tab_id: TabId, rule: &Rule) -> Result<Result<Endpoint, SkipReason>, EngineError> {
        let result = self.apply_rule(rule).await?;

        if matches!(result, Ok(_) | Err(SkipReason::AlreadyConnected)) {
            self.tracker.record(tab_id, &rule.id);
            self.ledger.set(rule, self.clock.now_ms())?;
        }
        Ok(result)
    }

    async fn apply_rule(&self, rule: &Rule) -> Result<Result<Endpoint, SkipReason>, EngineError> {
        self.vpn.wait_until_ready().await;

        let state = self.vpn.current_state().await;
        if targets_connection(rule.target_type, &rule.target_id, &state) {
            return Ok(Err(SkipReason::AlreadyConnected));
        }

        let Some(user_tier) = self.directory.user_max_tier().await? else {
            return Ok(Err(SkipReason::NoUser));
        };

        let endpoint = match find_endpoint(rule, self.directory.as_ref(), user_tier).await? {
            Ok(endpoint) => endpoint,
            Err(reason) => return Ok(Err(reason)),
        };

        self.vpn
            .connect(
                &endpoint.logical,
                &endpoint.server,
                ConnectOptions {
                    suppress_notification: true,
                },
            )
            .await?;

        Ok(Ok(endpoint))
    }

    /// Reload a changed setting. Returns whether the focused tabs should be
    /// re-evaluated.
    pub fn apply_settings_change(&self, change: SettingsChange) -> Result<bool, StoreError> {
        let store = self.store.as_ref();

        match change {
            SettingsChange::Rules => {
                let rules = load_rules(store)?;
                info!("Rules changed ({} rules)", rules.len());
                self.tracker.clear();
                if self.ledger.retain_if_rule_enabled(rules.rules())? {
                    debug!("Active rule was removed or disabled");
                }
                self.settings.write().rules = rules;
                Ok(true)
            }
            SettingsChange::Enabled => {
                let enabled = self.settings.write().reload_enabled(store)?;
                info!("Swift {}", if enabled { "enabled" } else { "disabled" });
                self.tracker.clear();
                Ok(enabled)
            }
            SettingsChange::DisconnectOnUnmatched => {
                let mut settings = self.settings.write();
                let disconnect = settings.reload_disconnect_on_unmatched(store)?;
                info!("Disconnect on unmatched: {}", disconnect);
                Ok(settings.enabled && !settings.rules.is_empty())
            }
        }
    }

    /// Whether startup should evaluate the focused tabs
    pub fn should_check_on_start(&self) -> bool {
        let settings = self.settings.read();
        settings.enabled && !settings.rules.is_empty()
    }

    /// Evaluate every focused tab in turn.
    pub async fn recheck_focused(&self, tabs: &dyn TabQuery) -> Vec<(TabId, Outcome)> {
        let mut outcomes = Vec::new();
        for tab in tabs.focused_tabs() {
            let outcome = self.evaluate(tab.tab_id, &tab.url).await;
            outcomes.push((tab.tab_id, outcome));
        }
        outcomes
    }

    /// The active rule, if it still owns the live connection
    pub async fn connected_rule(&self) -> Option<ActiveRuleRecord> {
        let state = self.vpn.current_state().await;
        if !state.is_connected() {
            return None;
        }
        self.ledger
            .current()
            .filter(|record| record.is_attributable(&state))
    }

    /// One-line summary for logs and the daemon
    pub async fn status(&self) -> String {
        let (enabled, total, active) = {
            let settings = self.settings.read();
            (
                settings.enabled,
                settings.rules.len(),
                settings.rules.enabled().len(),
            )
        };

        let owner = match self.connected_rule().await {
            Some(record) => format!(
                "connected by {} ({}:{})",
                record.rule_id,
                record.target_type.as_str(),
                record.target_label
            ),
            None => "not connected by a rule".to_string(),
        };

        format!(
            "Swift: {} | {} rules ({} enabled) | {}",
            if enabled { "on" } else { "off" },
            total,
            active,
            owner
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::debug::DEBUG_ITEM;
    use crate::event::FocusedTab;
    use crate::ledger::ACTIVE_RULE_ITEM;
    use crate::settings::{edit_rules, set_disconnect_on_unmatched, set_enabled};
    use crate::store::testing::FlakyStore;
    use crate::store::{keys, MemoryStore};
    use async_trait::async_trait;
    use fos_rules::TargetType;
    use fos_vpn::{
        CountryEntry, CountryList, DirectoryConfig, FeatureFilter, Logical, PhysicalServer,
        StaticDirectory, VpnManager,
    };

    fn logical(id: &str, country: &str) -> Logical {
        Logical {
            id: id.into(),
            name: format!("{}#{}", country, id),
            exit_country: country.into(),
            entry_country: None,
            tier: 0,
            features: 0,
            servers: vec![PhysicalServer { id: format!("{}-a", id), status: 1, load: 10 }],
        }
    }

    fn directory_config() -> DirectoryConfig {
        DirectoryConfig {
            user_tier: Some(2),
            secure_core: None,
            countries: vec![
                CountryEntry { code: "CH".into(), name: "Switzerland".into(), english_name: None },
                CountryEntry { code: "DE".into(), name: "Germany".into(), english_name: None },
            ],
            logicals: vec![logical("1", "CH"), logical("2", "DE")],
        }
    }

    struct Harness {
        store: Arc<dyn Store>,
        vpn: Arc<VpnManager>,
        clock: Arc<ManualClock>,
        engine: SwiftEngine,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_directory(Arc::new(StaticDirectory::new(directory_config())))
        }

        fn with_directory(directory: Arc<dyn Directory>) -> Self {
            Self::with_store(Arc::new(MemoryStore::new()), directory)
        }

        fn with_store(store: Arc<dyn Store>, directory: Arc<dyn Directory>) -> Self {
            let vpn = Arc::new(VpnManager::new());
            let clock = Arc::new(ManualClock::new(1_000));
            let engine = SwiftEngine::new(store.clone(), clock.clone(), vpn.clone(), directory).unwrap();
            Self { store, vpn, clock, engine }
        }

        fn add_rule(&self, host: &str, path: Option<&str>, subdomains: bool, target_type: TargetType, target_id: &str) -> String {
            let id = edit_rules(self.store.as_ref(), |rules| {
                rules
                    .upsert(host, path, subdomains, target_type, target_id, target_id)
                    .id
                    .clone()
            })
            .unwrap();
            assert!(self.engine.apply_settings_change(SettingsChange::Rules).unwrap());
            id
        }

        fn last_debug(&self) -> DebugEvent {
            DEBUG_ITEM.get(self.store.as_ref()).unwrap().unwrap()
        }
    }

    const TAB: TabId = TabId(1);

    #[tokio::test]
    async fn test_invalid_urls_are_silent() {
        let h = Harness::new();
        assert_eq!(h.engine.evaluate(TAB, "chrome://settings").await, Outcome::Ignored);
        assert_eq!(h.engine.evaluate(TAB, "not a url").await, Outcome::Ignored);
        assert_eq!(DEBUG_ITEM.get(h.store.as_ref()).unwrap(), None);
    }

    #[tokio::test]
    async fn test_no_rules_leaves_ledger_alone() {
        let h = Harness::new();
        let rule = Rule {
            id: "gone".into(),
            host: "x.com".into(),
            path: None,
            include_subdomains: false,
            enabled: true,
            target_type: TargetType::Country,
            target_id: "CH".into(),
            target_label: "Switzerland".into(),
        };
        h.engine.ledger().set(&rule, 1).unwrap();

        assert_eq!(h.engine.evaluate(TAB, "https://example.com/").await, Outcome::NoRules);
        assert_eq!(h.last_debug().action, DebugAction::NoRules);
        assert!(h.engine.ledger().is_set());
    }

    #[tokio::test]
    async fn test_disabled_skips() {
        let h = Harness::new();
        h.add_rule("example.com", None, false, TargetType::Country, "CH");
        set_enabled(h.store.as_ref(), false).unwrap();
        assert!(!h.engine.apply_settings_change(SettingsChange::Enabled).unwrap());

        assert_eq!(
            h.engine.evaluate(TAB, "https://example.com/").await,
            Outcome::Skipped(SkipReason::Disabled)
        );
        assert_eq!(h.last_debug().detail.as_deref(), Some("disabled"));
        assert_eq!(h.vpn.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_match_connects_and_records() {
        let h = Harness::new();
        let id = h.add_rule("example.com", None, true, TargetType::Country, "CH");

        let outcome = h.engine.evaluate(TAB, "https://www.news.example.com/a").await;
        assert_eq!(outcome, Outcome::Connected { rule_id: id.clone() });
        assert_eq!(h.vpn.connect_calls(), 1);
        assert_eq!(h.vpn.current_state().await.exit_country(), Some("CH"));

        assert_eq!(h.engine.tracker().last_rule(TAB).as_deref(), Some(id.as_str()));
        let record = ACTIVE_RULE_ITEM.get(h.store.as_ref()).unwrap().flatten().unwrap();
        assert_eq!(record.rule_id, id);
        assert_eq!(record.time, 1_000);

        let debug = h.last_debug();
        assert_eq!(debug.action, DebugAction::Connect);
        assert_eq!(debug.host.as_deref(), Some("news.example.com/a"));
        assert_eq!(debug.rule_host.as_deref(), Some("example.com"));
        assert_eq!(debug.target.as_deref(), Some("country:CH"));

        assert_eq!(h.engine.connected_rule().await.map(|r| r.rule_id), Some(id));
    }

    #[tokio::test]
    async fn test_repeated_navigation_connects_once() {
        let h = Harness::new();
        h.add_rule("example.com", None, false, TargetType::Server, "2");

        for path in ["/", "/a", "/b", "/"] {
            h.clock.advance(10);
            h.engine.evaluate(TAB, &format!("https://example.com{}", path)).await;
        }
        assert_eq!(h.vpn.connect_calls(), 1);
        assert_eq!(
            h.engine.evaluate(TAB, "https://example.com/").await,
            Outcome::Unchanged
        );
    }

    #[tokio::test]
    async fn test_other_tab_same_target_is_already_connected() {
        let h = Harness::new();
        let id = h.add_rule("example.com", None, false, TargetType::Country, "DE");

        h.engine.evaluate(TAB, "https://example.com/").await;
        let outcome = h.engine.evaluate(TabId(2), "https://example.com/").await;

        assert_eq!(outcome, Outcome::Skipped(SkipReason::AlreadyConnected));
        assert_eq!(h.vpn.connect_calls(), 1);
        assert_eq!(h.engine.tracker().last_rule(TabId(2)).as_deref(), Some(id.as_str()));
        assert_eq!(h.last_debug().detail.as_deref(), Some("already-connected"));
    }

    #[tokio::test]
    async fn test_priority_is_list_order() {
        let h = Harness::new();
        let broad = h.add_rule("example.com", None, false, TargetType::Country, "CH");
        h.add_rule("example.com", Some("/docs"), false, TargetType::Country, "DE");

        let outcome = h.engine.evaluate(TAB, "https://example.com/docs").await;
        assert_eq!(outcome, Outcome::Connected { rule_id: broad });
        assert_eq!(h.vpn.current_state().await.exit_country(), Some("CH"));
    }

    #[tokio::test]
    async fn test_multiple_rules_detail_on_match() {
        let h = Harness::new();
        h.add_rule("example.com", None, false, TargetType::Country, "FR");
        h.add_rule("example.com", Some("/docs"), false, TargetType::Country, "DE");

        // Country has no servers, so the skip follows the match
        let outcome = h.engine.evaluate(TAB, "https://example.com/docs").await;
        assert_eq!(outcome, Outcome::Skipped(SkipReason::CountryNotAvailable));

        let debug = h.last_debug();
        assert_eq!(debug.action, DebugAction::Skip);
        assert_eq!(debug.detail.as_deref(), Some("country-not-available"));
        assert!(!h.engine.ledger().is_set());
        assert_eq!(h.engine.tracker().last_rule(TAB), None);
    }

    #[tokio::test]
    async fn test_unmatched_keeps_connection_by_default() {
        let h = Harness::new();
        h.add_rule("example.com", None, false, TargetType::Country, "CH");

        h.engine.evaluate(TAB, "https://example.com/").await;
        assert_eq!(h.engine.evaluate(TAB, "https://other.org/").await, Outcome::NoRule);

        assert_eq!(h.vpn.disconnect_calls(), 0);
        assert!(h.vpn.current_state().await.is_connected());
        assert!(h.engine.ledger().is_set());
        assert_eq!(h.engine.tracker().last_rule(TAB), None);
    }

    #[tokio::test]
    async fn test_unmatched_disconnects_when_enabled() {
        let h = Harness::new();
        h.add_rule("example.com", None, false, TargetType::Country, "CH");
        set_disconnect_on_unmatched(h.store.as_ref(), true).unwrap();
        assert!(h.engine.apply_settings_change(SettingsChange::DisconnectOnUnmatched).unwrap());

        h.engine.evaluate(TAB, "https://example.com/").await;
        assert_eq!(h.engine.evaluate(TAB, "https://other.org/").await, Outcome::Disconnected);
        assert_eq!(h.engine.evaluate(TAB, "https://other.org/x").await, Outcome::NoRule);

        assert_eq!(h.vpn.disconnect_calls(), 1);
        assert!(!h.engine.ledger().is_set());
        assert_eq!(ACTIVE_RULE_ITEM.get(h.store.as_ref()).unwrap(), Some(None));
        assert_eq!(h.last_debug().action, DebugAction::NoRule);
    }

    #[tokio::test]
    async fn test_foreign_connection_never_disconnected() {
        let h = Harness::new();
        h.add_rule("example.com", None, false, TargetType::Country, "CH");
        set_disconnect_on_unmatched(h.store.as_ref(), true).unwrap();
        h.engine.apply_settings_change(SettingsChange::DisconnectOnUnmatched).unwrap();

        h.engine.evaluate(TAB, "https://example.com/").await;

        // The user switches to another server by hand
        let de = logical("2", "DE");
        h.vpn.connect(&de, &de.servers[0], ConnectOptions::default()).await.unwrap();

        assert_eq!(h.engine.evaluate(TAB, "https://other.org/").await, Outcome::NoRule);
        assert_eq!(h.vpn.disconnect_calls(), 0);
        assert!(!h.engine.ledger().is_set());
    }

    #[tokio::test]
    async fn test_ledger_clear_failure_reported() {
        let store = Arc::new(FlakyStore::new());
        let h = Harness::with_store(store.clone(), Arc::new(StaticDirectory::new(directory_config())));
        h.add_rule("example.com", None, false, TargetType::Country, "CH");
        h.engine.evaluate(TAB, "https://example.com/").await;

        let de = logical("2", "DE");
        h.vpn.connect(&de, &de.servers[0], ConnectOptions::default()).await.unwrap();

        store.fail_writes(keys::ACTIVE_RULE);
        let outcome = h.engine.evaluate(TAB, "https://other.org/").await;
        assert!(matches!(outcome, Outcome::Failed(_)));

        let debug = h.last_debug();
        assert_eq!(debug.action, DebugAction::Error);
        assert_eq!(debug.detail.as_deref(), Some("I/O error: disk full"));
        assert_eq!(h.vpn.disconnect_calls(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_reported_and_recoverable() {
        let h = Harness::new();
        h.add_rule("example.com", None, false, TargetType::Country, "CH");

        h.vpn.set_fail_connects(true);
        let outcome = h.engine.evaluate(TAB, "https://example.com/").await;
        assert!(matches!(outcome, Outcome::Failed(_)));
        assert_eq!(h.last_debug().action, DebugAction::Error);
        assert!(!h.engine.ledger().is_set());

        h.vpn.set_fail_connects(false);
        let outcome = h.engine.evaluate(TAB, "https://example.com/").await;
        assert!(matches!(outcome, Outcome::Connected { .. }));
    }

    #[tokio::test]
    async fn test_rule_change_clears_orphaned_ledger() {
        let h = Harness::new();
        let id = h.add_rule("example.com", None, false, TargetType::Country, "CH");
        h.engine.evaluate(TAB, "https://example.com/").await;

        edit_rules(h.store.as_ref(), |rules| rules.toggle(&id)).unwrap();
        assert!(h.engine.apply_settings_change(SettingsChange::Rules).unwrap());

        assert!(!h.engine.ledger().is_set());
        assert!(h.engine.tracker().is_empty());
        assert_eq!(h.engine.connected_rule().await, None);
    }

    struct FocusedList(Vec<FocusedTab>);

    impl TabQuery for FocusedList {
        fn focused_tabs(&self) -> Vec<FocusedTab> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_recheck_focused() {
        let h = Harness::new();
        assert!(!h.engine.should_check_on_start());
        h.add_rule("example.com", None, false, TargetType::Server, "1");
        assert!(h.engine.should_check_on_start());

        let tabs = FocusedList(vec![
            FocusedTab { tab_id: TabId(4), url: "https://example.com/".into() },
            FocusedTab { tab_id: TabId(5), url: "about:blank".into() },
        ]);
        let outcomes = h.engine.recheck_focused(&tabs).await;

        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0].1, Outcome::Connected { .. }));
        assert_eq!(outcomes[1].1, Outcome::Ignored);
    }

    #[tokio::test]
    async fn test_tab_events() {
        let h = Harness::new();
        let id = h.add_rule("example.com", None, false, TargetType::Country, "CH");

        let committed = TabEvent {
            tab_id: TAB,
            url: Some("https://example.com/".into()),
            signal: TabSignal::NavigationCommitted,
        };
        assert_eq!(
            h.engine.on_tab_event(&committed).await,
            Some(Outcome::Connected { rule_id: id })
        );

        let removed = TabEvent { tab_id: TAB, url: None, signal: TabSignal::Removed };
        assert_eq!(h.engine.on_tab_event(&removed).await, None);
        assert_eq!(h.engine.tracker().last_rule(TAB), None);
    }

    #[tokio::test]
    async fn test_status_line() {
        let h = Harness::new();
        let id = h.add_rule("example.com", None, false, TargetType::Country, "CH");
        assert_eq!(h.engine.status().await, "Swift: on | 1 rules (1 enabled) | not connected by a rule");

        h.engine.evaluate(TAB, "https://example.com/").await;
        assert_eq!(
            h.engine.status().await,
            format!("Swift: on | 1 rules (1 enabled) | connected by {} (country:CH)", id)
        );
    }

    /// Directory whose user is signed out and whose lookups fail.
    struct SignedOut;

    #[async_trait]
    impl Directory for SignedOut {
        async fn user_max_tier(&self) -> Result<Option<u8>, DirectoryError> {
            Ok(None)
        }

        async fn logicals(&self) -> Result<Vec<Logical>, DirectoryError> {
            Err(DirectoryError::Lookup("offline".into()))
        }

        async fn lookup(&self, _name: &str) -> Result<Option<Logical>, DirectoryError> {
            Err(DirectoryError::Lookup("offline".into()))
        }

        fn feature_filter(&self) -> FeatureFilter {
            FeatureFilter::default()
        }

        fn countries(&self) -> CountryList {
            CountryList::new()
        }

        fn best_logical(&self, candidates: &[Logical], _user_tier: u8) -> Option<Logical> {
            candidates.first().cloned()
        }
    }

    #[tokio::test]
    async fn test_no_user() {
        let h = Harness::with_directory(Arc::new(SignedOut));
        h.add_rule("example.com", None, false, TargetType::Country, "CH");

        assert_eq!(
            h.engine.evaluate(TAB, "https://example.com/").await,
            Outcome::Skipped(SkipReason::NoUser)
        );
        assert_eq!(h.vpn.connect_calls(), 0);
    }

    /// Directory that ranks the least-loaded candidate first.
    struct LeastLoaded(StaticDirectory);

    #[async_trait]
    impl Directory for LeastLoaded {
        async fn user_max_tier(&self) -> Result<Option<u8>, DirectoryError> {
            self.0.user_max_tier().await
        }

        async fn logicals(&self) -> Result<Vec<Logical>, DirectoryError> {
            self.0.logicals().await
        }

        async fn lookup(&self, name: &str) -> Result<Option<Logical>, DirectoryError> {
            self.0.lookup(name).await
        }

        fn feature_filter(&self) -> FeatureFilter {
            self.0.feature_filter()
        }

        fn countries(&self) -> CountryList {
            self.0.countries()
        }

        fn best_logical(&self, candidates: &[Logical], _user_tier: u8) -> Option<Logical> {
            candidates
                .iter()
                .min_by_key(|l| l.servers.iter().map(|s| s.load).min().unwrap_or(u8::MAX))
                .cloned()
        }
    }

    #[tokio::test]
    async fn test_country_target_uses_directory_ranking() {
        let mut config = directory_config();
        let mut busy = logical("3", "CH");
        busy.servers[0].load = 90;
        let mut quiet = logical("4", "CH");
        quiet.servers[0].load = 5;
        config.logicals = vec![busy, quiet];

        let h = Harness::with_directory(Arc::new(LeastLoaded(StaticDirectory::new(config))));
        h.add_rule("example.com", None, false, TargetType::Country, "CH");

        h.engine.evaluate(TAB, "https://example.com/").await;
        assert_eq!(h.vpn.current_state().await.server_id(), Some("4"));
    }
}

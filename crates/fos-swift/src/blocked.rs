//! Blocked Site Detector
//!
//! Watches top-level requests and remembers the most recent navigation
//! per tab for a bounded window. A blocking status (403, 451) or a network
//! error that looks like censorship produces a single persisted prompt
//! suggesting a rule, unless a rule already covers the site.
//!
//! Errors caused locally (aborted navigation, extension or policy blocks)
//! are never treated as blocking.

use crate::config::EngineConfig;
use crate::event::{NetworkEvent, NetworkOutcome, TabId};
use crate::settings::{edit_rules, load_rules};
use crate::store::{keys, StorageItem, Store, StoreError};
use crate::target::ResolvedTarget;
use fos_rules::{parse_url, select, Rule, TargetType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};

pub const BLOCKED_SITE_ITEM: StorageItem<Option<BlockedSitePrompt>> =
    StorageItem::new(keys::BLOCKED_SITE);

/// Network error codes that suggest the site is blocked upstream
const BLOCKED_ERROR_CODES: &[&str] = &[
    "ERR_NAME_NOT_RESOLVED",
    "ERR_CONNECTION_TIMED_OUT",
    "ERR_CONNECTION_FAILED",
    "ERR_CONNECTION_RESET",
    "ERR_CONNECTION_REFUSED",
    "ERR_ADDRESS_UNREACHABLE",
    "ERR_TUNNEL_CONNECTION_FAILED",
    "ERR_PROXY_CONNECTION_FAILED",
];

/// Error codes caused by the user or the browser itself
const IGNORED_ERROR_CODES: &[&str] = &[
    "ERR_ABORTED",
    "ERR_BLOCKED_BY_CLIENT",
    "ERR_BLOCKED_BY_ADMINISTRATOR",
];

/// Suggestion shown to the user after a site failed to load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedSitePrompt {
    pub host: String,
    pub url: String,
    pub time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BlockedSitePrompt {
    /// Host a suggested rule should cover: the registrable part of the
    /// blocked host.
    pub fn suggested_rule_host(&self) -> String {
        let host = parse_url(&self.url)
            .map(|parts| parts.host)
            .unwrap_or_else(|| self.host.clone());
        root_host(&host)
    }
}

/// Strip a `net::` prefix (any case) and surrounding whitespace.
fn normalize_error_code(raw: &str) -> &str {
    let trimmed = raw.trim();
    match trimmed.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("net::") => trimmed[5..].trim(),
        _ => trimmed,
    }
}

/// Does `raw` look like the network refused to reach the site?
pub fn is_likely_blocked_error(raw: &str) -> bool {
    let code = normalize_error_code(raw);
    if IGNORED_ERROR_CODES.contains(&code) {
        return false;
    }
    BLOCKED_ERROR_CODES.contains(&code)
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Best guess at the registrable domain of `host`.
///
/// IP literals and `localhost` are returned unchanged. Country-code
/// second-level domains such as `co.uk` keep three labels.
pub fn root_host(host: &str) -> String {
    let trimmed = host.trim().to_lowercase();

    if trimmed.is_empty()
        || trimmed == "localhost"
        || trimmed.parse::<Ipv4Addr>().is_ok()
        || trimmed.contains(':')
    {
        return trimmed;
    }

    let labels: Vec<&str> = trimmed.split('.').filter(|label| !label.is_empty()).collect();
    let count = labels.len();
    if count <= 2 {
        return trimmed;
    }

    let last = labels[count - 1];
    let second = labels[count - 2];
    let third = labels[count - 3];

    if last.len() == 2 && second.len() <= 3 {
        format!("{}.{}.{}", third, second, last)
    } else {
        format!("{}.{}", second, last)
    }
}

#[derive(Debug, Clone)]
struct TrackedNavigation {
    url: String,
    recorded_at: u64,
}

pub struct BlockedSiteDetector {
    store: Arc<dyn Store>,
    window_ms: u64,
    blocked_status_codes: Vec<u16>,
    tracked: Mutex<HashMap<TabId, TrackedNavigation>>,
}

impl BlockedSiteDetector {
    pub fn new(store: Arc<dyn Store>, config: &EngineConfig) -> Self {
        Self {
            store,
            window_ms: config.blocked_site_window().as_millis() as u64,
            blocked_status_codes: config.blocked_status_codes.clone(),
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one network observation. Returns the prompt when one was
    /// recorded.
    pub fn on_network_event(
        &self,
        event: &NetworkEvent,
    ) -> Result<Option<BlockedSitePrompt>, StoreError> {
        if !event.is_top_level() {
            return Ok(None);
        }

        match &event.outcome {
            NetworkOutcome::Started => {
                if let Some(tab_id) = event.tab_id {
                    if is_http_url(&event.url) {
                        self.tracked.lock().insert(
                            tab_id,
                            TrackedNavigation {
                                url: event.url.clone(),
                                recorded_at: event.timestamp,
                            },
                        );
                    }
                }
                Ok(None)
            }
            NetworkOutcome::Completed { status } => {
                if !self.blocked_status_codes.contains(status) {
                    return Ok(None);
                }
                self.record(event, Some(*status), None)
            }
            NetworkOutcome::Failed { error } => {
                if !is_likely_blocked_error(error) {
                    return Ok(None);
                }
                self.record(event, None, Some(error.clone()))
            }
        }
    }

    /// Drop what is remembered about a closed tab.
    pub fn forget_tab(&self, tab_id: TabId) {
        self.tracked.lock().remove(&tab_id);
    }

    pub fn tracked_tabs(&self) -> usize {
        self.tracked.lock().len()
    }

    /// The event URL when it is http(s), otherwise the tab's last top-level
    /// navigation if it is still within the window.
    fn resolve_url(&self, event: &NetworkEvent) -> Option<String> {
        if is_http_url(&event.url) {
            return Some(event.url.clone());
        }

        let tab_id = event.tab_id?;
        let mut tracked = self.tracked.lock();
        let entry = tracked.get(&tab_id)?;

        if event.timestamp.saturating_sub(entry.recorded_at) > self.window_ms {
            tracked.remove(&tab_id);
            return None;
        }
        Some(entry.url.clone())
    }

    fn record(
        &self,
        event: &NetworkEvent,
        status_code: Option<u16>,
        error: Option<String>,
    ) -> Result<Option<BlockedSitePrompt>, StoreError> {
        let Some(url) = self.resolve_url(event) else {
            return Ok(None);
        };

        let Some(parts) = parse_url(&url) else {
            return Ok(None);
        };

        let rules = load_rules(self.store.as_ref())?;
        if select(rules.rules(), &parts).rule.is_some() {
            debug!("{} failed but is already covered by a rule", parts.host);
            return Ok(None);
        }

        let prompt = BlockedSitePrompt {
            host: parts.host,
            url,
            time: event.timestamp,
            status_code,
            error,
        };

        info!(
            "Site {} looks blocked ({})",
            prompt.host,
            prompt
                .status_code
                .map(|s| s.to_string())
                .or_else(|| prompt.error.clone())
                .unwrap_or_default()
        );
        BLOCKED_SITE_ITEM.set(self.store.as_ref(), &Some(prompt.clone()))?;
        Ok(Some(prompt))
    }
}

/// Currently pending prompt
pub fn current_prompt(store: &dyn Store) -> Result<Option<BlockedSitePrompt>, StoreError> {
    Ok(BLOCKED_SITE_ITEM.get(store)?.flatten())
}

pub fn dismiss_blocked_prompt(store: &dyn Store) -> Result<(), StoreError> {
    BLOCKED_SITE_ITEM.set(store, &None)
}

/// Turn the prompt into a rule covering the site and its subdomains,
/// then clear the prompt.
pub fn accept_blocked_prompt(
    store: &dyn Store,
    prompt: &BlockedSitePrompt,
    target_type: TargetType,
    target: &ResolvedTarget,
) -> Result<Rule, StoreError> {
    let host = prompt.suggested_rule_host();

    let rule = edit_rules(store, |rules| {
        rules
            .upsert(&host, None, true, target_type, &target.target_id, &target.target_label)
            .clone()
    })?;

    dismiss_blocked_prompt(store)?;
    info!("Added rule {} for blocked site {}", rule.id, host);
    Ok(rule)
}

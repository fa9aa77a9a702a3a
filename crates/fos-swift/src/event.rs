//! Host event types.
//!
//! Each host channel gets an explicit event type here, so nothing
//! downstream deals with loosely typed payloads.

use crate::store::keys;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Unique identifier for a browser tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u64);

impl TabId {
    /// Create a new tab ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tab({})", self.0)
    }
}

/// What happened to a tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TabSignal {
    /// Top-level navigation committed
    NavigationCommitted,
    /// Top-level navigation finished loading
    NavigationCompleted,
    /// Tab became the active tab of its window
    Activated,
    /// Tab was closed
    Removed,
}

/// Tab activity source event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabEvent {
    pub tab_id: TabId,
    /// Current URL of the tab, absent for removals
    #[serde(default)]
    pub url: Option<String>,
    pub signal: TabSignal,
}

/// Type of resource being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Top-level document
    MainFrame,
    /// Embedded document
    SubFrame,
    Stylesheet,
    Script,
    Image,
    Font,
    #[serde(rename = "xmlhttprequest")]
    XmlHttpRequest,
    Media,
    #[serde(other)]
    Other,
}

/// Phase reported by the network observation source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NetworkOutcome {
    /// Request is about to be sent
    Started,
    /// Response received
    Completed { status: u16 },
    /// Request failed before a response, e.g. `net::ERR_CONNECTION_RESET`
    Failed { error: String },
}

/// Network observation source event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEvent {
    /// Originating tab, `None` for requests not tied to a tab
    #[serde(default)]
    pub tab_id: Option<TabId>,
    pub url: String,
    pub outcome: NetworkOutcome,
    pub resource_type: ResourceType,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl NetworkEvent {
    pub fn is_top_level(&self) -> bool {
        self.resource_type == ResourceType::MainFrame
    }
}

/// A persisted setting the engine depends on was rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsChange {
    Rules,
    Enabled,
    DisconnectOnUnmatched,
}

impl SettingsChange {
    /// Map a storage key to the setting it holds.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            keys::RULES => Some(Self::Rules),
            keys::ENABLED => Some(Self::Enabled),
            keys::DISCONNECT_ON_UNMATCHED => Some(Self::DisconnectOnUnmatched),
            _ => None,
        }
    }
}

/// One line of host input for the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "lowercase")]
pub enum HostEvent {
    Tab(TabEvent),
    Network(NetworkEvent),
    /// The UI wrote a setting (`value` is stored as-is under `key`)
    Settings { key: String, value: Value },
}

/// A tab that is active in a focused window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusedTab {
    pub tab_id: TabId,
    pub url: String,
}

/// Host query for the currently active/focused tabs.
pub trait TabQuery: Send + Sync {
    fn focused_tabs(&self) -> Vec<FocusedTab>;
}

/// Fixed set of focused tabs, e.g. the tabs a host reports at launch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticTabs(pub Vec<FocusedTab>);

impl TabQuery for StaticTabs {
    fn focused_tabs(&self) -> Vec<FocusedTab> {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_event_json() {
        let tab: HostEvent = serde_json::from_str(
            r#"{"channel":"tab","tab_id":3,"url":"https://a.com/","signal":"navigation-committed"}"#,
        )
        .unwrap();
        assert_eq!(
            tab,
            HostEvent::Tab(TabEvent {
                tab_id: TabId(3),
                url: Some("https://a.com/".into()),
                signal: TabSignal::NavigationCommitted,
            })
        );

        let net: HostEvent = serde_json::from_str(
            r#"{"channel":"network","tab_id":3,"url":"https://a.com/","resource_type":"main_frame",
                "timestamp":10,"outcome":{"kind":"failed","error":"net::ERR_CONNECTION_RESET"}}"#,
        )
        .unwrap();
        let HostEvent::Network(net) = net else {
            panic!("expected network event");
        };
        assert!(net.is_top_level());
        assert_eq!(net.outcome, NetworkOutcome::Failed { error: "net::ERR_CONNECTION_RESET".into() });

        let settings: HostEvent =
            serde_json::from_str(r#"{"channel":"settings","key":"swift-enabled","value":{"value":false}}"#)
                .unwrap();
        assert!(matches!(settings, HostEvent::Settings { .. }));
    }

    #[test]
    fn test_unknown_resource_type() {
        let ty: ResourceType = serde_json::from_str(r#""ping""#).unwrap();
        assert_eq!(ty, ResourceType::Other);
    }

    #[test]
    fn test_settings_change_from_key() {
        assert_eq!(SettingsChange::from_key("swift-rules"), Some(SettingsChange::Rules));
        assert_eq!(
            SettingsChange::from_key("swift-disconnect-on-unmatched"),
            Some(SettingsChange::DisconnectOnUnmatched)
        );
        assert_eq!(SettingsChange::from_key("swift-debug"), None);
    }

    #[test]
    fn test_tab_id_display() {
        assert_eq!(TabId::new(9).to_string(), "Tab(9)");
    }
}

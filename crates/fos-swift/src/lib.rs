//! fOS Swift Engine
//!
//! Routes the VPN by the site being browsed:
//! - Rule evaluation on navigation, activation and settings changes
//! - Active-rule ledger so only rule-owned connections are dropped
//! - Blocked-site detection with a one-click rule suggestion
//! - Heartbeat and decision trace for the UI
//!
//! # Architecture
//!
//! ```text
//!  tab events ──────┐                      ┌──▶ ConnectionManager
//!  network events ──┼──▶ Runtime ─▶ SwiftEngine (per-tab workers)
//!  store changes ───┘       │              └──▶ Store (ledger, debug)
//!                           └──▶ BlockedSiteDetector ──▶ Store (prompt)
//! ```

mod blocked;
mod clock;
mod config;
mod debug;
mod engine;
mod event;
mod heartbeat;
mod ledger;
mod runtime;
mod settings;
mod store;
mod target;
mod tracker;

pub use blocked::{
    accept_blocked_prompt, current_prompt, dismiss_blocked_prompt, is_likely_blocked_error,
    root_host, BlockedSiteDetector, BlockedSitePrompt, BLOCKED_SITE_ITEM,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, EngineConfigError};
pub use debug::{DebugAction, DebugEvent, DebugEventBus, DEBUG_ITEM};
pub use engine::{EngineError, Outcome, SwiftEngine};
pub use event::{
    FocusedTab, HostEvent, NetworkEvent, NetworkOutcome, ResourceType, SettingsChange, TabEvent,
    StaticTabs, TabId, TabQuery, TabSignal,
};
pub use heartbeat::{HeartbeatPublisher, HeartbeatRecord, HEARTBEAT_ITEM, MIN_HEARTBEAT_INTERVAL};
pub use ledger::{targets_connection, ActiveRuleLedger, ActiveRuleRecord, ACTIVE_RULE_ITEM};
pub use runtime::{FocusTracker, Runtime};
pub use settings::{
    add_rule_from_input, edit_rules, import_rules_into, load_rules, save_rules,
    set_disconnect_on_unmatched, set_enabled, RuleEditError, SwiftSettings,
    DISCONNECT_ON_UNMATCHED_ITEM, ENABLED_ITEM, RULES_ITEM,
};
pub use store::{keys, FileStore, MemoryStore, StorageItem, Store, StoreChange, StoreError};
pub use target::{find_endpoint, resolve_target, Endpoint, ResolvedTarget, SkipReason, TargetError};
pub use tracker::TabActivityTracker;

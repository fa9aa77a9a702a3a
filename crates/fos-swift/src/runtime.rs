//! Event runtime
//!
//! Drains the host subscriptions (tab activity, network observations and
//! storage changes) and routes them:
//!
//! - Evaluations go to one worker task per tab, so events of a tab are
//!   handled in order while other tabs proceed.
//! - Network observations feed the [`BlockedSiteDetector`]; top-level
//!   request starts are evaluated as navigations too.
//! - Settings changes reload the engine and re-check the focused tabs.
//!
//! The heartbeat runs alongside for as long as the runtime does.

use crate::blocked::BlockedSiteDetector;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::engine::SwiftEngine;
use crate::event::{
    FocusedTab, NetworkEvent, NetworkOutcome, SettingsChange, TabEvent, TabId, TabQuery,
    TabSignal,
};
use crate::heartbeat::HeartbeatPublisher;
use crate::store::Store;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Which tabs are on screen, derived from tab events
#[derive(Debug, Default)]
pub struct FocusTracker {
    inner: Mutex<FocusState>,
}

#[derive(Debug, Default)]
struct FocusState {
    focused: Option<TabId>,
    urls: HashMap<TabId, String>,
}

impl FocusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, event: &TabEvent) {
        let mut state = self.inner.lock();

        match event.signal {
            TabSignal::Removed => {
                state.urls.remove(&event.tab_id);
                if state.focused == Some(event.tab_id) {
                    state.focused = None;
                }
            }
            TabSignal::Activated => {
                state.focused = Some(event.tab_id);
                if let Some(url) = &event.url {
                    state.urls.insert(event.tab_id, url.clone());
                }
            }
            TabSignal::NavigationCommitted | TabSignal::NavigationCompleted => {
                if let Some(url) = &event.url {
                    state.urls.insert(event.tab_id, url.clone());
                }
                state.focused.get_or_insert(event.tab_id);
            }
        }
    }

    /// Last known URL of a tab
    pub fn url_of(&self, tab_id: TabId) -> Option<String> {
        self.inner.lock().urls.get(&tab_id).cloned()
    }
}

impl TabQuery for FocusTracker {
    fn focused_tabs(&self) -> Vec<FocusedTab> {
        let state = self.inner.lock();
        state
            .focused
            .and_then(|tab_id| {
                state.urls.get(&tab_id).map(|url| FocusedTab {
                    tab_id,
                    url: url.clone(),
                })
            })
            .into_iter()
            .collect()
    }
}

/// Work for a tab worker
#[derive(Debug)]
enum TabJob {
    Evaluate(String),
    /// Tab closed: forget it and stop
    Forget,
}

struct TabWorker {
    tx: mpsc::UnboundedSender<TabJob>,
    handle: JoinHandle<()>,
}

impl TabWorker {
    fn spawn(engine: Arc<SwiftEngine>, tab_id: TabId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            debug!("Tab worker {} started", tab_id);

            while let Some(job) = rx.recv().await {
                match job {
                    TabJob::Evaluate(url) => {
                        let outcome = engine.evaluate(tab_id, &url).await;
                        trace!("{} evaluated: {:?}", tab_id, outcome);
                    }
                    TabJob::Forget => {
                        engine.forget_tab(tab_id);
                        break;
                    }
                }
            }

            debug!("Tab worker {} stopped", tab_id);
        });

        Self { tx, handle }
    }
}

pub struct Runtime {
    engine: Arc<SwiftEngine>,
    store: Arc<dyn Store>,
    detector: BlockedSiteDetector,
    heartbeat: Arc<HeartbeatPublisher>,
    focus: Arc<FocusTracker>,
    config: EngineConfig,
    /// Host view of the focused tabs at launch
    host_tabs: Option<Arc<dyn TabQuery>>,
    workers: HashMap<TabId, TabWorker>,
    /// Workers told to stop that may still be draining
    finished: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub fn new(
        engine: Arc<SwiftEngine>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            detector: BlockedSiteDetector::new(store.clone(), &config),
            heartbeat: Arc::new(HeartbeatPublisher::new(store.clone(), clock)),
            focus: Arc::new(FocusTracker::new()),
            host_tabs: None,
            workers: HashMap::new(),
            finished: Vec::new(),
            engine,
            store,
            config,
        }
    }

    /// Seed focus from the host's tabs when the runtime starts.
    pub fn with_host_tabs(mut self, tabs: Arc<dyn TabQuery>) -> Self {
        self.host_tabs = Some(tabs);
        self
    }

    pub fn focus(&self) -> Arc<FocusTracker> {
        self.focus.clone()
    }

    /// Process events until both the tab and the network sources close,
    /// then wait for the tab workers to drain.
    pub async fn run(
        mut self,
        mut tabs: mpsc::Receiver<TabEvent>,
        mut network: mpsc::Receiver<NetworkEvent>,
    ) {
        info!("Swift runtime started");
        let heartbeat = self.heartbeat.clone().spawn(self.config.heartbeat_interval());
        let mut changes = self.store.subscribe();

        self.seed_focus();
        if self.engine.should_check_on_start() {
            self.recheck_on_start();
        }

        let mut tabs_open = true;
        let mut network_open = true;
        let mut changes_open = true;

        while tabs_open || network_open {
            tokio::select! {
                biased;

                change = changes.recv(), if changes_open => match change {
                    Ok(change) => self.on_store_change(&change.key),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} storage notifications, reloading settings", missed);
                        self.reload_all();
                    }
                    Err(RecvError::Closed) => changes_open = false,
                },
                event = tabs.recv(), if tabs_open => match event {
                    Some(event) => self.on_tab_event(event),
                    None => tabs_open = false,
                },
                event = network.recv(), if network_open => match event {
                    Some(event) => self.on_network_event(event),
                    None => network_open = false,
                },
            }
        }

        // Settings written right before the sources closed
        while let Ok(change) = changes.try_recv() {
            self.on_store_change(&change.key);
        }

        heartbeat.abort();
        self.shutdown().await;
        info!("Swift runtime stopped");
    }

    fn on_tab_event(&mut self, event: TabEvent) {
        self.focus.observe(&event);

        match event.signal {
            TabSignal::Removed => {
                self.detector.forget_tab(event.tab_id);
                match self.workers.remove(&event.tab_id) {
                    Some(worker) => {
                        let _ = worker.tx.send(TabJob::Forget);
                        self.retire(worker.handle);
                    }
                    None => self.engine.forget_tab(event.tab_id),
                }
            }
            TabSignal::NavigationCommitted | TabSignal::NavigationCompleted | TabSignal::Activated => {
                let url = event.url.or_else(|| self.focus.url_of(event.tab_id));
                if let Some(url) = url {
                    self.dispatch(event.tab_id, url);
                }
            }
        }
    }

    fn on_network_event(&mut self, event: NetworkEvent) {
        if let Err(e) = self.detector.on_network_event(&event) {
            warn!("Blocked-site detection failed: {}", e);
        }

        if event.outcome == NetworkOutcome::Started && event.is_top_level() {
            if let Some(tab_id) = event.tab_id {
                self.dispatch(tab_id, event.url);
            }
        }
    }

    fn on_store_change(&mut self, key: &str) {
        let Some(change) = SettingsChange::from_key(key) else {
            return;
        };

        match self.engine.apply_settings_change(change) {
            Ok(true) => self.recheck(),
            Ok(false) => {}
            Err(e) => warn!("Failed to reload {}: {}", key, e),
        }
    }

    fn reload_all(&mut self) {
        let mut recheck = false;
        for change in [
            SettingsChange::Rules,
            SettingsChange::Enabled,
            SettingsChange::DisconnectOnUnmatched,
        ] {
            match self.engine.apply_settings_change(change) {
                Ok(wanted) => recheck |= wanted,
                Err(e) => warn!("Failed to reload {:?}: {}", change, e),
            }
        }

        if recheck {
            self.recheck();
        }
    }

    fn seed_focus(&self) {
        let Some(host) = &self.host_tabs else {
            return;
        };

        for tab in host.focused_tabs() {
            self.focus.observe(&TabEvent {
                tab_id: tab.tab_id,
                url: Some(tab.url),
                signal: TabSignal::Activated,
            });
        }
    }

    /// Every tab the host reports focused, or the tracked focus without a host.
    fn recheck_on_start(&mut self) {
        let tabs = match &self.host_tabs {
            Some(host) => host.focused_tabs(),
            None => self.focus.focused_tabs(),
        };

        debug!("Startup check of {} focused tabs", tabs.len());
        for tab in tabs {
            self.dispatch(tab.tab_id, tab.url);
        }
    }

    /// Queue an evaluation of every focused tab.
    fn recheck(&mut self) {
        for tab in self.focus.focused_tabs() {
            self.dispatch(tab.tab_id, tab.url);
        }
    }

    fn dispatch(&mut self, tab_id: TabId, url: String) {
        let engine = &self.engine;
        let worker = self
            .workers
            .entry(tab_id)
            .or_insert_with(|| TabWorker::spawn(engine.clone(), tab_id));

        if let Err(mpsc::error::SendError(job)) = worker.tx.send(TabJob::Evaluate(url)) {
            warn!("Tab worker {} died, restarting", tab_id);
            let replacement = TabWorker::spawn(engine.clone(), tab_id);
            let _ = replacement.tx.send(job);
            let dead = std::mem::replace(worker, replacement);
            self.retire(dead.handle);
        }
    }

    /// Keep `handle` for shutdown, dropping handles of workers that already exited.
    fn retire(&mut self, handle: JoinHandle<()>) {
        self.finished.retain(|h| !h.is_finished());
        self.finished.push(handle);
    }

    async fn shutdown(mut self) {
        let mut handles = std::mem::take(&mut self.finished);
        // Closing the senders lets each worker finish its queue and exit.
        handles.extend(self.workers.drain().map(|(_, worker)| worker.handle));

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Tab worker panicked: {}", e);
            }
        }
    }
}

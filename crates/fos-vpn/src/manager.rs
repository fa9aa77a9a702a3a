//! VPN Manager
//!
//! In-process [`ConnectionManager`] that tracks state transitions without a
//! real tunnel. Used by the daemon and by engine tests.
//!
//! # Usage
//!
//! ```rust,ignore
//! let vpn = VpnManager::new();
//! vpn.connect(&logical, &server, ConnectOptions::default()).await?;
//! assert!(vpn.current_state().await.is_connected());
//! vpn.disconnect().await?;
//! ```

use crate::connection::{
    ConnectOptions, ConnectionManager, ConnectionState, ServerSummary, VpnError, VpnState,
};
use crate::directory::{Logical, PhysicalServer};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// VPN Manager
pub struct VpnManager {
    /// Current state
    state: RwLock<ConnectionState>,
    /// Flips to true once the manager accepts calls
    ready: watch::Sender<bool>,
    /// Connection started at
    connected_at: RwLock<Option<Instant>>,
    /// Make every connect attempt fail
    fail_connects: AtomicBool,
    connect_calls: AtomicU64,
    disconnect_calls: AtomicU64,
}

impl VpnManager {
    /// Create a ready, disconnected manager
    pub fn new() -> Self {
        let manager = Self::pending();
        manager.mark_ready();
        manager
    }

    /// Create a manager that is still restoring its state
    pub fn pending() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            state: RwLock::new(ConnectionState::disconnected()),
            ready,
            connected_at: RwLock::new(None),
            fail_connects: AtomicBool::new(false),
            connect_calls: AtomicU64::new(0),
            disconnect_calls: AtomicU64::new(0),
        }
    }

    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    /// Simulate a broken network: connects fail until switched back.
    pub fn set_fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::Relaxed);
    }

    /// Number of connect calls received
    pub fn connect_calls(&self) -> u64 {
        self.connect_calls.load(Ordering::Relaxed)
    }

    /// Number of disconnect calls received
    pub fn disconnect_calls(&self) -> u64 {
        self.disconnect_calls.load(Ordering::Relaxed)
    }

    /// Format status for display
    pub async fn status(&self) -> String {
        let state = self.state.read().await.clone();
        let uptime = self
            .connected_at
            .read()
            .await
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);

        match state.server {
            Some(server) => format!(
                "VPN: {:?} | {} ({}) | up {}s",
                state.state, server.name, server.exit_country, uptime
            ),
            None => format!("VPN: {:?}", state.state),
        }
    }
}

impl Default for VpnManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionManager for VpnManager {
    async fn wait_until_ready(&self) {
        let mut rx = self.ready.subscribe();
        // Only fails if the sender is dropped, and we own it.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    async fn current_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    async fn connect(
        &self,
        logical: &Logical,
        server: &PhysicalServer,
        options: ConnectOptions,
    ) -> Result<(), VpnError> {
        self.connect_calls.fetch_add(1, Ordering::Relaxed);
        info!(
            "Connecting to {} via {} (notify: {})",
            logical.name, server.id, !options.suppress_notification
        );

        *self.state.write().await = ConnectionState {
            state: VpnState::Connecting,
            server: Some(ServerSummary::from(logical)),
        };

        let failure = if !server.is_up() {
            Some(VpnError::ServerDown(server.id.clone()))
        } else if self.fail_connects.load(Ordering::Relaxed) {
            Some(VpnError::ConnectionFailed(format!("{} unreachable", logical.name)))
        } else {
            None
        };

        if let Some(e) = failure {
            warn!("VPN connection failed: {}", e);
            *self.state.write().await = ConnectionState {
                state: VpnState::Failed,
                server: None,
            };
            return Err(e);
        }

        self.state.write().await.state = VpnState::Connected;
        *self.connected_at.write().await = Some(Instant::now());
        info!("VPN connected to {}", logical.name);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), VpnError> {
        self.disconnect_calls.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.write().await;
        if !state.is_connected() {
            debug!("Disconnect requested while {:?}", state.state);
        }
        *state = ConnectionState::disconnected();
        *self.connected_at.write().await = None;

        info!("VPN disconnected");
        Ok(())
    }
}

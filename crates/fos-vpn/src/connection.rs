//! Connection Manager seam
//!
//! The engine never drives the tunnel itself. It asks a [`ConnectionManager`]
//! for the live state and issues connect/disconnect calls through it.

use crate::directory::{Logical, PhysicalServer};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// VPN connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnState {
    /// VPN is disconnected
    Disconnected,
    /// VPN is connecting
    Connecting,
    /// VPN is connected and ready
    Connected,
    /// Connection failed
    Failed,
}

impl VpnState {
    /// Check if VPN is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, VpnState::Connected)
    }

    /// Check if VPN is in a failure state
    pub fn is_failed(&self) -> bool {
        matches!(self, VpnState::Failed)
    }
}

/// The server the connection currently targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSummary {
    /// Logical id
    pub id: String,
    pub name: String,
    pub exit_country: String,
}

impl From<&Logical> for ServerSummary {
    fn from(logical: &Logical) -> Self {
        Self {
            id: logical.id.clone(),
            name: logical.name.clone(),
            exit_country: logical.exit_country.clone(),
        }
    }
}

/// Snapshot of the live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub state: VpnState,
    /// Target of the connection, kept while connecting and connected
    pub server: Option<ServerSummary>,
}

impl ConnectionState {
    pub fn disconnected() -> Self {
        Self {
            state: VpnState::Disconnected,
            server: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn server_id(&self) -> Option<&str> {
        self.server.as_ref().map(|s| s.id.as_str())
    }

    pub fn exit_country(&self) -> Option<&str> {
        self.server.as_ref().map(|s| s.exit_country.as_str())
    }
}

/// Options for [`ConnectionManager::connect`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Don't show the "connected" notification (automatic connects)
    pub suppress_notification: bool,
}

/// Connection manager errors
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error("VPN not connected")]
    NotConnected,

    #[error("Server {0} is down")]
    ServerDown(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout")]
    Timeout,
}

/// Owner of the live VPN connection
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Resolve once the manager has restored its state and accepts calls.
    async fn wait_until_ready(&self);

    /// Current connection snapshot.
    async fn current_state(&self) -> ConnectionState;

    /// Connect to `server` of `logical`, replacing any current connection.
    async fn connect(
        &self,
        logical: &Logical,
        server: &PhysicalServer,
        options: ConnectOptions,
    ) -> Result<(), VpnError>;

    /// Drop the current connection.
    async fn disconnect(&self) -> Result<(), VpnError>;
}

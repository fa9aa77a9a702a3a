//! fOS VPN - Directory and Connection Seams
//!
//! The Swift engine decides *where* to connect; this crate describes what
//! can be connected to and who performs the connection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  eligible logicals   ┌──────────────────┐
//! │  Directory   │─────────────────────▶│   Swift engine   │
//! │ (servers,    │  best_logical()      │                  │
//! │  tiers,      │                      └────────┬─────────┘
//! │  countries)  │                               │ connect / disconnect
//! └──────────────┘                               ▼
//!                                       ┌──────────────────┐
//!                                       │ConnectionManager │
//!                                       │   (VpnManager)   │
//!                                       └──────────────────┘
//! ```

mod connection;
mod directory;
mod manager;

pub use connection::{
    ConnectOptions, ConnectionManager, ConnectionState, ServerSummary, VpnError, VpnState,
};
pub use directory::{
    features, CountryEntry, CountryInfo, CountryList, Directory, DirectoryConfig,
    DirectoryError, FeatureFilter, Logical, PhysicalServer, StaticDirectory,
};
pub use manager::VpnManager;

//! Server Directory
//!
//! The directory knows which logical servers exist, which of them the user
//! may use, and how to rank them. The engine only consumes it through the
//! [`Directory`] trait; [`StaticDirectory`] serves a fixed list loaded from
//! a TOML or JSON file.
//!
//! # Example directory file
//!
//! ```toml
//! user_tier = 2
//! secure_core = false
//!
//! [[countries]]
//! code = "DE"
//! name = "Germany"
//!
//! [[logicals]]
//! id = "42"
//! name = "DE#1"
//! exit_country = "DE"
//! tier = 2
//! servers = [{ id = "42-a", status = 1, load = 30 }]
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Logical server feature bits
pub mod features {
    pub const SECURE_CORE: u32 = 1;
    pub const TOR: u32 = 2;
    pub const P2P: u32 = 4;
    pub const STREAMING: u32 = 8;
}

/// One physical machine behind a logical server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalServer {
    pub id: String,
    /// 1 = up, 0 = down (directory API convention)
    #[serde(default = "default_status")]
    pub status: u8,
    /// Load percentage
    #[serde(default)]
    pub load: u8,
}

fn default_status() -> u8 {
    1
}

impl PhysicalServer {
    pub fn is_up(&self) -> bool {
        self.status == 1
    }
}

/// A connectable endpoint as listed by the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Logical {
    pub id: String,
    pub name: String,
    /// Exit country code (uppercase ISO-3166 alpha-2)
    pub exit_country: String,
    /// Entry country, differs from the exit for secure-core servers
    #[serde(default)]
    pub entry_country: Option<String>,
    /// Minimum subscription tier
    #[serde(default)]
    pub tier: u8,
    /// Feature bit set, see [`features`]
    #[serde(default)]
    pub features: u32,
    #[serde(default)]
    pub servers: Vec<PhysicalServer>,
}

impl Logical {
    pub fn has_feature(&self, feature: u32) -> bool {
        self.features & feature != 0
    }

    /// Pick the least loaded physical server that is up.
    pub fn pick_server(&self) -> Option<&PhysicalServer> {
        self.servers
            .iter()
            .filter(|s| s.is_up())
            .min_by_key(|s| s.load)
    }
}

/// Display names of a country
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryInfo {
    /// Localized name
    pub name: String,
    /// Canonical English name, when different from the localized one
    #[serde(default)]
    pub english_name: Option<String>,
}

/// Country code → names. Ordered so lookups are deterministic.
pub type CountryList = BTreeMap<String, CountryInfo>;

/// Feature filters that currently apply to connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFilter {
    /// `Some(true)` keeps only secure-core servers, `Some(false)` excludes
    /// them, `None` doesn't filter.
    #[serde(default)]
    pub secure_core: Option<bool>,
}

impl FeatureFilter {
    /// Is `logical` eligible for a user of `user_tier` under this filter?
    pub fn is_eligible(&self, logical: &Logical, user_tier: u8) -> bool {
        if logical.tier > user_tier {
            return false;
        }

        match self.secure_core {
            Some(wanted) => logical.has_feature(features::SECURE_CORE) == wanted,
            None => true,
        }
    }

    /// Keep eligible logicals, preserving order.
    pub fn filter(&self, logicals: Vec<Logical>, user_tier: u8) -> Vec<Logical> {
        logicals
            .into_iter()
            .filter(|l| self.is_eligible(l, user_tier))
            .collect()
    }
}

/// Directory errors
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported directory format")]
    UnsupportedFormat,

    #[error("Lookup failed: {0}")]
    Lookup(String),
}

/// Server directory collaborator
#[async_trait]
pub trait Directory: Send + Sync {
    /// Maximum tier of the signed-in user, `None` when nobody is signed in.
    async fn user_max_tier(&self) -> Result<Option<u8>, DirectoryError>;

    /// All logical servers, in the directory's preferred order.
    async fn logicals(&self) -> Result<Vec<Logical>, DirectoryError>;

    /// Remote lookup of a logical by its display name.
    async fn lookup(&self, name: &str) -> Result<Option<Logical>, DirectoryError>;

    /// Feature filters currently selected by the user.
    fn feature_filter(&self) -> FeatureFilter;

    /// Country names used to resolve typed country targets.
    fn countries(&self) -> CountryList;

    /// Best logical among `candidates`, which are already eligible.
    ///
    /// Must return one of the candidates, or `None` only when there are none.
    fn best_logical(&self, candidates: &[Logical], user_tier: u8) -> Option<Logical>;
}

/// Directory file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// `None` means signed out
    #[serde(default)]
    pub user_tier: Option<u8>,
    #[serde(default)]
    pub secure_core: Option<bool>,
    #[serde(default)]
    pub countries: Vec<CountryEntry>,
    #[serde(default)]
    pub logicals: Vec<Logical>,
}

/// Country entry in a directory file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountryEntry {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub english_name: Option<String>,
}

impl DirectoryConfig {
    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, DirectoryError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| DirectoryError::Io(e.to_string()))?;

        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            _ => Err(DirectoryError::UnsupportedFormat),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, DirectoryError> {
        toml::from_str(content).map_err(|e| DirectoryError::Parse(e.to_string()))
    }

    pub fn from_json(content: &str) -> Result<Self, DirectoryError> {
        serde_json::from_str(content).map_err(|e| DirectoryError::Parse(e.to_string()))
    }
}

/// Directory backed by a fixed server list.
///
/// Ranking keeps the list order: the first eligible candidate is the best.
pub struct StaticDirectory {
    config: DirectoryConfig,
}

impl StaticDirectory {
    pub fn new(config: DirectoryConfig) -> Self {
        info!(
            "Static directory with {} logicals, {} countries",
            config.logicals.len(),
            config.countries.len()
        );
        Self { config }
    }

    pub fn from_file(path: &Path) -> Result<Self, DirectoryError> {
        Ok(Self::new(DirectoryConfig::from_file(path)?))
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn user_max_tier(&self) -> Result<Option<u8>, DirectoryError> {
        Ok(self.config.user_tier)
    }

    async fn logicals(&self) -> Result<Vec<Logical>, DirectoryError> {
        Ok(self.config.logicals.clone())
    }

    async fn lookup(&self, name: &str) -> Result<Option<Logical>, DirectoryError> {
        debug!("Looking up logical {:?}", name);
        Ok(self
            .config
            .logicals
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    fn feature_filter(&self) -> FeatureFilter {
        FeatureFilter {
            secure_core: self.config.secure_core,
        }
    }

    fn countries(&self) -> CountryList {
        self.config
            .countries
            .iter()
            .map(|c| {
                (
                    c.code.clone(),
                    CountryInfo {
                        name: c.name.clone(),
                        english_name: c.english_name.clone(),
                    },
                )
            })
            .collect()
    }

    fn best_logical(&self, candidates: &[Logical], _user_tier: u8) -> Option<Logical> {
        candidates.first().cloned()
    }
}

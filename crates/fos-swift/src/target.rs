//! Target resolution
//!
//! Two directions:
//! - [`resolve_target`] turns what the user typed ("CH#7", "Switzerland")
//!   into the `(target_id, target_label)` stored on a rule.
//! - [`find_endpoint`] turns a stored rule target back into a concrete,
//!   currently eligible logical and physical server.

use fos_rules::{Rule, TargetType};
use fos_vpn::{CountryList, Directory, DirectoryError, Logical, PhysicalServer};
use thiserror::Error;
use tracing::debug;

/// Why typed target input could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("No target entered")]
    EmptyInput,

    #[error("Server not found")]
    ServerNotFound,

    #[error("Server requires a higher plan")]
    ServerUpgradeRequired,

    #[error("Country not found")]
    CountryNotFound,
}

impl TargetError {
    /// Stable reason code
    pub fn code(&self) -> &'static str {
        match self {
            TargetError::EmptyInput => "empty-input",
            TargetError::ServerNotFound => "server-not-found",
            TargetError::ServerUpgradeRequired => "server-upgrade-required",
            TargetError::CountryNotFound => "country-not-found",
        }
    }
}

/// Target reference to store on a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub target_id: String,
    pub target_label: String,
}

/// Resolve typed input against the directory contents.
///
/// Servers match by exact id, then by case-insensitive name. Countries
/// match by code, then by localized or English name, case-insensitively.
pub fn resolve_target(
    target_type: TargetType,
    input: &str,
    logicals: &[Logical],
    user_max_tier: u8,
    countries: &CountryList,
) -> Result<ResolvedTarget, TargetError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(TargetError::EmptyInput);
    }

    match target_type {
        TargetType::Server => {
            let logical = logicals
                .iter()
                .find(|l| l.id == trimmed)
                .or_else(|| logicals.iter().find(|l| l.name.eq_ignore_ascii_case(trimmed)))
                .ok_or(TargetError::ServerNotFound)?;

            if logical.tier > user_max_tier {
                return Err(TargetError::ServerUpgradeRequired);
            }

            Ok(ResolvedTarget {
                target_id: logical.id.clone(),
                target_label: logical.name.clone(),
            })
        }
        TargetType::Country => {
            let lowered = trimmed.to_lowercase();
            let (code, info) = countries
                .iter()
                .find(|(code, _)| code.to_lowercase() == lowered)
                .or_else(|| {
                    countries.iter().find(|(_, info)| {
                        info.name.to_lowercase() == lowered
                            || info
                                .english_name
                                .as_deref()
                                .is_some_and(|name| name.to_lowercase() == lowered)
                    })
                })
                .ok_or(TargetError::CountryNotFound)?;

            let target_label = if info.name.is_empty() {
                code.clone()
            } else {
                info.name.clone()
            };

            Ok(ResolvedTarget {
                target_id: code.clone(),
                target_label,
            })
        }
    }
}

/// Why a matched rule did not lead to a connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The server target is gone or not eligible
    ServerNotAvailable,
    /// No eligible server in the target country
    CountryNotAvailable,
    /// The chosen logical has no server up
    NoServerUp,
    /// Nobody is signed in
    NoUser,
    /// The live connection already points at the target
    AlreadyConnected,
    /// The feature is switched off
    Disabled,
}

impl SkipReason {
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::ServerNotAvailable => "server-not-available",
            SkipReason::CountryNotAvailable => "country-not-available",
            SkipReason::NoServerUp => "no-server-up",
            SkipReason::NoUser => "no-user",
            SkipReason::AlreadyConnected => "already-connected",
            SkipReason::Disabled => "disabled",
        }
    }
}

/// Logical and physical server to connect to
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub logical: Logical,
    pub server: PhysicalServer,
}

/// Find an eligible endpoint for `rule`'s target.
///
/// `Ok(Err(reason))` is a normal outcome (nothing eligible right now);
/// `Err(_)` means the directory itself failed.
pub async fn find_endpoint(
    rule: &Rule,
    directory: &dyn Directory,
    user_tier: u8,
) -> Result<Result<Endpoint, SkipReason>, DirectoryError> {
    let logicals = directory.logicals().await?;
    let filter = directory.feature_filter();

    let logical = match rule.target_type {
        TargetType::Server => {
            let by_id = logicals.iter().find(|l| l.id == rule.target_id).cloned();
            let by_name = if rule.target_label.is_empty() {
                None
            } else {
                logicals
                    .iter()
                    .find(|l| l.name.eq_ignore_ascii_case(&rule.target_label))
                    .cloned()
            };
            let looked_up = if by_id.is_none() && by_name.is_none() && !rule.target_label.is_empty() {
                debug!("{} not in directory, looking up {:?}", rule.target_id, rule.target_label);
                directory.lookup(&rule.target_label).await?
            } else {
                None
            };

            let candidates: Vec<Logical> = [by_id, by_name, looked_up].into_iter().flatten().collect();
            filter.filter(candidates, user_tier).into_iter().next()
        }
        TargetType::Country => {
            let in_country: Vec<Logical> = logicals
                .into_iter()
                .filter(|l| l.exit_country == rule.target_id)
                .collect();
            let eligible = filter.filter(in_country, user_tier);

            if eligible.is_empty() {
                None
            } else {
                directory.best_logical(&eligible, user_tier)
            }
        }
    };

    let Some(logical) = logical else {
        return Ok(Err(match rule.target_type {
            TargetType::Server => SkipReason::ServerNotAvailable,
            TargetType::Country => SkipReason::CountryNotAvailable,
        }));
    };

    let Some(server) = logical.pick_server().cloned() else {
        return Ok(Err(SkipReason::NoServerUp));
    };

    Ok(Ok(Endpoint { logical, server }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fos_vpn::{features, CountryInfo, DirectoryConfig, StaticDirectory};

    fn logical(id: &str, name: &str, country: &str, tier: u8) -> Logical {
        Logical {
            id: id.into(),
            name: name.into(),
            exit_country: country.into(),
            entry_country: None,
            tier,
            features: 0,
            servers: vec![PhysicalServer { id: format!("{}-a", id), status: 1, load: 20 }],
        }
    }

    fn countries() -> CountryList {
        let mut countries = CountryList::new();
        countries.insert(
            "CH".into(),
            CountryInfo { name: "Suisse".into(), english_name: Some("Switzerland".into()) },
        );
        countries.insert("DE".into(), CountryInfo { name: "Germany".into(), english_name: None });
        countries
    }

    fn rule(target_type: TargetType, target_id: &str, target_label: &str) -> Rule {
        Rule {
            id: "r1".into(),
            host: "example.com".into(),
            path: None,
            include_subdomains: false,
            enabled: true,
            target_type,
            target_id: target_id.into(),
            target_label: target_label.into(),
        }
    }

    #[test]
    fn test_resolve_server() {
        let logicals = vec![logical("1", "CH#1", "CH", 0), logical("2", "CH#2", "CH", 2)];

        assert_eq!(
            resolve_target(TargetType::Server, " ch#1 ", &logicals, 0, &countries()),
            Ok(ResolvedTarget { target_id: "1".into(), target_label: "CH#1".into() })
        );
        assert_eq!(
            resolve_target(TargetType::Server, "1", &logicals, 0, &countries()).map(|t| t.target_label),
            Ok("CH#1".into())
        );
        assert_eq!(
            resolve_target(TargetType::Server, "CH#2", &logicals, 0, &countries()),
            Err(TargetError::ServerUpgradeRequired)
        );
        assert_eq!(
            resolve_target(TargetType::Server, "CH#9", &logicals, 2, &countries()),
            Err(TargetError::ServerNotFound)
        );
        assert_eq!(
            resolve_target(TargetType::Server, "   ", &logicals, 2, &countries()).map_err(|e| e.code()),
            Err("empty-input")
        );
    }

    #[test]
    fn test_resolve_country() {
        let by_code = resolve_target(TargetType::Country, "ch", &[], 0, &countries()).unwrap();
        assert_eq!(by_code.target_id, "CH");
        assert_eq!(by_code.target_label, "Suisse");

        let by_english = resolve_target(TargetType::Country, "switzerland", &[], 0, &countries()).unwrap();
        assert_eq!(by_english.target_id, "CH");

        let by_name = resolve_target(TargetType::Country, "GERMANY", &[], 0, &countries()).unwrap();
        assert_eq!(by_name.target_id, "DE");

        assert_eq!(
            resolve_target(TargetType::Country, "Atlantis", &[], 0, &countries()).map_err(|e| e.code()),
            Err("country-not-found")
        );
    }

    fn directory(logicals: Vec<Logical>, secure_core: Option<bool>) -> StaticDirectory {
        StaticDirectory::new(DirectoryConfig {
            user_tier: Some(2),
            secure_core,
            countries: Vec::new(),
            logicals,
        })
    }

    #[tokio::test]
    async fn test_server_endpoint_by_id_then_label() {
        let dir = directory(vec![logical("1", "CH#1", "CH", 0), logical("2", "DE#2", "DE", 0)], None);

        let by_id = find_endpoint(&rule(TargetType::Server, "2", "stale"), &dir, 2).await.unwrap().unwrap();
        assert_eq!(by_id.logical.id, "2");
        assert_eq!(by_id.server.id, "2-a");

        // Logical was renumbered, the label still finds it
        let by_label = find_endpoint(&rule(TargetType::Server, "99", "ch#1"), &dir, 2).await.unwrap().unwrap();
        assert_eq!(by_label.logical.id, "1");

        assert_eq!(
            find_endpoint(&rule(TargetType::Server, "99", "XX#9"), &dir, 2).await.unwrap(),
            Err(SkipReason::ServerNotAvailable)
        );
    }

    #[tokio::test]
    async fn test_server_endpoint_respects_tier() {
        let dir = directory(vec![logical("1", "CH#1", "CH", 2)], None);
        assert_eq!(
            find_endpoint(&rule(TargetType::Server, "1", "CH#1"), &dir, 0).await.unwrap(),
            Err(SkipReason::ServerNotAvailable)
        );
    }

    #[tokio::test]
    async fn test_country_endpoint() {
        let mut secure = logical("3", "CH-SC#3", "CH", 0);
        secure.features = features::SECURE_CORE;
        let logicals = vec![logical("1", "DE#1", "DE", 0), secure, logical("2", "CH#2", "CH", 0)];

        let dir = directory(logicals.clone(), None);
        let endpoint = find_endpoint(&rule(TargetType::Country, "CH", "Suisse"), &dir, 2).await.unwrap().unwrap();
        assert_eq!(endpoint.logical.id, "3");

        let dir = directory(logicals, Some(false));
        let endpoint = find_endpoint(&rule(TargetType::Country, "CH", "Suisse"), &dir, 2).await.unwrap().unwrap();
        assert_eq!(endpoint.logical.id, "2");

        assert_eq!(
            find_endpoint(&rule(TargetType::Country, "FR", "France"), &dir, 2).await.unwrap(),
            Err(SkipReason::CountryNotAvailable)
        );
    }

    #[tokio::test]
    async fn test_no_server_up() {
        let mut down = logical("1", "CH#1", "CH", 0);
        down.servers[0].status = 0;
        let dir = directory(vec![down], None);

        assert_eq!(
            find_endpoint(&rule(TargetType::Country, "CH", "Suisse"), &dir, 2).await.unwrap(),
            Err(SkipReason::NoServerUp)
        );
    }
}
